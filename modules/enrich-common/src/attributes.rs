//! Per-product-type attribute sets.
//!
//! Each `ProductType` selects a closed set of attribute names the pipeline
//! tries to fill. The shapes differ (accessories are diameter-defined,
//! liquids volume-defined) but all expose the same normalizable
//! name → `EnrichedField` map, so merge, gap-fill, and validation stay
//! shape-agnostic.

use crate::types::ProductType;

/// How an attribute's value is interpreted during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Linear dimension, normalized to cm.
    Length,
    /// Mass, normalized to kg.
    Weight,
    /// Volume, normalized to L.
    Volume,
    Color,
    Country,
    ImageUrl,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub kind: AttributeKind,
    /// Critical attributes trigger gap-fill when unresolved after extract.
    pub critical: bool,
}

const fn attr(name: &'static str, kind: AttributeKind, critical: bool) -> AttributeSpec {
    AttributeSpec {
        name,
        kind,
        critical,
    }
}

const COMMON: &[AttributeSpec] = &[
    attr("color", AttributeKind::Color, true),
    attr("country_of_origin", AttributeKind::Country, true),
    attr("image_url", AttributeKind::ImageUrl, false),
    attr("short_description", AttributeKind::Text, false),
];

const STANDARD: &[AttributeSpec] = &[
    attr("height", AttributeKind::Length, false),
    attr("length", AttributeKind::Length, false),
    attr("width", AttributeKind::Length, false),
    attr("weight", AttributeKind::Weight, true),
    attr("packaged_weight", AttributeKind::Weight, true),
];

const ACCESSORY: &[AttributeSpec] = &[
    attr("diameter", AttributeKind::Length, true),
    attr("thickness", AttributeKind::Length, false),
    attr("weight", AttributeKind::Weight, true),
];

const LIQUID: &[AttributeSpec] = &[
    attr("volume", AttributeKind::Volume, true),
    attr("container_height", AttributeKind::Length, false),
    attr("container_width", AttributeKind::Length, false),
    attr("weight", AttributeKind::Weight, true),
];

/// The attribute set for a product type: type-specific specs then common ones.
pub fn attribute_specs(product_type: ProductType) -> Vec<AttributeSpec> {
    let specific: &[AttributeSpec] = match product_type {
        ProductType::Accessory => ACCESSORY,
        ProductType::Liquid => LIQUID,
        ProductType::StandardProduct
        | ProductType::SoftGood
        | ProductType::Electronics
        | ProductType::Other => STANDARD,
    };
    specific.iter().chain(COMMON.iter()).copied().collect()
}

/// Names of attributes whose absence triggers gap-fill.
pub fn critical_attributes(product_type: ProductType) -> Vec<&'static str> {
    attribute_specs(product_type)
        .into_iter()
        .filter(|a| a.critical)
        .map(|a| a.name)
        .collect()
}

pub fn attribute_kind(product_type: ProductType, name: &str) -> Option<AttributeKind> {
    attribute_specs(product_type)
        .into_iter()
        .find(|a| a.name == name)
        .map(|a| a.kind)
}

/// Kind lookup across every attribute set. Names mean the same thing in
/// all sets, so the first match is authoritative.
pub fn kind_of(name: &str) -> Option<AttributeKind> {
    [STANDARD, ACCESSORY, LIQUID, COMMON]
        .iter()
        .flat_map(|set| set.iter())
        .find(|a| a.name == name)
        .map(|a| a.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liquids_are_volume_defined() {
        let specs = attribute_specs(ProductType::Liquid);
        assert!(specs.iter().any(|a| a.name == "volume" && a.critical));
        assert!(!specs.iter().any(|a| a.name == "height"));
    }

    #[test]
    fn accessories_are_diameter_defined() {
        let critical = critical_attributes(ProductType::Accessory);
        assert!(critical.contains(&"diameter"));
        assert!(critical.contains(&"weight"));
    }

    #[test]
    fn every_type_carries_the_common_attributes() {
        for pt in [
            ProductType::StandardProduct,
            ProductType::Accessory,
            ProductType::Liquid,
            ProductType::SoftGood,
            ProductType::Electronics,
            ProductType::Other,
        ] {
            let specs = attribute_specs(pt);
            assert!(specs.iter().any(|a| a.name == "color"));
            assert!(specs.iter().any(|a| a.name == "country_of_origin"));
        }
    }
}

//! Unit normalization for merged fields.
//!
//! Extraction keeps units exactly as the page wrote them; validation
//! brings every measurement to house units (cm / kg / L) so downstream
//! consumers never see a mixed-unit record.

use enrich_common::attributes::AttributeKind;
use enrich_common::{EnrichedField, FieldValue};

/// The unit a normalized field of this kind carries.
pub fn target_unit(kind: AttributeKind) -> Option<&'static str> {
    match kind {
        AttributeKind::Length => Some("cm"),
        AttributeKind::Weight => Some("kg"),
        AttributeKind::Volume => Some("L"),
        _ => None,
    }
}

/// Convert `value` in `unit` to the house unit for `kind`.
/// Returns None for units we do not recognize.
pub fn convert(kind: AttributeKind, value: f64, unit: &str) -> Option<f64> {
    let unit = unit.trim().to_lowercase();
    let factor = match kind {
        AttributeKind::Length => match unit.as_str() {
            "mm" => 0.1,
            "cm" => 1.0,
            "m" => 100.0,
            "in" | "inch" | "inches" | "\"" => 2.54,
            _ => return None,
        },
        AttributeKind::Weight => match unit.as_str() {
            "g" | "gram" | "grams" => 0.001,
            "kg" => 1.0,
            "lb" | "lbs" | "pound" | "pounds" => 0.453_592,
            "oz" => 0.028_349_5,
            _ => return None,
        },
        AttributeKind::Volume => match unit.as_str() {
            "ml" => 0.001,
            "cl" => 0.01,
            "l" | "liter" | "liters" | "litre" | "litres" => 1.0,
            _ => return None,
        },
        _ => return None,
    };
    Some(round3(value * factor))
}

/// Outcome of normalizing one field: the (possibly converted) field and a
/// problem description when conversion was impossible.
pub struct Normalized {
    pub field: EnrichedField,
    pub issue: Option<String>,
}

/// Normalize a resolved field to house units. Non-measurement kinds and
/// unresolved fields pass through untouched.
pub fn normalize_field(kind: AttributeKind, field: &EnrichedField) -> Normalized {
    let Some(target) = target_unit(kind) else {
        return Normalized {
            field: field.clone(),
            issue: None,
        };
    };
    let Some(value) = field.value.as_ref() else {
        return Normalized {
            field: field.clone(),
            issue: None,
        };
    };

    let Some(number) = value.as_number() else {
        return Normalized {
            field: field.clone(),
            issue: Some(format!("value '{value}' is not numeric")),
        };
    };

    let unit = field.unit.as_deref().unwrap_or(target);
    match convert(kind, number, unit) {
        Some(converted) => {
            let mut normalized = field.clone();
            normalized.value = Some(FieldValue::Number(converted));
            normalized.unit = Some(target.to_string());
            Normalized {
                field: normalized,
                issue: None,
            }
        }
        None => Normalized {
            field: field.clone(),
            issue: Some(format!("unrecognized unit '{unit}'")),
        },
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

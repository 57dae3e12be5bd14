//! Survivorship merge: combine per-field extractions from multiple sources
//! into a single winning value.
//!
//! Pure functions, no external calls. The result is deterministic for a
//! given candidate set regardless of the order candidates arrive in.

use std::collections::BTreeMap;

use enrich_common::attributes::{kind_of, AttributeKind};
use enrich_common::{ConfidenceTier, DimensionType, EnrichedField, FieldValue};

/// Tunable survivorship thresholds. Defaults match the standard policy;
/// callers may loosen or tighten per deployment.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    /// How many distinct non-manufacturer sources must agree before a
    /// value is accepted without an official source.
    pub agreement_threshold: usize,
    /// Whether a lone usable candidate is accepted (annotated) or dropped.
    pub accept_single_source: bool,
    /// Two numeric values within this absolute distance count as agreeing.
    pub numeric_tolerance: f64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            agreement_threshold: 2,
            accept_single_source: true,
            numeric_tolerance: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub field: EnrichedField,
    /// Set when conflicting sources could not be reconciled.
    pub needs_review: bool,
}

/// Pick the winning value for `field_name` among candidate extractions.
///
/// Order of precedence: official (manufacturer) source wins outright;
/// otherwise agreement between distinct sources; otherwise a single usable
/// candidate; otherwise no value at all, with the conflict recorded in the
/// notes and the product flagged for review.
pub fn merge(field_name: &str, candidates: &[EnrichedField], policy: &MergePolicy) -> MergeResult {
    let is_dimension = matches!(
        kind_of(field_name),
        Some(AttributeKind::Length | AttributeKind::Weight | AttributeKind::Volume)
    );

    let mut usable: Vec<&EnrichedField> = candidates
        .iter()
        .filter(|c| c.value.is_some() && c.confidence != ConfidenceTier::NotFound)
        .collect();

    // Deterministic processing order, independent of arrival order.
    usable.sort_by(|a, b| {
        (a.confidence as u8, &a.source_url, display(a)).cmp(&(
            b.confidence as u8,
            &b.source_url,
            display(b),
        ))
    });

    // Dimension fields: product measurements beat packaging ones when both
    // are on offer.
    if is_dimension
        && usable
            .iter()
            .any(|c| c.dimension_type == DimensionType::Product)
    {
        usable.retain(|c| c.dimension_type == DimensionType::Product);
    }

    if usable.is_empty() {
        return MergeResult {
            field: EnrichedField::default(),
            needs_review: false,
        };
    }

    if let Some(official) = usable
        .iter()
        .find(|c| c.confidence == ConfidenceTier::Official)
    {
        return finish((*official).clone(), is_dimension, false);
    }

    // Group by normalized value; a group backed by enough distinct sources
    // wins as third-party consensus.
    let mut groups: BTreeMap<String, Vec<&EnrichedField>> = BTreeMap::new();
    for c in &usable {
        groups
            .entry(normalize_value(c, policy))
            .or_default()
            .push(c);
    }

    let mut consensus: Vec<(&String, &Vec<&EnrichedField>)> = groups
        .iter()
        .filter(|(_, members)| distinct_sources(members) >= policy.agreement_threshold)
        .collect();
    // Largest backing first; key breaks ties so permutations agree.
    consensus.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

    if let Some((_, members)) = consensus.first() {
        let mut field = members[0].clone();
        field.confidence = ConfidenceTier::ThirdParty;
        return finish(field, is_dimension, false);
    }

    if usable.len() == 1 && policy.accept_single_source {
        let mut field = usable[0].clone();
        field.notes = Some("single source".to_string());
        return finish(field, is_dimension, false);
    }

    // Multiple disagreeing candidates and nothing authoritative: refuse to
    // guess, surface the conflict.
    let mut values: Vec<String> = usable.iter().map(|c| display(c)).collect();
    values.sort();
    values.dedup();

    MergeResult {
        field: EnrichedField {
            notes: Some(format!("sources disagree: {}", values.join(", "))),
            ..EnrichedField::default()
        },
        needs_review: true,
    }
}

fn finish(mut field: EnrichedField, is_dimension: bool, needs_review: bool) -> MergeResult {
    // Unlabeled dimension values are assumed to include packaging:
    // understating is recoverable, overstating is not.
    if is_dimension && field.dimension_type == DimensionType::Na {
        field.dimension_type = DimensionType::Packaging;
    }
    MergeResult { field, needs_review }
}

fn display(c: &EnrichedField) -> String {
    match &c.value {
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

fn distinct_sources(members: &[&EnrichedField]) -> usize {
    let mut urls: Vec<&str> = members
        .iter()
        .map(|c| c.source_url.as_deref().unwrap_or(""))
        .collect();
    urls.sort();
    urls.dedup();
    urls.len()
}

/// Normalized comparison key: case/whitespace-insensitive for text,
/// tolerance-bucketed for numbers.
fn normalize_value(c: &EnrichedField, policy: &MergePolicy) -> String {
    let value = match &c.value {
        Some(v) => v,
        None => return String::new(),
    };
    match value.as_number() {
        Some(n) if policy.numeric_tolerance > 0.0 => {
            format!("n:{}", (n / policy.numeric_tolerance).round() as i64)
        }
        Some(n) => format!("n:{n}"),
        None => format!("t:{}", value.to_string().trim().to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        value: FieldValue,
        confidence: ConfidenceTier,
        source_url: &str,
    ) -> EnrichedField {
        EnrichedField {
            value: Some(value),
            unit: None,
            source_url: Some(source_url.to_string()),
            confidence,
            dimension_type: DimensionType::Na,
            notes: None,
        }
    }

    #[test]
    fn official_wins_outright() {
        let candidates = vec![
            candidate(
                FieldValue::Number(2.3),
                ConfidenceTier::Official,
                "https://maker.example/p",
            ),
            candidate(
                FieldValue::Number(2.3),
                ConfidenceTier::ThirdParty,
                "https://dist-a.example/p",
            ),
            candidate(
                FieldValue::Number(2.1),
                ConfidenceTier::ThirdParty,
                "https://dist-b.example/p",
            ),
        ];
        let result = merge("weight", &candidates, &MergePolicy::default());
        assert_eq!(result.field.value, Some(FieldValue::Number(2.3)));
        assert_eq!(result.field.confidence, ConfidenceTier::Official);
        assert!(!result.needs_review);
    }

    #[test]
    fn official_wins_regardless_of_order() {
        let a = candidate(
            FieldValue::Number(2.3),
            ConfidenceTier::Official,
            "https://maker.example/p",
        );
        let b = candidate(
            FieldValue::Number(2.1),
            ConfidenceTier::ThirdParty,
            "https://dist.example/p",
        );
        let policy = MergePolicy::default();
        let forwards = merge("weight", &[a.clone(), b.clone()], &policy);
        let backwards = merge("weight", &[b, a], &policy);
        assert_eq!(forwards, backwards);
        assert_eq!(forwards.field.confidence, ConfidenceTier::Official);
    }

    #[test]
    fn two_agreeing_third_parties_form_consensus() {
        let candidates = vec![
            candidate(
                FieldValue::Text("Black".to_string()),
                ConfidenceTier::ThirdParty,
                "https://a.example",
            ),
            candidate(
                FieldValue::Text("  black ".to_string()),
                ConfidenceTier::ThirdParty,
                "https://b.example",
            ),
        ];
        let result = merge("color", &candidates, &MergePolicy::default());
        assert_eq!(result.field.confidence, ConfidenceTier::ThirdParty);
        assert!(result.field.value.is_some());
        assert!(!result.needs_review);
    }

    #[test]
    fn same_source_twice_is_not_consensus() {
        let candidates = vec![
            candidate(
                FieldValue::Text("black".to_string()),
                ConfidenceTier::ThirdParty,
                "https://a.example",
            ),
            candidate(
                FieldValue::Text("black".to_string()),
                ConfidenceTier::ThirdParty,
                "https://a.example",
            ),
            candidate(
                FieldValue::Text("silver".to_string()),
                ConfidenceTier::ThirdParty,
                "https://b.example",
            ),
        ];
        let result = merge("color", &candidates, &MergePolicy::default());
        assert_eq!(result.field.confidence, ConfidenceTier::NotFound);
        assert!(result.needs_review);
    }

    #[test]
    fn disagreeing_third_parties_flag_review() {
        let candidates = vec![
            candidate(
                FieldValue::Text("black".to_string()),
                ConfidenceTier::ThirdParty,
                "https://a.example",
            ),
            candidate(
                FieldValue::Text("silver".to_string()),
                ConfidenceTier::ThirdParty,
                "https://b.example",
            ),
        ];
        let result = merge("color", &candidates, &MergePolicy::default());
        assert_eq!(result.field.confidence, ConfidenceTier::NotFound);
        assert_eq!(result.field.value, None);
        assert_eq!(
            result.field.notes.as_deref(),
            Some("sources disagree: black, silver")
        );
        assert!(result.needs_review);
    }

    #[test]
    fn single_source_is_annotated() {
        let candidates = vec![candidate(
            FieldValue::Number(42.0),
            ConfidenceTier::ThirdParty,
            "https://a.example",
        )];
        let result = merge("height", &candidates, &MergePolicy::default());
        assert!(result.field.is_resolved());
        assert_eq!(result.field.notes.as_deref(), Some("single source"));
        assert_eq!(result.field.confidence, ConfidenceTier::ThirdParty);
    }

    #[test]
    fn numeric_tolerance_buckets_agreement() {
        let candidates = vec![
            candidate(
                FieldValue::Number(2.300),
                ConfidenceTier::ThirdParty,
                "https://a.example",
            ),
            candidate(
                FieldValue::Text("2,3".to_string()),
                ConfidenceTier::ThirdParty,
                "https://b.example",
            ),
        ];
        let result = merge("weight", &candidates, &MergePolicy::default());
        assert_eq!(result.field.confidence, ConfidenceTier::ThirdParty);
    }

    #[test]
    fn product_dimension_beats_packaging() {
        let mut product = candidate(
            FieldValue::Number(10.0),
            ConfidenceTier::ThirdParty,
            "https://a.example",
        );
        product.dimension_type = DimensionType::Product;
        let mut packaging = candidate(
            FieldValue::Number(14.0),
            ConfidenceTier::ThirdParty,
            "https://b.example",
        );
        packaging.dimension_type = DimensionType::Packaging;

        let result = merge("height", &[packaging, product], &MergePolicy::default());
        assert_eq!(result.field.value, Some(FieldValue::Number(10.0)));
        assert_eq!(result.field.dimension_type, DimensionType::Product);
        // Only one candidate survives the preference filter.
        assert_eq!(result.field.notes.as_deref(), Some("single source"));
    }

    #[test]
    fn unlabeled_dimension_defaults_to_packaging() {
        let candidates = vec![candidate(
            FieldValue::Number(10.0),
            ConfidenceTier::ThirdParty,
            "https://a.example",
        )];
        let result = merge("height", &candidates, &MergePolicy::default());
        assert_eq!(result.field.dimension_type, DimensionType::Packaging);
    }

    #[test]
    fn non_dimension_field_keeps_na() {
        let candidates = vec![candidate(
            FieldValue::Text("black".to_string()),
            ConfidenceTier::Official,
            "https://a.example",
        )];
        let result = merge("color", &candidates, &MergePolicy::default());
        assert_eq!(result.field.dimension_type, DimensionType::Na);
    }

    #[test]
    fn not_found_candidates_are_dropped() {
        let result = merge(
            "color",
            &[EnrichedField::default(), EnrichedField::default()],
            &MergePolicy::default(),
        );
        assert_eq!(result.field.confidence, ConfidenceTier::NotFound);
        assert!(!result.needs_review);
        assert_eq!(result.field.notes, None);
    }
}

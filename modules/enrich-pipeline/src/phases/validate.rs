//! Validate: normalize units, sanity-check the final record, and decide
//! whether it ships or goes to human review.

use std::collections::BTreeMap;

use tracing::info;

use enrich_common::attributes::attribute_kind;
use enrich_common::{
    EnrichError, EnrichedField, IssueSeverity, LogEntry, LogStatus, Phase, ProductRecord,
    ProductStatus, QualityRating, ResourceUsage, ValidationIssue, ValidationOutcome,
};

use crate::capabilities::with_retry;
use crate::ledger::CostTracker;
use crate::normalize;
use crate::store::PhaseOutput;

use super::{PhaseContext, PhaseOutcome, Transition};

pub async fn run(
    ctx: &PhaseContext,
    product: &ProductRecord,
    tracker: &CostTracker,
) -> Result<PhaseOutcome, EnrichError> {
    let classification = product
        .classification
        .as_ref()
        .ok_or_else(|| EnrichError::Validation("validate phase requires a classification".into()))?;
    let extraction = product
        .extraction_result
        .as_ref()
        .ok_or_else(|| EnrichError::Validation("validate phase requires an extraction result".into()))?;

    // Final field set: extraction results overlaid with gap-fill wins.
    let mut fields: BTreeMap<String, EnrichedField> = extraction.fields.clone();
    if let Some(gap_fill) = &product.gap_fill_result {
        for (name, field) in &gap_fill.fields {
            fields.insert(name.clone(), field.clone());
        }
    }

    // --- Unit normalization ---

    let mut issues: Vec<ValidationIssue> = Vec::new();
    let mut normalized: BTreeMap<String, EnrichedField> = BTreeMap::new();
    for (name, field) in &fields {
        match attribute_kind(classification.product_type, name) {
            Some(kind) => {
                let result = normalize::normalize_field(kind, field);
                if let Some(issue) = result.issue {
                    issues.push(ValidationIssue {
                        field: name.clone(),
                        issue,
                        severity: IssueSeverity::Warning,
                    });
                }
                normalized.insert(name.clone(), result.field);
            }
            None => {
                normalized.insert(name.clone(), field.clone());
            }
        }
    }

    // --- Plausibility review ---

    let identity = ctx.identity(product);
    let _permit = ctx.limiters.reasoning.acquire().await;
    let (verdict, usage) =
        with_retry("claude", || ctx.reasoner.sanity_check(&identity, &normalized)).await?;
    drop(_permit);

    tracker.add_llm_call(
        &ctx.model_review,
        Phase::Validate,
        usage.input_tokens,
        usage.output_tokens,
    );
    ctx.log(
        product.id,
        LogEntry::new(
            Phase::Validate,
            "sanity_check",
            LogStatus::Success,
            format!("quality: {:?}, {} issues", verdict.quality, verdict.issues.len()),
        )
        .with_usage(ResourceUsage {
            service: ctx.model_review.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            credits: 0,
        }),
    )
    .await?;

    issues.extend(verdict.issues);

    // --- Verdict ---

    let review_reason = decide_review_reason(extraction.review_flagged, &verdict.quality, &issues)
        .or(verdict.review_reason);

    let (quality, status) = if review_reason.is_some() {
        (QualityRating::NeedsReview, ProductStatus::NeedsReview)
    } else {
        (verdict.quality, ProductStatus::Done)
    };

    info!(
        product_id = product.id,
        quality = ?quality,
        issues = issues.len(),
        "Validation complete"
    );

    Ok(PhaseOutcome {
        output: PhaseOutput::Validation(ValidationOutcome {
            normalized,
            quality,
            issues,
            review_reason: review_reason.clone(),
        }),
        next: Transition::Finished(status),
    })
}

fn decide_review_reason(
    review_flagged: bool,
    quality: &QualityRating,
    issues: &[ValidationIssue],
) -> Option<String> {
    if review_flagged {
        return Some("sources disagreed during merge".to_string());
    }
    if *quality == QualityRating::NeedsReview {
        return Some("sanity check rated the record needs_review".to_string());
    }
    let errors: Vec<&str> = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::Error)
        .map(|i| i.field.as_str())
        .collect();
    if !errors.is_empty() {
        return Some(format!("validation errors on: {}", errors.join(", ")));
    }
    None
}

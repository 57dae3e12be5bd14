//! Gap-fill: a targeted second pass over cached third-party pages, run
//! only for the critical fields extraction left unresolved. Resolved
//! fields are never touched again.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use enrich_common::attributes::{attribute_specs, AttributeSpec};
use enrich_common::{
    BrandOriginEntry, ConfidenceTier, DimensionType, EnrichError, EnrichedField, FieldValue,
    GapFillOutcome, LogEntry, LogStatus, Phase, ProductRecord, ResourceUsage, SourceTier,
};

use crate::capabilities::with_retry;
use crate::ledger::CostTracker;
use crate::merge;
use crate::store::PhaseOutput;

use super::{PhaseContext, PhaseOutcome, Transition};

const COLOR_WORDS: &[&str] = &[
    "black", "white", "red", "blue", "green", "yellow", "silver", "grey", "gray", "orange",
    "purple", "pink", "brown", "beige", "gold", "transparent",
];

pub async fn run(
    ctx: &PhaseContext,
    product: &ProductRecord,
    tracker: &CostTracker,
) -> Result<PhaseOutcome, EnrichError> {
    let classification = product
        .classification
        .as_ref()
        .ok_or_else(|| EnrichError::Validation("gap-fill requires a classification".into()))?;
    let extraction = product
        .extraction_result
        .as_ref()
        .ok_or_else(|| EnrichError::Validation("gap-fill requires an extraction result".into()))?;

    let specs = attribute_specs(classification.product_type);
    let mut remaining: Vec<String> = extraction.unresolved.clone();
    let mut filled: BTreeMap<String, EnrichedField> = BTreeMap::new();
    let mut pages_analyzed = 0u32;

    // --- Pass 1: unanalyzed third-party pages ---

    let reserve: Vec<_> = ctx
        .store
        .list_pages(product.id)
        .await
        .map_err(|e| EnrichError::Store(e.to_string()))?
        .into_iter()
        .filter(|p| p.source_tier == SourceTier::ThirdParty && !p.analyzed)
        .collect();

    let identity = ctx.identity(product);
    let mut candidates: BTreeMap<String, Vec<EnrichedField>> = BTreeMap::new();

    for page in &reserve {
        if remaining.is_empty() {
            break;
        }
        let targeted = targeted_specs(&specs, &remaining);

        let _permit = ctx.limiters.reasoning.acquire().await;
        let extracted = with_retry("claude", || {
            ctx.reasoner
                .extract_fields(&identity, &targeted, &page.url, &page.content)
        })
        .await;
        let (fields, usage) = match extracted {
            Ok(ok) => ok,
            Err(e) => {
                warn!(product_id = product.id, url = page.url, error = %e, "Gap-fill extraction failed");
                ctx.log(
                    product.id,
                    LogEntry::new(Phase::GapFill, "extract", LogStatus::Warning, e.to_string()),
                )
                .await?;
                continue;
            }
        };

        tracker.add_llm_call(
            &ctx.model_fast,
            Phase::GapFill,
            usage.input_tokens,
            usage.output_tokens,
        );
        ctx.store
            .mark_page_analyzed(product.id, &page.url)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;
        pages_analyzed += 1;
        ctx.log(
            product.id,
            LogEntry::new(
                Phase::GapFill,
                "extract",
                LogStatus::Success,
                format!("{}: {} fields", page.url, fields.len()),
            )
            .with_usage(ResourceUsage {
                service: ctx.model_fast.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                credits: 0,
            }),
        )
        .await?;

        for field in fields {
            if field.value.is_none() || !remaining.contains(&field.name) {
                continue;
            }
            candidates
                .entry(field.name.clone())
                .or_default()
                .push(EnrichedField {
                    value: field.value,
                    unit: field.unit,
                    source_url: Some(page.url.clone()),
                    confidence: page.source_tier.confidence(),
                    dimension_type: field.dimension_type,
                    notes: field.notes,
                });
        }

        settle(&mut remaining, &mut filled, &candidates, &ctx.merge_policy);
    }

    // --- Pass 2: specialized fallbacks for fields pages did not yield ---

    if remaining.iter().any(|n| n == "country_of_origin") {
        if let Some(field) = resolve_country(ctx, product, tracker).await? {
            filled.insert("country_of_origin".to_string(), field);
            remaining.retain(|n| n != "country_of_origin");
        }
    }

    if remaining.iter().any(|n| n == "color") {
        let image_url = filled
            .get("image_url")
            .or_else(|| extraction.fields.get("image_url"))
            .filter(|f| f.is_resolved())
            .and_then(|f| f.value.as_ref())
            .map(|v| v.to_string());
        if let Some(field) = resolve_color(ctx, product, image_url.as_deref(), tracker).await? {
            filled.insert("color".to_string(), field);
            remaining.retain(|n| n != "color");
        }
    }

    info!(
        product_id = product.id,
        filled = filled.len(),
        pages_analyzed,
        still_unresolved = remaining.len(),
        "Gap-fill complete"
    );

    Ok(PhaseOutcome {
        output: PhaseOutput::GapFill(GapFillOutcome {
            filled: filled.keys().cloned().collect(),
            fields: filled,
            pages_analyzed,
            still_unresolved: remaining,
        }),
        next: Transition::Continue(Phase::Validate),
    })
}

/// Merge the candidates gathered so far and move newly resolved fields
/// out of `remaining`. Called after every page for early exit.
fn settle(
    remaining: &mut Vec<String>,
    filled: &mut BTreeMap<String, EnrichedField>,
    candidates: &BTreeMap<String, Vec<EnrichedField>>,
    policy: &crate::merge::MergePolicy,
) {
    remaining.retain(|name| {
        let Some(attr_candidates) = candidates.get(name) else {
            return true;
        };
        let result = merge::merge(name, attr_candidates, policy);
        if result.field.is_resolved() {
            filled.insert(name.clone(), result.field);
            false
        } else {
            true
        }
    });
}

fn targeted_specs(specs: &[AttributeSpec], remaining: &[String]) -> Vec<AttributeSpec> {
    specs
        .iter()
        .filter(|s| remaining.iter().any(|r| r == s.name))
        .copied()
        .collect()
}

/// Country of origin rarely appears on product pages; the brand cache and
/// model knowledge answer it far more cheaply than more scraping.
async fn resolve_country(
    ctx: &PhaseContext,
    product: &ProductRecord,
    tracker: &CostTracker,
) -> Result<Option<EnrichedField>, EnrichError> {
    let Some(classification) = product.classification.as_ref() else {
        return Ok(None);
    };
    if !classification.has_brand() {
        return Ok(None);
    }
    let Some(brand) = classification.brand.as_deref() else {
        return Ok(None);
    };

    if let Some(hit) = ctx
        .store
        .get_brand_origin(brand)
        .await
        .map_err(|e| EnrichError::Store(e.to_string()))?
    {
        return Ok(Some(inferred_field(
            FieldValue::Text(hit.country),
            hit.confidence,
            "brand origin cache",
        )));
    }

    let _permit = ctx.limiters.reasoning.acquire().await;
    let (country, usage) = with_retry("claude", || ctx.reasoner.brand_origin(brand)).await?;
    tracker.add_llm_call(
        &ctx.model_fast,
        Phase::GapFill,
        usage.input_tokens,
        usage.output_tokens,
    );

    let Some(country) = country else {
        return Ok(None);
    };

    ctx.store
        .put_brand_origin(&BrandOriginEntry {
            brand: brand.to_string(),
            country: country.clone(),
            confidence: ConfidenceTier::Inferred,
            cached_at: Utc::now(),
        })
        .await
        .map_err(|e| EnrichError::Store(e.to_string()))?;

    Ok(Some(inferred_field(
        FieldValue::Text(country),
        ConfidenceTier::Inferred,
        "brand knowledge",
    )))
}

/// Vision on the product image first; the product name's own words as a
/// last resort.
async fn resolve_color(
    ctx: &PhaseContext,
    product: &ProductRecord,
    image_url: Option<&str>,
    tracker: &CostTracker,
) -> Result<Option<EnrichedField>, EnrichError> {
    if let Some(url) = image_url {
        let _permit = ctx.limiters.vision.acquire().await;
        match with_retry("vision", || ctx.vision.detect_color(url)).await {
            Ok((color, usage)) => {
                tracker.add_llm_call(
                    &ctx.model_fast,
                    Phase::GapFill,
                    usage.input_tokens,
                    usage.output_tokens,
                );
                if let Some(color) = color {
                    return Ok(Some(inferred_field(
                        FieldValue::Text(color),
                        ConfidenceTier::Inferred,
                        "from product image",
                    )));
                }
            }
            Err(e) => {
                warn!(product_id = product.id, error = %e, "Color vision failed");
                ctx.log(
                    product.id,
                    LogEntry::new(Phase::GapFill, "vision", LogStatus::Warning, e.to_string()),
                )
                .await?;
            }
        }
    }

    let name = product.name.to_lowercase();
    let from_name = product
        .classification
        .as_ref()
        .and_then(|c| c.parsed_color.clone())
        .or_else(|| {
            COLOR_WORDS
                .iter()
                .find(|w| name.split_whitespace().any(|token| token == **w))
                .map(|w| w.to_string())
        });

    Ok(from_name.map(|color| {
        inferred_field(
            FieldValue::Text(color),
            ConfidenceTier::Inferred,
            "from product name",
        )
    }))
}

fn inferred_field(value: FieldValue, confidence: ConfidenceTier, note: &str) -> EnrichedField {
    EnrichedField {
        value: Some(value),
        unit: None,
        source_url: None,
        confidence,
        dimension_type: DimensionType::Na,
        notes: Some(note.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergePolicy;

    #[test]
    fn settle_moves_only_resolved_fields() {
        let policy = MergePolicy::default();
        let mut remaining = vec!["weight".to_string(), "color".to_string()];
        let mut filled = BTreeMap::new();
        let mut candidates: BTreeMap<String, Vec<EnrichedField>> = BTreeMap::new();
        candidates.insert(
            "weight".to_string(),
            vec![EnrichedField {
                value: Some(FieldValue::Number(2.5)),
                unit: Some("kg".to_string()),
                source_url: Some("https://a.example".to_string()),
                confidence: ConfidenceTier::ThirdParty,
                dimension_type: DimensionType::Product,
                notes: None,
            }],
        );

        settle(&mut remaining, &mut filled, &candidates, &policy);

        assert_eq!(remaining, vec!["color".to_string()]);
        assert!(filled.contains_key("weight"));
        assert_eq!(filled["weight"].notes.as_deref(), Some("single source"));
    }

    #[test]
    fn color_words_match_whole_tokens_only() {
        let name = "Blackout curtain red 140cm".to_lowercase();
        let hit = COLOR_WORDS
            .iter()
            .find(|w| name.split_whitespace().any(|t| t == **w));
        assert_eq!(hit, Some(&"red"));
    }
}

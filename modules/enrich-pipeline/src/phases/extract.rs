//! Extract: scrape every relevant page, reason over the trusted ones,
//! and merge per-field candidates into one record.

use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::{info, warn};

use enrich_common::attributes::{attribute_specs, critical_attributes};
use enrich_common::{
    ConfidenceTier, EnrichError, EnrichedField, ExtractionOutcome, LogEntry, LogStatus,
    PageCacheEntry, Phase, ProductRecord, ResourceUsage, SourceTier,
};

use crate::capabilities::with_retry;
use crate::ledger::CostTracker;
use crate::merge;
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
        .ok_or_else(|| EnrichError::Validation("extract phase requires a classification".into()))?;
    let search = product
        .search_result
        .as_ref()
        .ok_or_else(|| EnrichError::Validation("extract phase requires search results".into()))?;

    // Fetch everything up front, third-party pages included: they are the
    // gap-fill reserve and fetching is the cheap part.
    let fetches = search.usable().map(|page| async move {
        let result = ctx
            .page_cache
            .get_or_fetch(
                product.id,
                &page.url,
                page.source_tier,
                Phase::Extract,
                tracker,
            )
            .await;
        (page.url.clone(), result)
    });
    let mut pages: Vec<PageCacheEntry> = Vec::new();
    let mut fetch_failures = 0u32;
    for (url, result) in join_all(fetches).await {
        match result {
            Ok(entry) => pages.push(entry),
            Err(e) => {
                fetch_failures += 1;
                warn!(product_id = product.id, url, error = %e, "Page fetch failed");
                ctx.log(
                    product.id,
                    LogEntry::new(Phase::Extract, "fetch", LogStatus::Warning, e.to_string()),
                )
                .await?;
            }
        }
    }

    // Partial data is workable; no data at all is not. With zero pages
    // every field would merge to not-found and the run would still walk to
    // a terminal status, so fail the phase instead.
    if pages.is_empty() && fetch_failures > 0 {
        return Err(EnrichError::Scrape(format!(
            "all {fetch_failures} page fetches failed, nothing to extract from"
        )));
    }

    let specs = attribute_specs(classification.product_type);
    let identity = ctx.identity(product);

    // Reasoning is spent only on trusted tiers; third-party content waits
    // for gap-fill.
    let mut candidates: BTreeMap<String, Vec<EnrichedField>> = BTreeMap::new();
    for page in pages
        .iter()
        .filter(|p| p.source_tier != SourceTier::ThirdParty)
    {
        let _permit = ctx.limiters.reasoning.acquire().await;
        let extracted = with_retry("claude", || {
            ctx.reasoner
                .extract_fields(&identity, &specs, &page.url, &page.content)
        })
        .await;
        let (fields, usage) = match extracted {
            Ok(ok) => ok,
            Err(e) => {
                warn!(product_id = product.id, url = page.url, error = %e, "Extraction failed for page");
                ctx.log(
                    product.id,
                    LogEntry::new(Phase::Extract, "extract", LogStatus::Warning, e.to_string()),
                )
                .await?;
                continue;
            }
        };

        tracker.add_llm_call(
            &ctx.model_fast,
            Phase::Extract,
            usage.input_tokens,
            usage.output_tokens,
        );
        ctx.store
            .mark_page_analyzed(product.id, &page.url)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;
        ctx.log(
            product.id,
            LogEntry::new(
                Phase::Extract,
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
            if field.value.is_none() {
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
    }

    // Survivorship per attribute.
    let mut fields: BTreeMap<String, EnrichedField> = BTreeMap::new();
    let mut review_flagged = false;
    for spec in &specs {
        let empty = Vec::new();
        let attr_candidates = candidates.get(spec.name).unwrap_or(&empty);
        let result = merge::merge(spec.name, attr_candidates, &ctx.merge_policy);
        review_flagged |= result.needs_review;
        fields.insert(spec.name.to_string(), result.field);
    }

    // An image URL pointing at a manual or PDF is worse than none.
    if let Some(image) = fields.get_mut("image_url") {
        if image.is_resolved() {
            let url = image
                .value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();
            if !is_valid_image_url(&url) {
                *image = EnrichedField {
                    notes: Some(format!("rejected non-image url: {url}")),
                    ..EnrichedField::default()
                };
            }
        }
    }

    let unresolved: Vec<String> = critical_attributes(classification.product_type)
        .into_iter()
        .filter(|name| {
            fields
                .get(*name)
                .map_or(true, |f| f.confidence == ConfidenceTier::NotFound || f.value.is_none())
        })
        .map(str::to_string)
        .collect();

    // Gap-fill only pays off when there is unanalyzed third-party content
    // waiting in the cache.
    let has_reserve = pages
        .iter()
        .any(|p| p.source_tier == SourceTier::ThirdParty);
    let next = if !unresolved.is_empty() && has_reserve {
        Transition::Continue(Phase::GapFill)
    } else {
        Transition::Continue(Phase::Validate)
    };

    info!(
        product_id = product.id,
        resolved = fields.values().filter(|f| f.is_resolved()).count(),
        unresolved = unresolved.len(),
        review_flagged,
        "Extraction merged"
    );

    Ok(PhaseOutcome {
        output: PhaseOutput::Extraction(ExtractionOutcome {
            fields,
            unresolved,
            review_flagged,
        }),
        next,
    })
}

/// A usable product image URL: http(s), an image file extension, and not
/// buried under a manuals/documents path.
fn is_valid_image_url(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return false;
    }
    let path = parsed.path().to_lowercase();
    if path.contains("/manual") || path.contains("/document") || path.ends_with(".pdf") {
        return false;
    }
    [".jpg", ".jpeg", ".png", ".webp", ".gif"]
        .iter()
        .any(|ext| path.ends_with(ext))
}

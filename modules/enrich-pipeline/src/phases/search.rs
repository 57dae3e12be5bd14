//! Search: find candidate pages and sort them into source tiers.

use std::collections::HashSet;

use tracing::{info, warn};

use enrich_common::{
    Classification, EnrichError, LogEntry, LogStatus, Phase, ProductRecord, ResourceUsage,
    SearchOutcome, SourceTier,
};

use crate::capabilities::{with_retry, SearchHit};
use crate::ledger::CostTracker;
use crate::store::PhaseOutput;

use super::{PhaseContext, PhaseOutcome, Transition};

/// Stop running ladder queries once this many unique hits are in hand.
const ENOUGH_HITS: usize = 3;
/// How many classified, relevant pages move on to extraction.
const MAX_PAGES: usize = 5;

pub async fn run(
    ctx: &PhaseContext,
    product: &ProductRecord,
    tracker: &CostTracker,
) -> Result<PhaseOutcome, EnrichError> {
    let classification = product
        .classification
        .as_ref()
        .ok_or_else(|| EnrichError::Validation("search phase requires a classification".into()))?;

    let queries = query_ladder(product, classification);

    let mut hits: Vec<SearchHit> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut failures = 0usize;
    let query_count = queries.len();

    for query in queries {
        if hits.len() >= ENOUGH_HITS {
            break;
        }
        let _permit = ctx.limiters.search.acquire().await;
        match with_retry("search", || ctx.searcher.search(&query)).await {
            Ok(results) => {
                tracker.add_api_call(ctx.searcher.name(), Phase::Search, results.credits_used);
                for hit in results.hits {
                    if seen.insert(hit.url.clone()) {
                        hits.push(hit);
                    }
                }
            }
            Err(e) => {
                warn!(product_id = product.id, query, error = %e, "Search query failed");
                ctx.log(
                    product.id,
                    LogEntry::new(Phase::Search, "query", LogStatus::Warning, e.to_string()),
                )
                .await?;
                failures += 1;
            }
        }
    }

    // Hard failure only when the capability itself is down for every query.
    if failures == query_count {
        return Err(EnrichError::Search("every search query failed".into()));
    }
    if hits.is_empty() {
        return Err(EnrichError::Search("no usable search results".into()));
    }

    let _permit = ctx.limiters.reasoning.acquire().await;
    let identity = ctx.identity(product);
    let (classified, usage) =
        with_retry("claude", || ctx.reasoner.classify_urls(&identity, &hits)).await?;
    drop(_permit);

    tracker.add_llm_call(
        &ctx.model_fast,
        Phase::Search,
        usage.input_tokens,
        usage.output_tokens,
    );

    let mut results: Vec<_> = classified
        .into_iter()
        .filter(|c| c.source_tier != SourceTier::Irrelevant)
        .collect();
    // Most trustworthy tiers first, then cap the page budget.
    results.sort_by_key(|c| tier_rank(c.source_tier));
    results.truncate(MAX_PAGES);

    if results.is_empty() {
        return Err(EnrichError::Search("no usable search results".into()));
    }

    info!(
        product_id = product.id,
        pages = results.len(),
        manufacturer = results
            .iter()
            .filter(|r| r.source_tier == SourceTier::Manufacturer)
            .count(),
        "Search complete"
    );
    ctx.log(
        product.id,
        LogEntry::new(
            Phase::Search,
            "classify_urls",
            LogStatus::Success,
            format!("{} relevant pages", results.len()),
        )
        .with_usage(ResourceUsage {
            service: ctx.model_fast.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            credits: 0,
        }),
    )
    .await?;

    Ok(PhaseOutcome {
        output: PhaseOutput::Search(SearchOutcome { results }),
        next: Transition::Continue(Phase::Extract),
    })
}

fn tier_rank(tier: SourceTier) -> u8 {
    match tier {
        SourceTier::Manufacturer => 0,
        SourceTier::AuthorizedDistributor => 1,
        SourceTier::ThirdParty => 2,
        SourceTier::Irrelevant => 3,
    }
}

/// Most-specific query first; later rungs only run while hits are scarce.
fn query_ladder(product: &ProductRecord, classification: &Classification) -> Vec<String> {
    let mut queries = Vec::new();
    let brand = classification.brand.as_deref();
    let model = classification.model_number.as_deref();

    if let (Some(brand), Some(model)) = (brand, model) {
        queries.push(format!("{brand} {model} specifications"));
        queries.push(format!("{brand} {model} {}", product.ean));
    }
    queries.push(format!("{} {}", product.name, product.ean));
    queries.push(format!("\"{}\"", product.ean));
    queries
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_common::{BrandConfidence, ProductType};

    fn classification(brand: Option<&str>, model: Option<&str>) -> Classification {
        Classification {
            product_type: ProductType::StandardProduct,
            brand: brand.map(str::to_string),
            brand_confidence: BrandConfidence::Certain,
            model_number: model.map(str::to_string),
            parsed_color: None,
            parsed_size: None,
            manufacturer_domain: None,
            reasoning: String::new(),
        }
    }

    fn product() -> ProductRecord {
        ProductRecord {
            id: 1,
            ean: "4006381333931".to_string(),
            name: "Makita XDT13 Impact Driver".to_string(),
            brand: None,
            weight: None,
            original_data: serde_json::json!({}),
            status: enrich_common::ProductStatus::Searching,
            current_step_detail: None,
            classification: None,
            search_result: None,
            extraction_result: None,
            gap_fill_result: None,
            validation_result: None,
            enrichment_log: Vec::new(),
            cost_summary: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn ladder_starts_specific_with_brand_and_model() {
        let queries = query_ladder(&product(), &classification(Some("Makita"), Some("XDT13")));
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0], "Makita XDT13 specifications");
        assert!(queries[3].contains("4006381333931"));
    }

    #[test]
    fn ladder_without_brand_skips_brand_rungs() {
        let queries = query_ladder(&product(), &classification(None, None));
        assert_eq!(queries.len(), 2);
        assert!(queries[0].starts_with("Makita XDT13 Impact Driver"));
    }

    #[test]
    fn manufacturer_pages_sort_first() {
        assert!(tier_rank(SourceTier::Manufacturer) < tier_rank(SourceTier::ThirdParty));
    }
}

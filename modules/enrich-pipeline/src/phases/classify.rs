//! Classify: parse the raw row into a typed product identity.

use enrich_common::{
    Classification, EnrichError, LogEntry, LogStatus, Phase, ProductRecord, ResourceUsage,
};
use tracing::{info, warn};

use crate::capabilities::with_retry;
use crate::ledger::CostTracker;
use crate::store::PhaseOutput;

use super::{PhaseContext, PhaseOutcome, Transition};

pub async fn run(
    ctx: &PhaseContext,
    product: &ProductRecord,
    tracker: &CostTracker,
) -> Result<PhaseOutcome, EnrichError> {
    let mut classification = classify_once(ctx, product, &product.name, tracker).await?;

    // Unknown brand: a bare EAN lookup often surfaces listings whose titles
    // name the brand. Feed those titles back into a second pass.
    if !classification.has_brand() {
        match ean_lookup_titles(ctx, product, tracker).await {
            Ok(titles) if !titles.is_empty() => {
                let augmented = format!(
                    "{} (EAN database titles: {})",
                    product.name,
                    titles.join("; ")
                );
                classification = classify_once(ctx, product, &augmented, tracker).await?;
                ctx.log(
                    product.id,
                    LogEntry::new(
                        Phase::Classify,
                        "ean_lookup",
                        LogStatus::Success,
                        format!("reclassified with {} lookup titles", titles.len()),
                    ),
                )
                .await?;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(product_id = product.id, error = %e, "EAN lookup fallback failed");
                ctx.log(
                    product.id,
                    LogEntry::new(
                        Phase::Classify,
                        "ean_lookup",
                        LogStatus::Warning,
                        e.to_string(),
                    ),
                )
                .await?;
            }
        }
    }

    info!(
        product_id = product.id,
        product_type = ?classification.product_type,
        brand = classification.brand.as_deref().unwrap_or("-"),
        "Product classified"
    );

    Ok(PhaseOutcome {
        output: PhaseOutput::Classification(classification),
        next: Transition::Continue(Phase::Search),
    })
}

async fn classify_once(
    ctx: &PhaseContext,
    product: &ProductRecord,
    name: &str,
    tracker: &CostTracker,
) -> Result<Classification, EnrichError> {
    let _permit = ctx.limiters.reasoning.acquire().await;
    let (classification, usage) = with_retry("claude", || {
        ctx.reasoner.classify_product(
            name,
            &product.ean,
            product.brand.as_deref(),
            product.weight.as_deref(),
        )
    })
    .await?;

    tracker.add_llm_call(
        &ctx.model_fast,
        Phase::Classify,
        usage.input_tokens,
        usage.output_tokens,
    );
    ctx.log(
        product.id,
        LogEntry::new(
            Phase::Classify,
            "triage",
            LogStatus::Success,
            classification.reasoning.clone(),
        )
        .with_usage(ResourceUsage {
            service: ctx.model_fast.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            credits: 0,
        }),
    )
    .await?;

    Ok(classification)
}

async fn ean_lookup_titles(
    ctx: &PhaseContext,
    product: &ProductRecord,
    tracker: &CostTracker,
) -> Result<Vec<String>, EnrichError> {
    let _permit = ctx.limiters.search.acquire().await;
    let query = format!("\"{}\"", product.ean);
    let results = with_retry("search", || ctx.searcher.search(&query)).await?;
    tracker.add_api_call(ctx.searcher.name(), Phase::Classify, results.credits_used);

    Ok(results
        .hits
        .into_iter()
        .take(3)
        .map(|h| h.title)
        .filter(|t| !t.is_empty())
        .collect())
}

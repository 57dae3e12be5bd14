//! The five pipeline phases.
//!
//! Each phase is a free async function taking the shared context, the
//! current product record, and the run's cost tracker, and returning a
//! committed output plus the tagged transition to take next. Branching
//! lives in the returned transition, not at call sites.

pub mod classify;
pub mod extract;
pub mod gap_fill;
pub mod search;
pub mod validate;

use std::sync::Arc;

use enrich_common::{EnrichError, LogEntry, Phase, ProductRecord, ProductStatus};

use crate::capabilities::{ColorVision, Reasoner, WebSearcher};
use crate::events::EventBus;
use crate::ledger::CostTracker;
use crate::limiter::RateLimiters;
use crate::merge::MergePolicy;
use crate::page_cache::PageCache;
use crate::store::{PhaseOutput, ProductStore};

/// Where the state machine goes after a phase commits.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Continue(Phase),
    Finished(ProductStatus),
}

pub struct PhaseOutcome {
    pub output: PhaseOutput,
    pub next: Transition,
}

/// Everything a phase needs, constructed once per process and shared.
pub struct PhaseContext {
    pub store: Arc<dyn ProductStore>,
    pub searcher: Arc<dyn WebSearcher>,
    pub reasoner: Arc<dyn Reasoner>,
    pub vision: Arc<dyn ColorVision>,
    pub page_cache: Arc<PageCache>,
    pub limiters: Arc<RateLimiters>,
    pub bus: Arc<EventBus>,
    pub merge_policy: MergePolicy,
    /// Model billed for classification, extraction, and gap-fill calls.
    pub model_fast: String,
    /// Model billed for the validation sanity check.
    pub model_review: String,
}

impl PhaseContext {
    /// Append to the product's enrichment log and fan the entry out to
    /// subscribers.
    pub async fn log(&self, product_id: i64, entry: LogEntry) -> Result<(), EnrichError> {
        self.store
            .append_log(product_id, &entry)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;
        self.bus.log_appended(product_id, entry);
        Ok(())
    }

    /// One-line identity used in reasoning prompts.
    pub fn identity(&self, product: &ProductRecord) -> String {
        let mut identity = format!("{} (EAN {})", product.name, product.ean);
        if let Some(brand) = &product.brand {
            identity.push_str(&format!(", brand {brand}"));
        }
        identity
    }
}

/// Dispatch one phase.
pub async fn run_phase(
    ctx: &PhaseContext,
    phase: Phase,
    product: &ProductRecord,
    tracker: &CostTracker,
) -> Result<PhaseOutcome, EnrichError> {
    match phase {
        Phase::Classify => classify::run(ctx, product, tracker).await,
        Phase::Search => search::run(ctx, product, tracker).await,
        Phase::Extract => extract::run(ctx, product, tracker).await,
        Phase::GapFill => gap_fill::run(ctx, product, tracker).await,
        Phase::Validate => validate::run(ctx, product, tracker).await,
    }
}

//! The per-product state machine.
//!
//! A run walks the phases in order, committing each phase's output to the
//! store before advancing, so the record never claims progress it has not
//! durably made. Transitions come back tagged from the phases themselves;
//! the orchestrator only follows them.

use std::sync::Arc;

use tracing::{error, info};

use enrich_common::{
    EnrichError, LogEntry, LogStatus, Phase, ProductRecord, ProductStatus,
};

use crate::ledger::{CostTracker, DailyGuard};
use crate::phases::{run_phase, PhaseContext, Transition};
use crate::run_guard::{RunGuard, RunToken};
use crate::store::PhaseOutput;

pub struct Orchestrator {
    ctx: Arc<PhaseContext>,
    guard: RunGuard,
    daily_guard: DailyGuard,
}

impl Orchestrator {
    pub fn new(ctx: Arc<PhaseContext>, daily_guard: DailyGuard) -> Self {
        Self {
            ctx,
            guard: RunGuard::new(),
            daily_guard,
        }
    }

    pub fn is_running(&self, id: i64) -> bool {
        self.guard.is_running(id)
    }

    /// Run the full pipeline for one product. Both entry guards must pass
    /// before any record is touched.
    pub async fn enrich(&self, id: i64) -> Result<ProductRecord, EnrichError> {
        let token = self.guard.begin(id)?;
        self.daily_guard.check_can_process(1).await?;
        self.run_from(id, Phase::Classify, token).await
    }

    /// Re-enter the state machine at `phase`, reusing everything upstream.
    pub async fn retry_phase(&self, id: i64, phase: Phase) -> Result<ProductRecord, EnrichError> {
        let token = self.guard.begin(id)?;
        self.daily_guard.check_can_process(1).await?;

        let product = self.get(id).await?;
        for upstream in Phase::ALL.into_iter().filter(|p| *p < phase) {
            if !has_output(&product, upstream) && upstream != Phase::GapFill {
                return Err(EnrichError::Validation(format!(
                    "cannot retry {phase}: no committed {upstream} output to reuse"
                )));
            }
        }

        self.ctx
            .store
            .clear_phase_outputs_from(id, phase)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;
        self.ctx
            .log(
                id,
                LogEntry::new(phase, "retry", LogStatus::Success, "re-entering phase"),
            )
            .await?;

        self.run_from(id, phase, token).await
    }

    /// Enrich many products, at most `max_concurrent_products` at a time.
    /// The guardrail check covers the whole batch up front.
    pub async fn enrich_batch(
        self: &Arc<Self>,
        ids: Vec<i64>,
    ) -> Result<Vec<(i64, Result<ProductStatus, String>)>, EnrichError> {
        self.daily_guard.check_can_process(ids.len() as u32).await?;

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let orchestrator = Arc::clone(self);
            let semaphore = Arc::clone(&orchestrator.ctx.limiters.products);
            handles.push(tokio::spawn(async move {
                let _slot = semaphore
                    .acquire_owned()
                    .await
                    .expect("product semaphore never closed");
                let result = match orchestrator.guard.begin(id) {
                    Ok(token) => orchestrator
                        .run_from(id, Phase::Classify, token)
                        .await
                        .map(|record| record.status)
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                (id, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(pair) => results.push(pair),
                Err(e) => error!(error = %e, "Batch worker panicked"),
            }
        }
        Ok(results)
    }

    async fn run_from(
        &self,
        id: i64,
        start: Phase,
        _token: RunToken,
    ) -> Result<ProductRecord, EnrichError> {
        let tracker = CostTracker::new(id);
        let mut phase = start;

        info!(product_id = id, phase = %phase, "Enrichment run starting");

        loop {
            let product = self.get(id).await?;
            self.set_status(id, phase.running_status(), Some(phase.as_str()))
                .await?;

            match run_phase(&self.ctx, phase, &product, &tracker).await {
                Ok(outcome) => {
                    self.commit(id, &outcome.output).await?;
                    match outcome.next {
                        Transition::Continue(next) => phase = next,
                        Transition::Finished(status) => {
                            let detail = finish_detail(&outcome.output);
                            self.set_status(id, status, detail.as_deref()).await?;
                            self.finish(id, &tracker, status).await?;
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(product_id = id, phase = %phase, error = %e, "Phase failed");
                    self.set_status(id, ProductStatus::Error, Some(&e.to_string()))
                        .await?;
                    self.ctx
                        .log(
                            id,
                            LogEntry::new(phase, "phase", LogStatus::Error, e.to_string()),
                        )
                        .await?;
                    self.save_costs(id, &tracker).await?;
                    return Err(e);
                }
            }
        }

        self.get(id).await
    }

    async fn finish(
        &self,
        id: i64,
        tracker: &CostTracker,
        status: ProductStatus,
    ) -> Result<(), EnrichError> {
        self.save_costs(id, tracker).await?;
        info!(
            product_id = id,
            status = %status,
            cost_usd = tracker.total_cost_usd(),
            "Enrichment run finished"
        );
        self.ctx
            .log(
                id,
                LogEntry::new(
                    Phase::Validate,
                    "run",
                    LogStatus::Success,
                    format!("finished as {status}, ${:.4}", tracker.total_cost_usd()),
                ),
            )
            .await
    }

    async fn save_costs(&self, id: i64, tracker: &CostTracker) -> Result<(), EnrichError> {
        self.ctx
            .store
            .save_cost_summary(id, &tracker.summary())
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))
    }

    async fn commit(&self, id: i64, output: &PhaseOutput) -> Result<(), EnrichError> {
        self.ctx
            .store
            .save_phase_output(id, output)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))
    }

    async fn set_status(
        &self,
        id: i64,
        status: ProductStatus,
        detail: Option<&str>,
    ) -> Result<(), EnrichError> {
        self.ctx
            .store
            .update_status(id, status, detail)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;
        self.ctx
            .bus
            .status_changed(id, status, detail.map(str::to_string));
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<ProductRecord, EnrichError> {
        self.ctx
            .store
            .get_product(id)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?
            .ok_or(EnrichError::NotFound(id))
    }
}

fn has_output(product: &ProductRecord, phase: Phase) -> bool {
    match phase {
        Phase::Classify => product.classification.is_some(),
        Phase::Search => product.search_result.is_some(),
        Phase::Extract => product.extraction_result.is_some(),
        Phase::GapFill => product.gap_fill_result.is_some(),
        Phase::Validate => product.validation_result.is_some(),
    }
}

fn finish_detail(output: &PhaseOutput) -> Option<String> {
    match output {
        PhaseOutput::Validation(v) => v.review_reason.clone(),
        _ => None,
    }
}

//! The service facade: everything a UI or CLI needs, one type.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::info;

use enrich_common::{
    Config, EnrichError, GuardrailLimits, GuardrailUpdate, NewProduct, Phase, ProductRecord,
    ProductStatus,
};

use claude_client::Claude;
use firecrawl_client::FirecrawlClient;

use crate::capabilities::{ClaudeReasoner, ClaudeVision, FirecrawlScraper, TavilySearcher};
use crate::events::{EventBus, PipelineEvent};
use crate::ledger::DailyGuard;
use crate::limiter::RateLimiters;
use crate::merge::MergePolicy;
use crate::orchestrator::Orchestrator;
use crate::page_cache::PageCache;
use crate::phases::PhaseContext;
use crate::store::{DailyStats, ProductStore};

pub struct EnrichmentService {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ProductStore>,
    bus: Arc<EventBus>,
    limits: Arc<RwLock<GuardrailLimits>>,
}

impl EnrichmentService {
    /// Wire up the production adapters from configuration.
    pub fn new(config: &Config, store: Arc<dyn ProductStore>) -> Self {
        let limiters = Arc::new(RateLimiters::new(config.max_concurrent_products));
        let bus = Arc::new(EventBus::default());
        let scraper = Arc::new(FirecrawlScraper::new(FirecrawlClient::new(
            &config.firecrawl_api_key,
        )));
        let page_cache = Arc::new(PageCache::new(store.clone(), scraper, limiters.clone()));

        let ctx = Arc::new(PhaseContext {
            store: store.clone(),
            searcher: Arc::new(TavilySearcher::new(&config.tavily_api_key)),
            reasoner: Arc::new(ClaudeReasoner::new(Claude::new(
                &config.anthropic_api_key,
                &config.model_fast,
            ))),
            vision: Arc::new(ClaudeVision::new(Claude::new(
                &config.anthropic_api_key,
                &config.model_fast,
            ))),
            page_cache,
            limiters,
            bus: bus.clone(),
            merge_policy: MergePolicy::default(),
            model_fast: config.model_fast.clone(),
            model_review: config.model_review.clone(),
        });

        let limits = Arc::new(RwLock::new(GuardrailLimits::from_env()));
        Self::from_context(ctx, store, bus, limits)
    }

    /// Assemble from pre-built parts. Tests inject mocks through here.
    pub fn from_context(
        ctx: Arc<PhaseContext>,
        store: Arc<dyn ProductStore>,
        bus: Arc<EventBus>,
        limits: Arc<RwLock<GuardrailLimits>>,
    ) -> Self {
        let daily_guard = DailyGuard::new(store.clone(), limits.clone());
        Self {
            orchestrator: Arc::new(Orchestrator::new(ctx, daily_guard)),
            store,
            bus,
            limits,
        }
    }

    // --- Ingestion and queries ---

    pub async fn ingest(&self, new: NewProduct) -> Result<ProductRecord, EnrichError> {
        self.store
            .insert_product(new)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))
    }

    pub async fn snapshot(&self, id: i64) -> Result<ProductRecord, EnrichError> {
        self.store
            .get_product(id)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?
            .ok_or(EnrichError::NotFound(id))
    }

    pub async fn list(
        &self,
        status: Option<ProductStatus>,
    ) -> Result<Vec<ProductRecord>, EnrichError> {
        self.store
            .list_products(status)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))
    }

    pub async fn daily_stats(&self) -> Result<DailyStats, EnrichError> {
        self.store
            .daily_stats()
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    /// The shared event bus, for wiring other publishers (e.g. the
    /// watchdog) onto the same stream subscribers see.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    // --- Runs ---

    pub async fn enrich(&self, id: i64) -> Result<ProductRecord, EnrichError> {
        self.orchestrator.enrich(id).await
    }

    pub async fn enrich_batch(
        &self,
        ids: Vec<i64>,
    ) -> Result<Vec<(i64, Result<ProductStatus, String>)>, EnrichError> {
        self.orchestrator.enrich_batch(ids).await
    }

    pub async fn retry_phase(&self, id: i64, phase: Phase) -> Result<ProductRecord, EnrichError> {
        self.orchestrator.retry_phase(id, phase).await
    }

    // --- Mutations guarded against live runs ---

    /// Wipe all phase outputs and return the product to `pending`.
    pub async fn reset(&self, id: i64) -> Result<ProductRecord, EnrichError> {
        self.reject_if_running(id)?;
        self.store
            .clear_phase_outputs_from(id, Phase::Classify)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;
        self.store
            .update_status(id, ProductStatus::Pending, None)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;
        self.bus.status_changed(id, ProductStatus::Pending, None);
        self.snapshot(id).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), EnrichError> {
        self.reject_if_running(id)?;
        self.store
            .delete_product(id)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;
        info!(product_id = id, "Product deleted");
        Ok(())
    }

    fn reject_if_running(&self, id: i64) -> Result<(), EnrichError> {
        if self.orchestrator.is_running(id) {
            return Err(EnrichError::InFlight(id));
        }
        Ok(())
    }

    // --- Guardrails ---

    pub fn limits(&self) -> GuardrailLimits {
        self.limits
            .read()
            .expect("guardrail limits lock poisoned")
            .clone()
    }

    pub fn set_limits(&self, update: GuardrailUpdate) -> GuardrailLimits {
        let mut limits = self
            .limits
            .write()
            .expect("guardrail limits lock poisoned");
        limits.apply(update);
        info!(
            daily_product_limit = limits.daily_product_limit,
            max_batch_size = limits.max_batch_size,
            daily_budget_usd = limits.daily_budget_usd,
            "Guardrail limits updated"
        );
        limits.clone()
    }
}

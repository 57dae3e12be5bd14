//! Durable product state.
//!
//! The store is the single source of truth for product records, the page
//! cache, and the brand-origin cache. The orchestrator commits every phase
//! output here before advancing, so a crash never loses completed work.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use enrich_common::{
    BrandOriginEntry, Classification, CostSummary, ExtractionOutcome, GapFillOutcome, LogEntry,
    NewProduct, PageCacheEntry, Phase, ProductRecord, ProductStatus, SearchOutcome,
    ValidationOutcome,
};

/// A committed phase result, tagged with the phase that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PhaseOutput {
    Classification(Classification),
    Search(SearchOutcome),
    Extraction(ExtractionOutcome),
    GapFill(GapFillOutcome),
    Validation(ValidationOutcome),
}

/// Today's processing totals, for the guardrail check.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DailyStats {
    pub processed_today: u32,
    pub spend_today_usd: f64,
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    // --- products ---

    async fn insert_product(&self, new: NewProduct) -> Result<ProductRecord>;
    async fn get_product(&self, id: i64) -> Result<Option<ProductRecord>>;
    async fn list_products(&self, status: Option<ProductStatus>) -> Result<Vec<ProductRecord>>;
    async fn delete_product(&self, id: i64) -> Result<()>;

    /// Set status and step detail, bumping `updated_at`. The bump doubles
    /// as the liveness heartbeat the watchdog watches.
    async fn update_status(
        &self,
        id: i64,
        status: ProductStatus,
        detail: Option<&str>,
    ) -> Result<()>;

    async fn save_phase_output(&self, id: i64, output: &PhaseOutput) -> Result<()>;

    /// Clear the output of `from` and every later phase. Earlier outputs
    /// are untouched, so a retry reuses them.
    async fn clear_phase_outputs_from(&self, id: i64, from: Phase) -> Result<()>;

    async fn append_log(&self, id: i64, entry: &LogEntry) -> Result<()>;
    async fn save_cost_summary(&self, id: i64, summary: &CostSummary) -> Result<()>;

    // --- recovery ---

    /// Products in an active state whose last heartbeat predates `cutoff`.
    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProductRecord>>;

    /// All products currently in an active state, regardless of age.
    async fn find_active(&self) -> Result<Vec<ProductRecord>>;

    async fn daily_stats(&self) -> Result<DailyStats>;

    // --- page cache ---

    async fn get_page(&self, product_id: i64, url: &str) -> Result<Option<PageCacheEntry>>;
    async fn put_page(&self, entry: &PageCacheEntry) -> Result<()>;
    async fn list_pages(&self, product_id: i64) -> Result<Vec<PageCacheEntry>>;
    async fn mark_page_analyzed(&self, product_id: i64, url: &str) -> Result<()>;

    // --- brand origin cache ---

    async fn get_brand_origin(&self, brand: &str) -> Result<Option<BrandOriginEntry>>;
    async fn put_brand_origin(&self, entry: &BrandOriginEntry) -> Result<()>;
}

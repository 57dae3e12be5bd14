//! Capability adapters: the pipeline's only doors to the outside world.
//!
//! Each external capability (search, scrape, reasoning, vision) sits behind
//! a trait so phases can be exercised against counting mocks. The concrete
//! adapters wrap provider clients, bound every call with a timeout, and
//! classify failures as transient or permanent so `with_retry` knows what
//! is worth another attempt.

mod claude;
mod firecrawl;
mod tavily;

pub use claude::{ClaudeReasoner, ClaudeVision};
pub use firecrawl::FirecrawlScraper;
pub use tavily::TavilySearcher;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use claude_client::TokenUsage;
use enrich_common::attributes::AttributeSpec;
use enrich_common::{
    Classification, ClassifiedUrl, DimensionType, EnrichError, EnrichedField, FieldValue,
    QualityRating, ValidationIssue,
};

/// Max attempts per external call, counting the first one.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff. Actual delay is base * 3^attempt + jitter (0-1s).
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Run `op`, retrying transient failures with exponential backoff and
/// jitter. Permanent failures and the final transient one pass through.
pub async fn with_retry<T, F, Fut>(service: &'static str, mut op: F) -> Result<T, EnrichError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EnrichError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let backoff = RETRY_BASE * 3u32.pow(attempt);
                let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
                warn!(
                    service,
                    attempt = attempt + 1,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "Transient failure, retrying after backoff"
                );
                tokio::time::sleep(backoff + jitter).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// --- Wire shapes shared by adapters and phases ---

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub credits_used: u32,
}

#[derive(Debug, Clone)]
pub struct ScrapedContent {
    pub markdown: String,
    pub credits_used: u32,
}

/// One attribute as the reasoner reports it. Provenance (confidence tier,
/// source URL) is attached by the caller from the page it came from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedField {
    pub name: String,
    pub value: Option<FieldValue>,
    pub unit: Option<String>,
    pub dimension_type: DimensionType,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SanityVerdict {
    pub quality: QualityRating,
    pub issues: Vec<ValidationIssue>,
    pub review_reason: Option<String>,
}

// --- Capability traits ---

#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchResults, EnrichError>;
    fn name(&self) -> &str;
}

#[async_trait]
pub trait PageScraper: Send + Sync {
    async fn scrape(&self, url: &str) -> Result<ScrapedContent, EnrichError>;
    fn name(&self) -> &str;
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Parse name/EAN/brand into a typed classification.
    async fn classify_product(
        &self,
        name: &str,
        ean: &str,
        brand: Option<&str>,
        weight: Option<&str>,
    ) -> Result<(Classification, TokenUsage), EnrichError>;

    /// Sort search hits into source tiers for a product.
    async fn classify_urls(
        &self,
        identity: &str,
        hits: &[SearchHit],
    ) -> Result<(Vec<ClassifiedUrl>, TokenUsage), EnrichError>;

    /// Pull the requested attributes out of one page.
    async fn extract_fields(
        &self,
        identity: &str,
        attributes: &[AttributeSpec],
        page_url: &str,
        page_markdown: &str,
    ) -> Result<(Vec<ExtractedField>, TokenUsage), EnrichError>;

    /// Judge the plausibility of the final merged field set.
    async fn sanity_check(
        &self,
        identity: &str,
        fields: &BTreeMap<String, EnrichedField>,
    ) -> Result<(SanityVerdict, TokenUsage), EnrichError>;

    /// Country of origin for a brand, when the model knows it.
    async fn brand_origin(
        &self,
        brand: &str,
    ) -> Result<(Option<String>, TokenUsage), EnrichError>;
}

#[async_trait]
pub trait ColorVision: Send + Sync {
    /// Dominant product color from an image URL, or None when unclear.
    async fn detect_color(
        &self,
        image_url: &str,
    ) -> Result<(Option<String>, TokenUsage), EnrichError>;
}

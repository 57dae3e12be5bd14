use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// --- Provenance ---

/// Trust label attached to every enriched value, derived from where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Official,
    ThirdParty,
    Inferred,
    NotFound,
}

/// Whether a measurement describes the product itself or its packaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DimensionType {
    Product,
    Packaging,
    Na,
}

/// Tier of the page a value was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Manufacturer,
    AuthorizedDistributor,
    ThirdParty,
    Irrelevant,
}

impl SourceTier {
    /// The confidence tier a value inherits from its page tier.
    pub fn confidence(&self) -> ConfidenceTier {
        match self {
            SourceTier::Manufacturer => ConfidenceTier::Official,
            SourceTier::AuthorizedDistributor | SourceTier::ThirdParty => {
                ConfidenceTier::ThirdParty
            }
            SourceTier::Irrelevant => ConfidenceTier::NotFound,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Manufacturer => "manufacturer",
            SourceTier::AuthorizedDistributor => "authorized_distributor",
            SourceTier::ThirdParty => "third_party",
            SourceTier::Irrelevant => "irrelevant",
        }
    }
}

// --- Enriched field ---

/// A field value as extracted: either numeric or free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().replace(',', ".").parse().ok(),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Every enriched data point carries provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnrichedField {
    pub value: Option<FieldValue>,
    /// Original unit from the page ("mm", "kg", "L"); normalization happens in validate.
    pub unit: Option<String>,
    pub source_url: Option<String>,
    pub confidence: ConfidenceTier,
    pub dimension_type: DimensionType,
    pub notes: Option<String>,
}

impl Default for EnrichedField {
    fn default() -> Self {
        Self {
            value: None,
            unit: None,
            source_url: None,
            confidence: ConfidenceTier::NotFound,
            dimension_type: DimensionType::Na,
            notes: None,
        }
    }
}

impl EnrichedField {
    pub fn is_resolved(&self) -> bool {
        self.value.is_some() && self.confidence != ConfidenceTier::NotFound
    }
}

// --- Lifecycle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Pending,
    Classifying,
    Searching,
    Extracting,
    GapFilling,
    Validating,
    Done,
    NeedsReview,
    Error,
}

impl ProductStatus {
    /// Whether the product currently has a run in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProductStatus::Classifying
                | ProductStatus::Searching
                | ProductStatus::Extracting
                | ProductStatus::GapFilling
                | ProductStatus::Validating
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProductStatus::Done | ProductStatus::NeedsReview | ProductStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Pending => "pending",
            ProductStatus::Classifying => "classifying",
            ProductStatus::Searching => "searching",
            ProductStatus::Extracting => "extracting",
            ProductStatus::GapFilling => "gap_filling",
            ProductStatus::Validating => "validating",
            ProductStatus::Done => "done",
            ProductStatus::NeedsReview => "needs_review",
            ProductStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ProductStatus::Pending,
            "classifying" => ProductStatus::Classifying,
            "searching" => ProductStatus::Searching,
            "extracting" => ProductStatus::Extracting,
            "gap_filling" => ProductStatus::GapFilling,
            "validating" => ProductStatus::Validating,
            "done" => ProductStatus::Done,
            "needs_review" => ProductStatus::NeedsReview,
            "error" => ProductStatus::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pipeline phases in execution order. Retry-from-phase clears this
/// phase's output and everything downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Classify,
    Search,
    Extract,
    GapFill,
    Validate,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Classify,
        Phase::Search,
        Phase::Extract,
        Phase::GapFill,
        Phase::Validate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Classify => "classify",
            Phase::Search => "search",
            Phase::Extract => "extract",
            Phase::GapFill => "gap_fill",
            Phase::Validate => "validate",
        }
    }

    /// The active status a product carries while this phase runs.
    pub fn running_status(&self) -> ProductStatus {
        match self {
            Phase::Classify => ProductStatus::Classifying,
            Phase::Search => ProductStatus::Searching,
            Phase::Extract => ProductStatus::Extracting,
            Phase::GapFill => ProductStatus::GapFilling,
            Phase::Validate => ProductStatus::Validating,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Enrichment log ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Warning,
    Error,
}

/// Resource usage attached to a log entry, for cost observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub service: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub credits: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub step: String,
    pub status: LogStatus,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
}

impl LogEntry {
    pub fn new(phase: Phase, step: &str, status: LogStatus, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            step: step.to_string(),
            status,
            details: details.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

// --- Phase results ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    StandardProduct,
    Accessory,
    Liquid,
    SoftGood,
    Electronics,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BrandConfidence {
    Certain,
    Likely,
    Unknown,
}

/// Output of the classify phase: parsed identity and product type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    pub product_type: ProductType,
    pub brand: Option<String>,
    pub brand_confidence: BrandConfidence,
    pub model_number: Option<String>,
    pub parsed_color: Option<String>,
    pub parsed_size: Option<String>,
    /// Brand's own domain when identifiable ("makita.com").
    pub manufacturer_domain: Option<String>,
    pub reasoning: String,
}

impl Classification {
    pub fn has_brand(&self) -> bool {
        self.brand.is_some() && self.brand_confidence != BrandConfidence::Unknown
    }
}

/// A search hit classified into a source tier.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClassifiedUrl {
    pub url: String,
    pub title: String,
    pub source_tier: SourceTier,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SearchOutcome {
    pub results: Vec<ClassifiedUrl>,
}

impl SearchOutcome {
    pub fn usable(&self) -> impl Iterator<Item = &ClassifiedUrl> {
        self.results
            .iter()
            .filter(|r| r.source_tier != SourceTier::Irrelevant)
    }
}

/// Output of the extract phase: one merged field per attribute name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub fields: BTreeMap<String, EnrichedField>,
    /// Critical attributes still unresolved after the merge.
    pub unresolved: Vec<String>,
    /// Set when merge hit disagreeing sources with no official tiebreaker.
    pub review_flagged: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GapFillOutcome {
    /// Newly resolved fields, keyed by attribute name. Never contains a
    /// field the extract phase already resolved.
    pub fields: BTreeMap<String, EnrichedField>,
    pub filled: Vec<String>,
    pub pages_analyzed: u32,
    pub still_unresolved: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
    pub severity: IssueSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QualityRating {
    Good,
    Acceptable,
    NeedsReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Fields after unit normalization (cm / kg / L).
    pub normalized: BTreeMap<String, EnrichedField>,
    pub quality: QualityRating,
    pub issues: Vec<ValidationIssue>,
    pub review_reason: Option<String>,
}

// --- Cost summary ---

/// Aggregated spend for one product run, stored on the record at terminal state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub credits_by_service: BTreeMap<String, u32>,
    pub cost_by_phase: BTreeMap<String, f64>,
    pub cost_by_service: BTreeMap<String, f64>,
    pub llm_calls: u32,
    pub api_calls: u32,
}

// --- Product record ---

/// One durable record per product. Mutated only by the orchestrator;
/// UI and export are read-only consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: i64,
    pub ean: String,
    pub name: String,
    pub brand: Option<String>,
    pub weight: Option<String>,
    /// Opaque snapshot of the ingested row.
    pub original_data: serde_json::Value,
    pub status: ProductStatus,
    pub current_step_detail: Option<String>,
    pub classification: Option<Classification>,
    pub search_result: Option<SearchOutcome>,
    pub extraction_result: Option<ExtractionOutcome>,
    pub gap_fill_result: Option<GapFillOutcome>,
    pub validation_result: Option<ValidationOutcome>,
    pub enrichment_log: Vec<LogEntry>,
    pub cost_summary: Option<CostSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for ingesting a product into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProduct {
    pub ean: String,
    pub name: String,
    pub brand: Option<String>,
    pub weight: Option<String>,
    pub original_data: serde_json::Value,
}

// --- Caches ---

/// Cached page content: scrape once, extract many times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCacheEntry {
    pub product_id: i64,
    pub url: String,
    pub source_tier: SourceTier,
    pub content: String,
    pub fetched_at: DateTime<Utc>,
    /// Set once a reasoning pass has consumed this page.
    pub analyzed: bool,
}

/// Cross-product brand → country-of-origin cache. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandOriginEntry {
    pub brand: String,
    pub country: String,
    pub confidence: ConfidenceTier,
    pub cached_at: DateTime<Utc>,
}

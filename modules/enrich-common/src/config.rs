use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_url: String,

    // AI provider
    pub anthropic_api_key: String,
    /// Model for classification, extraction, and gap-fill.
    pub model_fast: String,
    /// Model for the validation sanity check.
    pub model_review: String,

    // Search and scraping
    pub tavily_api_key: String,
    pub firecrawl_api_key: String,

    // Concurrency
    pub max_concurrent_products: usize,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:products.db".to_string()),
            anthropic_api_key: required_env("ANTHROPIC_API_KEY"),
            model_fast: env::var("ENRICH_MODEL_FAST")
                .unwrap_or_else(|_| "claude-haiku-4-5".to_string()),
            model_review: env::var("ENRICH_MODEL_REVIEW")
                .unwrap_or_else(|_| "claude-haiku-4-5".to_string()),
            tavily_api_key: required_env("TAVILY_API_KEY"),
            firecrawl_api_key: required_env("FIRECRAWL_API_KEY"),
            max_concurrent_products: env::var("MAX_CONCURRENT_PRODUCTS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .expect("MAX_CONCURRENT_PRODUCTS must be a number"),
        }
    }
}

/// Guardrail limits. Runtime-adjustable, not compile-time constants.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailLimits {
    pub daily_product_limit: u32,
    pub max_batch_size: u32,
    pub daily_budget_usd: f64,
}

impl Default for GuardrailLimits {
    fn default() -> Self {
        Self {
            daily_product_limit: 200,
            max_batch_size: 50,
            daily_budget_usd: 50.0,
        }
    }
}

impl GuardrailLimits {
    /// Seed limits from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            daily_product_limit: parse_env("DAILY_PRODUCT_LIMIT", defaults.daily_product_limit),
            max_batch_size: parse_env("MAX_BATCH_SIZE", defaults.max_batch_size),
            daily_budget_usd: parse_env("MAX_DAILY_COST_USD", defaults.daily_budget_usd),
        }
    }

    /// Apply a partial update, clamping to sane minimums.
    pub fn apply(&mut self, update: GuardrailUpdate) {
        if let Some(v) = update.daily_product_limit {
            self.daily_product_limit = v.max(1);
        }
        if let Some(v) = update.max_batch_size {
            self.max_batch_size = v.max(1);
        }
        if let Some(v) = update.daily_budget_usd {
            self.daily_budget_usd = v.max(0.0);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GuardrailUpdate {
    pub daily_product_limit: Option<u32>,
    pub max_batch_size: Option<u32>,
    pub daily_budget_usd: Option<f64>,
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrichError {
    /// A capability failed in a way that is worth retrying (timeouts,
    /// rate-limit responses, 5xx).
    #[error("{service} temporarily unavailable: {message}")]
    Transient { service: String, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Scrape error: {0}")]
    Scrape(String),

    #[error("Reasoning error: {0}")]
    Reasoning(String),

    #[error("Vision error: {0}")]
    Vision(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Budget guardrail rejected request: {0}")]
    BudgetExceeded(String),

    #[error("Product {0} already has an active enrichment run")]
    AlreadyRunning(i64),

    #[error("Product {0} is in flight; request rejected")]
    InFlight(i64),

    #[error("Product {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl EnrichError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EnrichError::Transient { .. })
    }

    pub fn transient(service: &str, message: impl std::fmt::Display) -> Self {
        EnrichError::Transient {
            service: service.to_string(),
            message: message.to_string(),
        }
    }
}

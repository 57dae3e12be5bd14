use thiserror::Error;

pub type Result<T> = std::result::Result<T, FirecrawlError>;

#[derive(Debug, Error)]
pub enum FirecrawlError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("No content returned for {url}")]
    EmptyContent { url: String },
}

impl From<reqwest::Error> for FirecrawlError {
    fn from(err: reqwest::Error) -> Self {
        FirecrawlError::Network(err.to_string())
    }
}

impl FirecrawlError {
    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        match self {
            FirecrawlError::Network(_) => true,
            FirecrawlError::Api { status, .. } => *status == 429 || *status >= 500,
            FirecrawlError::EmptyContent { .. } => false,
        }
    }
}

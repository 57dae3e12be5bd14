pub mod error;

pub use error::{FirecrawlError, Result};

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.firecrawl.dev/v1";

/// A scraped page in markdown form, with the credit count the API billed.
#[derive(Debug, Clone)]
pub struct ScrapedPage {
    pub markdown: String,
    pub credits_used: u32,
}

pub struct FirecrawlClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    success: bool,
    data: Option<ScrapeData>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrapeData {
    #[serde(default)]
    markdown: String,
}

impl FirecrawlClient {
    pub fn new(api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Scrape a URL and return its main content as markdown.
    pub async fn scrape(&self, url: &str) -> Result<ScrapedPage> {
        let endpoint = format!("{}/scrape", self.base_url);
        let body = serde_json::json!({
            "url": url,
            "formats": ["markdown"],
        });

        debug!(url, "Firecrawl scrape request");

        let resp = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(FirecrawlError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ScrapeResponse = resp.json().await?;

        if !parsed.success {
            return Err(FirecrawlError::Api {
                status: status.as_u16(),
                message: parsed.error.unwrap_or_else(|| "scrape failed".to_string()),
            });
        }

        let markdown = parsed.data.map(|d| d.markdown).unwrap_or_default();
        if markdown.trim().is_empty() {
            return Err(FirecrawlError::EmptyContent {
                url: url.to_string(),
            });
        }

        Ok(ScrapedPage {
            markdown,
            credits_used: 1,
        })
    }
}

//! Tavily web search adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use enrich_common::EnrichError;

use super::{SearchHit, SearchResults, WebSearcher};

const TAVILY_API_URL: &str = "https://api.tavily.com";
const MAX_RESULTS: u32 = 8;

pub struct TavilySearcher {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

impl TavilySearcher {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: TAVILY_API_URL.to_string(),
        }
    }
}

#[async_trait]
impl WebSearcher for TavilySearcher {
    async fn search(&self, query: &str) -> Result<SearchResults, EnrichError> {
        debug!(query, "Tavily search");

        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&serde_json::json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": MAX_RESULTS,
                "search_depth": "basic",
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    EnrichError::transient("tavily", e)
                } else {
                    EnrichError::Search(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = format!("Tavily API error ({status}): {body}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(EnrichError::transient("tavily", err))
            } else {
                Err(EnrichError::Search(err))
            };
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| EnrichError::Search(format!("Invalid Tavily response: {e}")))?;

        Ok(SearchResults {
            hits: parsed
                .results
                .into_iter()
                .map(|r| SearchHit {
                    url: r.url,
                    title: r.title,
                    snippet: r.content,
                })
                .collect(),
            credits_used: 1,
        })
    }

    fn name(&self) -> &str {
        "tavily"
    }
}

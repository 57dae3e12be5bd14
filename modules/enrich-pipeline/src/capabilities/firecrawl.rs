//! Firecrawl scrape adapter.

use async_trait::async_trait;
use tracing::debug;

use enrich_common::EnrichError;
use firecrawl_client::FirecrawlClient;

use super::{PageScraper, ScrapedContent};

pub struct FirecrawlScraper {
    client: FirecrawlClient,
}

impl FirecrawlScraper {
    pub fn new(client: FirecrawlClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageScraper for FirecrawlScraper {
    async fn scrape(&self, url: &str) -> Result<ScrapedContent, EnrichError> {
        debug!(url, scraper = "firecrawl", "Scraping URL");

        let page = self.client.scrape(url).await.map_err(|e| {
            if e.is_transient() {
                EnrichError::transient("firecrawl", e)
            } else {
                EnrichError::Scrape(e.to_string())
            }
        })?;

        Ok(ScrapedContent {
            markdown: page.markdown,
            credits_used: page.credits_used,
        })
    }

    fn name(&self) -> &str {
        "firecrawl"
    }
}

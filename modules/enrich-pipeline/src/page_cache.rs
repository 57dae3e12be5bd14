//! Scrape once, extract many times.
//!
//! Page content is cached in the store keyed by (product, URL); once a
//! page is fetched it is never fetched again for that product's lifetime.
//! Concurrent requests for the same key are collapsed onto one fetch via a
//! per-key lock, so gap-fill re-reads and extraction fan-out cannot double
//! spend scrape credits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use enrich_common::{EnrichError, PageCacheEntry, Phase, SourceTier};

use crate::capabilities::{with_retry, PageScraper};
use crate::ledger::CostTracker;
use crate::limiter::RateLimiters;
use crate::store::ProductStore;

pub struct PageCache {
    store: Arc<dyn ProductStore>,
    scraper: Arc<dyn PageScraper>,
    limiters: Arc<RateLimiters>,
    in_flight: Mutex<HashMap<(i64, String), Arc<Mutex<()>>>>,
}

impl PageCache {
    pub fn new(
        store: Arc<dyn ProductStore>,
        scraper: Arc<dyn PageScraper>,
        limiters: Arc<RateLimiters>,
    ) -> Self {
        Self {
            store,
            scraper,
            limiters,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached page, fetching and storing it on first request.
    pub async fn get_or_fetch(
        &self,
        product_id: i64,
        url: &str,
        tier: SourceTier,
        phase: Phase,
        tracker: &CostTracker,
    ) -> Result<PageCacheEntry, EnrichError> {
        if let Some(hit) = self.lookup(product_id, url).await? {
            debug!(product_id, url, "Page cache hit");
            return Ok(hit);
        }

        let key_lock = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry((product_id, url.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        // The entry must come out of the map whether the fetch succeeded
        // or not; a leaked entry would pin one Arc per failed URL forever.
        let result = self
            .fetch_through(product_id, url, tier, phase, tracker)
            .await;
        self.in_flight
            .lock()
            .await
            .remove(&(product_id, url.to_string()));
        result
    }

    async fn fetch_through(
        &self,
        product_id: i64,
        url: &str,
        tier: SourceTier,
        phase: Phase,
        tracker: &CostTracker,
    ) -> Result<PageCacheEntry, EnrichError> {
        // A concurrent caller may have fetched while we waited.
        if let Some(hit) = self.lookup(product_id, url).await? {
            debug!(product_id, url, "Page cache hit after wait");
            return Ok(hit);
        }

        let _permit = self.limiters.scrape.acquire().await;
        let content = with_retry("scrape", || self.scraper.scrape(url)).await?;

        tracker.add_api_call(self.scraper.name(), phase, content.credits_used);
        info!(
            product_id,
            url,
            chars = content.markdown.len(),
            credits = content.credits_used,
            "Page fetched and cached"
        );

        let entry = PageCacheEntry {
            product_id,
            url: url.to_string(),
            source_tier: tier,
            content: content.markdown,
            fetched_at: Utc::now(),
            analyzed: false,
        };
        self.store
            .put_page(&entry)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;

        Ok(entry)
    }

    #[cfg(test)]
    async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn lookup(&self, product_id: i64, url: &str) -> Result<Option<PageCacheEntry>, EnrichError> {
        self.store
            .get_page(product_id, url)
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::capabilities::ScrapedContent;
    use crate::store::MemoryStore;

    struct CountingScraper {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PageScraper for CountingScraper {
        async fn scrape(&self, _url: &str) -> Result<ScrapedContent, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScrapedContent {
                markdown: "# Product page".to_string(),
                credits_used: 1,
            })
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn cache_with_counter() -> (Arc<PageCache>, Arc<CountingScraper>) {
        let scraper = Arc::new(CountingScraper {
            calls: AtomicU32::new(0),
        });
        let cache = Arc::new(PageCache::new(
            Arc::new(MemoryStore::new()),
            scraper.clone(),
            Arc::new(RateLimiters::new(4)),
        ));
        (cache, scraper)
    }

    #[tokio::test]
    async fn repeated_requests_fetch_at_most_once() {
        let (cache, scraper) = cache_with_counter();
        let tracker = CostTracker::new(1);

        for _ in 0..3 {
            cache
                .get_or_fetch(
                    1,
                    "https://example.com/p",
                    SourceTier::ThirdParty,
                    Phase::Extract,
                    &tracker,
                )
                .await
                .unwrap();
        }

        assert_eq!(scraper.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_collapse_onto_one_fetch() {
        let (cache, scraper) = cache_with_counter();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let tracker = CostTracker::new(1);
                cache
                    .get_or_fetch(
                        1,
                        "https://example.com/p",
                        SourceTier::Manufacturer,
                        Phase::Extract,
                        &tracker,
                    )
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(scraper.calls.load(Ordering::SeqCst), 1);
    }

    struct FlakyScraper {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PageScraper for FlakyScraper {
        async fn scrape(&self, _url: &str) -> Result<ScrapedContent, EnrichError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(EnrichError::Scrape("origin returned an error page".into()));
            }
            Ok(ScrapedContent {
                markdown: "# Product page".to_string(),
                credits_used: 1,
            })
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn failed_fetches_release_their_in_flight_slot() {
        let cache = PageCache::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FlakyScraper {
                calls: AtomicU32::new(0),
            }),
            Arc::new(RateLimiters::new(4)),
        );
        let tracker = CostTracker::new(1);

        let first = cache
            .get_or_fetch(
                1,
                "https://example.com/p",
                SourceTier::Manufacturer,
                Phase::Extract,
                &tracker,
            )
            .await;
        assert!(first.is_err());
        assert_eq!(cache.in_flight_len().await, 0);

        // The same key works again once the origin recovers.
        let entry = cache
            .get_or_fetch(
                1,
                "https://example.com/p",
                SourceTier::Manufacturer,
                Phase::Extract,
                &tracker,
            )
            .await
            .unwrap();
        assert_eq!(entry.url, "https://example.com/p");
        assert_eq!(cache.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn distinct_urls_fetch_separately() {
        let (cache, scraper) = cache_with_counter();
        let tracker = CostTracker::new(1);

        for url in ["https://a.example/p", "https://b.example/p"] {
            cache
                .get_or_fetch(1, url, SourceTier::ThirdParty, Phase::GapFill, &tracker)
                .await
                .unwrap();
        }

        assert_eq!(scraper.calls.load(Ordering::SeqCst), 2);
    }
}

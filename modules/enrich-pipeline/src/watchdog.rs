//! Crash and stall recovery.
//!
//! A product left in an active status with no heartbeat is orphaned work:
//! either the process died mid-run or a run wedged. The watchdog moves
//! such products to `error` with a reason, leaving every committed phase
//! output in place so a later retry resumes instead of restarting. It
//! never retries on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use enrich_common::{LogEntry, LogStatus, Phase, ProductRecord, ProductStatus};

use crate::events::EventBus;
use crate::store::ProductStore;

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// No heartbeat for this long means the run is considered dead.
    pub stall_threshold: Duration,
    pub tick_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stall_threshold: Duration::from_secs(15 * 60),
            tick_interval: Duration::from_secs(60),
        }
    }
}

pub struct Watchdog {
    store: Arc<dyn ProductStore>,
    bus: Arc<EventBus>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(store: Arc<dyn ProductStore>, bus: Arc<EventBus>, config: WatchdogConfig) -> Self {
        Self { store, bus, config }
    }

    /// Called once at process start: anything still active was orphaned by
    /// the previous process.
    pub async fn recover_on_start(&self) -> anyhow::Result<u32> {
        let orphaned = self.store.find_active().await?;
        let count = orphaned.len() as u32;
        for product in orphaned {
            warn!(
                product_id = product.id,
                status = %product.status,
                "Found product orphaned by restart"
            );
            self.mark_errored(&product, "process restarted mid-run")
                .await?;
        }
        if count > 0 {
            info!(count, "Recovered orphaned products on startup");
        }
        Ok(count)
    }

    /// One sweep for stalled runs. Split from `run` so tests can drive it
    /// with a chosen clock.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> anyhow::Result<u32> {
        let threshold = chrono::Duration::from_std(self.config.stall_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let stalled = self.store.find_stalled(now - threshold).await?;
        let count = stalled.len() as u32;
        for product in stalled {
            warn!(
                product_id = product.id,
                status = %product.status,
                last_heartbeat = %product.updated_at,
                "Run stalled, no progress"
            );
            self.mark_errored(&product, "stalled, no progress").await?;
        }
        Ok(count)
    }

    /// Periodic sweep loop; spawn once per process.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once_at(Utc::now()).await {
                error!(error = %e, "Watchdog sweep failed");
            }
        }
    }

    async fn mark_errored(&self, product: &ProductRecord, reason: &str) -> anyhow::Result<()> {
        self.store
            .update_status(product.id, ProductStatus::Error, Some(reason))
            .await?;
        let entry = LogEntry::new(
            phase_of(product.status),
            "watchdog",
            LogStatus::Error,
            reason,
        );
        self.store.append_log(product.id, &entry).await?;
        self.bus
            .status_changed(product.id, ProductStatus::Error, Some(reason.to_string()));
        self.bus.log_appended(product.id, entry);
        Ok(())
    }
}

fn phase_of(status: ProductStatus) -> Phase {
    match status {
        ProductStatus::Classifying => Phase::Classify,
        ProductStatus::Searching => Phase::Search,
        ProductStatus::Extracting => Phase::Extract,
        ProductStatus::GapFilling => Phase::GapFill,
        _ => Phase::Validate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use enrich_common::NewProduct;

    use crate::store::{MemoryStore, PhaseOutput, ProductStore};

    fn sample() -> NewProduct {
        NewProduct {
            ean: "4006381333931".to_string(),
            name: "Test Widget".to_string(),
            brand: None,
            weight: None,
            original_data: serde_json::json!({}),
        }
    }

    fn watchdog(store: Arc<MemoryStore>) -> Watchdog {
        Watchdog::new(store, Arc::new(EventBus::default()), WatchdogConfig::default())
    }

    #[tokio::test]
    async fn stalled_active_product_errors_and_keeps_outputs() {
        let store = Arc::new(MemoryStore::new());
        let record = store.insert_product(sample()).await.unwrap();
        store
            .save_phase_output(
                record.id,
                &PhaseOutput::Search(enrich_common::SearchOutcome::default()),
            )
            .await
            .unwrap();
        store
            .update_status(record.id, ProductStatus::Extracting, None)
            .await
            .unwrap();

        let dog = watchdog(store.clone());
        let past_threshold = Utc::now() + chrono::Duration::hours(1);
        let swept = dog.run_once_at(past_threshold).await.unwrap();
        assert_eq!(swept, 1);

        let product = store.get_product(record.id).await.unwrap().unwrap();
        assert_eq!(product.status, ProductStatus::Error);
        assert_eq!(product.current_step_detail.as_deref(), Some("stalled, no progress"));
        assert!(product.search_result.is_some());
    }

    #[tokio::test]
    async fn fresh_active_product_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let record = store.insert_product(sample()).await.unwrap();
        store
            .update_status(record.id, ProductStatus::Searching, None)
            .await
            .unwrap();

        let dog = watchdog(store.clone());
        let swept = dog.run_once_at(Utc::now()).await.unwrap();
        assert_eq!(swept, 0);

        let product = store.get_product(record.id).await.unwrap().unwrap();
        assert_eq!(product.status, ProductStatus::Searching);
    }

    #[tokio::test]
    async fn restart_recovery_errors_every_active_product() {
        let store = Arc::new(MemoryStore::new());
        let a = store.insert_product(sample()).await.unwrap();
        let b = store.insert_product(sample()).await.unwrap();
        let done = store.insert_product(sample()).await.unwrap();
        store
            .update_status(a.id, ProductStatus::Classifying, None)
            .await
            .unwrap();
        store
            .update_status(b.id, ProductStatus::Validating, None)
            .await
            .unwrap();
        store
            .update_status(done.id, ProductStatus::Done, None)
            .await
            .unwrap();

        let dog = watchdog(store.clone());
        assert_eq!(dog.recover_on_start().await.unwrap(), 2);

        for id in [a.id, b.id] {
            let product = store.get_product(id).await.unwrap().unwrap();
            assert_eq!(product.status, ProductStatus::Error);
            assert_eq!(
                product.current_step_detail.as_deref(),
                Some("process restarted mid-run")
            );
        }
        let done = store.get_product(done.id).await.unwrap().unwrap();
        assert_eq!(done.status, ProductStatus::Done);
    }
}

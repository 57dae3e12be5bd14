//! Live progress events for UI consumers.
//!
//! Fan-out over a tokio broadcast channel. Events are advisory: the store
//! is the source of truth, and a slow subscriber that lags simply misses
//! events rather than slowing the pipeline down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use enrich_common::{LogEntry, ProductStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StatusChanged {
        product_id: i64,
        status: ProductStatus,
        detail: Option<String>,
    },
    LogAppended {
        product_id: i64,
        entry: LogEntry,
    },
}

pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publish, dropping the event when nobody is listening.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn status_changed(&self, product_id: i64, status: ProductStatus, detail: Option<String>) {
        self.publish(PipelineEvent::StatusChanged {
            product_id,
            status,
            detail,
        });
    }

    pub fn log_appended(&self, product_id: i64, entry: LogEntry) {
        self.publish(PipelineEvent::LogAppended { product_id, entry });
    }
}

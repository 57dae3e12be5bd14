//! At-most-one active run per product.
//!
//! The guard tracks in-flight product ids in process memory. A successful
//! `begin` hands back a token whose drop releases the slot, so every exit
//! path out of a run (success, failure, panic unwind) releases it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use enrich_common::EnrichError;

#[derive(Default)]
pub struct RunGuard {
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

/// Proof that the holder owns the only active run for a product.
pub struct RunToken {
    product_id: i64,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot for `product_id`, or report who already holds it.
    pub fn begin(&self, product_id: i64) -> Result<RunToken, EnrichError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .expect("run guard lock poisoned");
        if !in_flight.insert(product_id) {
            return Err(EnrichError::AlreadyRunning(product_id));
        }
        Ok(RunToken {
            product_id,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_running(&self, product_id: i64) -> bool {
        self.in_flight
            .lock()
            .expect("run guard lock poisoned")
            .contains(&product_id)
    }
}

impl Drop for RunToken {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.product_id);
        }
    }
}

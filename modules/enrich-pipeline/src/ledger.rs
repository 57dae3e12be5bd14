//! Cost ledger and guardrails.
//!
//! Every capability call appends an entry with measured usage and a cost
//! computed from the static pricing table. Entries aggregate per product
//! (`CostTracker`) and per day (store-backed, consulted by `DailyGuard`
//! before any batch starts).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use enrich_common::{CostSummary, EnrichError, GuardrailLimits, Phase};

use crate::store::ProductStore;

// --- Pricing ---
// Update when provider prices change. All prices in USD.

#[derive(Debug, Clone, Copy)]
pub struct LlmPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CreditPricing {
    pub cost_per_credit: f64,
}

pub fn llm_pricing(model: &str) -> LlmPricing {
    // Haiku-class default; sonnet-class models billed higher.
    if model.contains("sonnet") {
        LlmPricing {
            input_per_million: 3.00,
            output_per_million: 15.00,
        }
    } else {
        LlmPricing {
            input_per_million: 1.00,
            output_per_million: 5.00,
        }
    }
}

pub fn credit_pricing(service: &str) -> CreditPricing {
    match service {
        "firecrawl" => CreditPricing {
            cost_per_credit: 0.00083,
        },
        "tavily" => CreditPricing {
            cost_per_credit: 0.008,
        },
        _ => CreditPricing {
            cost_per_credit: 0.0,
        },
    }
}

// --- Ledger entries ---

/// What produced an entry. Recorded at append time; a zero-credit API
/// call is still an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Llm,
    Api,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub kind: CallKind,
    pub service: String,
    pub phase: Phase,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub credits: u32,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// Accumulates all capability costs for a single product run.
/// Append-only; safe to share across the extract phase's page fan-out.
pub struct CostTracker {
    product_id: i64,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl CostTracker {
    pub fn new(product_id: i64) -> Self {
        Self {
            product_id,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record an LLM call; returns its cost in USD.
    pub fn add_llm_call(
        &self,
        model: &str,
        phase: Phase,
        input_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        let pricing = llm_pricing(model);
        let cost = (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million;

        debug!(
            product_id = self.product_id,
            model,
            phase = %phase,
            input_tokens,
            output_tokens,
            cost_usd = cost,
            "LLM call recorded"
        );

        self.push(LedgerEntry {
            kind: CallKind::Llm,
            service: model.to_string(),
            phase,
            input_tokens,
            output_tokens,
            credits: 0,
            cost_usd: cost,
            timestamp: Utc::now(),
        });
        cost
    }

    /// Record a non-LLM call (scrape, search); returns its cost in USD.
    pub fn add_api_call(&self, service: &str, phase: Phase, credits: u32) -> f64 {
        let cost = credits as f64 * credit_pricing(service).cost_per_credit;

        debug!(
            product_id = self.product_id,
            service,
            phase = %phase,
            credits,
            cost_usd = cost,
            "API call recorded"
        );

        self.push(LedgerEntry {
            kind: CallKind::Api,
            service: service.to_string(),
            phase,
            input_tokens: 0,
            output_tokens: 0,
            credits,
            cost_usd: cost,
            timestamp: Utc::now(),
        });
        cost
    }

    fn push(&self, entry: LedgerEntry) {
        self.entries
            .lock()
            .expect("cost tracker lock poisoned")
            .push(entry);
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.entries
            .lock()
            .expect("cost tracker lock poisoned")
            .iter()
            .map(|e| e.cost_usd)
            .sum()
    }

    /// Full summary for storage on the product record. The sum of entries
    /// equals the reported total by construction.
    pub fn summary(&self) -> CostSummary {
        let entries = self.entries.lock().expect("cost tracker lock poisoned");

        let mut summary = CostSummary::default();
        let mut by_phase: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_service: BTreeMap<String, f64> = BTreeMap::new();

        for e in entries.iter() {
            summary.total_cost_usd += e.cost_usd;
            summary.total_input_tokens += e.input_tokens;
            summary.total_output_tokens += e.output_tokens;
            match e.kind {
                CallKind::Llm => summary.llm_calls += 1,
                CallKind::Api => {
                    summary.api_calls += 1;
                    if e.credits > 0 {
                        *summary
                            .credits_by_service
                            .entry(e.service.clone())
                            .or_default() += e.credits;
                    }
                }
            }
            *by_phase.entry(e.phase.as_str().to_string()).or_default() += e.cost_usd;
            *by_service.entry(e.service.clone()).or_default() += e.cost_usd;
        }

        summary.cost_by_phase = by_phase;
        summary.cost_by_service = by_service;
        summary
    }
}

// --- Daily guard ---

/// Pre-flight guardrail check. Rejects without mutating any record.
pub struct DailyGuard {
    store: Arc<dyn ProductStore>,
    limits: Arc<RwLock<GuardrailLimits>>,
}

impl DailyGuard {
    pub fn new(store: Arc<dyn ProductStore>, limits: Arc<RwLock<GuardrailLimits>>) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> GuardrailLimits {
        self.limits
            .read()
            .expect("guardrail limits lock poisoned")
            .clone()
    }

    /// Check whether `requested` more products may be processed today.
    pub async fn check_can_process(&self, requested: u32) -> Result<(), EnrichError> {
        let limits = self.limits();
        let stats = self
            .store
            .daily_stats()
            .await
            .map_err(|e| EnrichError::Store(e.to_string()))?;

        if requested > limits.max_batch_size {
            return Err(EnrichError::BudgetExceeded(format!(
                "batch size {requested} exceeds maximum of {}; process in smaller batches",
                limits.max_batch_size
            )));
        }

        if stats.processed_today + requested > limits.daily_product_limit {
            return Err(EnrichError::BudgetExceeded(format!(
                "daily limit would be exceeded: processed {}/{} today, requested {requested}",
                stats.processed_today, limits.daily_product_limit
            )));
        }

        if stats.spend_today_usd >= limits.daily_budget_usd {
            return Err(EnrichError::BudgetExceeded(format!(
                "daily cost budget exhausted: spent ${:.2} / ${:.2} today",
                stats.spend_today_usd, limits.daily_budget_usd
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_sums_match_summary_total() {
        let tracker = CostTracker::new(1);
        tracker.add_llm_call("claude-haiku-4-5", Phase::Classify, 500, 300);
        tracker.add_llm_call("claude-haiku-4-5", Phase::Extract, 10_000, 1_500);
        tracker.add_api_call("firecrawl", Phase::Extract, 3);
        tracker.add_api_call("tavily", Phase::Search, 2);

        let summary = tracker.summary();
        let phase_total: f64 = summary.cost_by_phase.values().sum();
        let service_total: f64 = summary.cost_by_service.values().sum();

        assert!((summary.total_cost_usd - tracker.total_cost_usd()).abs() < 1e-12);
        assert!((summary.total_cost_usd - phase_total).abs() < 1e-12);
        assert!((summary.total_cost_usd - service_total).abs() < 1e-12);
        assert_eq!(summary.llm_calls, 2);
        assert_eq!(summary.api_calls, 2);
        assert_eq!(summary.total_input_tokens, 10_500);
        assert_eq!(summary.credits_by_service.get("firecrawl"), Some(&3));
    }

    #[test]
    fn zero_credit_api_calls_are_still_api_calls() {
        let tracker = CostTracker::new(1);
        tracker.add_api_call("tavily", Phase::Search, 0);
        tracker.add_llm_call("claude-haiku-4-5", Phase::Classify, 100, 50);

        let summary = tracker.summary();
        assert_eq!(summary.api_calls, 1);
        assert_eq!(summary.llm_calls, 1);
        assert!(summary.credits_by_service.is_empty());
    }

    #[test]
    fn sonnet_models_cost_more() {
        let haiku = llm_pricing("claude-haiku-4-5");
        let sonnet = llm_pricing("claude-sonnet-4-5");
        assert!(sonnet.input_per_million > haiku.input_per_million);
    }
}

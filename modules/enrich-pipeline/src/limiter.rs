//! Shared rate limiting for external services.
//!
//! One `ServiceLimiter` per service class, shared across all concurrently
//! running products. Each limiter enforces two independent bounds: a
//! concurrency ceiling (semaphore) and a sustained call rate (token bucket
//! with continuous refill). A call must hold both before proceeding;
//! waiting suspends the calling phase step, never the whole process.
//!
//! Limiters are constructed once and passed down explicitly — there is no
//! process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    pub max_in_flight: usize,
    /// Token bucket ceiling.
    pub burst: f64,
    /// Tokens refilled per second.
    pub refill_per_sec: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct ServiceLimiter {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    bucket: Mutex<Bucket>,
    config: LimiterConfig,
}

/// Held for the duration of one external call; releases the concurrency
/// slot on drop. The rate token is consumed, not returned.
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl ServiceLimiter {
    pub fn new(name: &'static str, config: LimiterConfig) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            bucket: Mutex::new(Bucket {
                tokens: config.burst,
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    /// Acquire a concurrency slot and a rate token, suspending until both
    /// are available.
    pub async fn acquire(&self) -> LimiterPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore never closed");

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens =
                    (bucket.tokens + elapsed * self.config.refill_per_sec).min(self.config.burst);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    // Time until one whole token is available.
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / self.config.refill_per_sec,
                    ))
                }
            };

            match wait {
                None => break,
                Some(d) => {
                    debug!(service = self.name, wait_ms = d.as_millis() as u64, "Rate limited");
                    tokio::time::sleep(d).await;
                }
            }
        }

        LimiterPermit { _permit: permit }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The limiter bundle shared by every product run, plus the outer bound on
/// how many products run at once.
pub struct RateLimiters {
    pub search: ServiceLimiter,
    pub scrape: ServiceLimiter,
    pub reasoning: ServiceLimiter,
    pub vision: ServiceLimiter,
    pub products: Arc<Semaphore>,
}

impl RateLimiters {
    pub fn new(max_concurrent_products: usize) -> Self {
        Self {
            search: ServiceLimiter::new(
                "search",
                LimiterConfig {
                    max_in_flight: 4,
                    burst: 5.0,
                    refill_per_sec: 2.0,
                },
            ),
            scrape: ServiceLimiter::new(
                "scrape",
                LimiterConfig {
                    max_in_flight: 3,
                    burst: 5.0,
                    refill_per_sec: 1.0,
                },
            ),
            reasoning: ServiceLimiter::new(
                "reasoning",
                LimiterConfig {
                    max_in_flight: 4,
                    burst: 10.0,
                    refill_per_sec: 2.0,
                },
            ),
            vision: ServiceLimiter::new(
                "vision",
                LimiterConfig {
                    max_in_flight: 2,
                    burst: 3.0,
                    refill_per_sec: 0.5,
                },
            ),
            products: Arc::new(Semaphore::new(max_concurrent_products)),
        }
    }
}

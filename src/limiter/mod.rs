//! Rate limiting over the shared key-value store
//!
//! Fixed-window counters: each `(key_prefix, window_start)` pair owns one
//! counter with a TTL of one window. The window is the floor of now over
//! `window_ms`, so the behavior is an approximate sliding window - exact
//! sliding windows would need a sorted set per key and the simpler model
//! is accepted here.

use std::sync::Arc;

use chrono::Utc;

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::kv::KvStore;

/// Outcome of a rate limit check.
#[derive(Debug, Clone)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: i64,
    /// Unix epoch milliseconds at which the current window ends
    pub reset_time_ms: u64,
    pub total_hits: i64,
}

/// Start of the window containing `now_ms`.
pub fn window_start(now_ms: u64, window_ms: u64) -> u64 {
    (now_ms / window_ms) * window_ms
}

/// Counter key for a window. `check` and `record` derive keys identically.
pub fn counter_key(prefix: &str, window_start_ms: u64) -> String {
    format!("{}:{}", prefix, window_start_ms)
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Fixed-window rate limiter backed by the shared store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read-only check of the current window.
    pub async fn check(&self, config: &RateLimitConfig) -> Result<RateLimitStatus> {
        self.check_at(config, now_ms()).await
    }

    /// Count this request against the current window and set the counter
    /// TTL. Call after a successful `check`.
    pub async fn record(&self, config: &RateLimitConfig) -> Result<i64> {
        self.record_at(config, now_ms()).await
    }

    /// Re-check after sleeping to each window boundary, at most
    /// `max_retries` times. Returns the first allowed status, or the last
    /// blocked one once retries are exhausted.
    pub async fn check_with_retry(&self, config: &RateLimitConfig) -> Result<RateLimitStatus> {
        let mut status = self.check(config).await?;

        for attempt in 0..config.max_retries {
            if status.allowed {
                return Ok(status);
            }

            let wait_ms = status.reset_time_ms.saturating_sub(now_ms());
            tracing::debug!(
                attempt,
                wait_ms,
                prefix = %config.key_prefix,
                "Rate limited, waiting for next window"
            );
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms + 1)).await;

            status = self.check(config).await?;
        }

        Ok(status)
    }

    pub(crate) async fn check_at(
        &self,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> Result<RateLimitStatus> {
        let start = window_start(now_ms, config.window_ms);
        let key = counter_key(&config.key_prefix, start);

        let total_hits = self
            .store
            .get(&key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(RateLimitStatus {
            allowed: total_hits < config.max_requests,
            remaining: (config.max_requests - total_hits).max(0),
            reset_time_ms: start + config.window_ms,
            total_hits,
        })
    }

    pub(crate) async fn record_at(&self, config: &RateLimitConfig, now_ms: u64) -> Result<i64> {
        let start = window_start(now_ms, config.window_ms);
        let key = counter_key(&config.key_prefix, start);

        let count = self.store.incr(&key).await?;
        // TTL is always set on the incremented key
        self.store
            .expire(&key, config.window_ms.div_ceil(1000))
            .await?;

        Ok(count)
    }
}

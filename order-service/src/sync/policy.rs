//! Reconciliation policy
//!
//! Last-writer-wins by user version, a fixed redelivery ceiling and the
//! periodic sweep settings. All knobs are plain data so the host can fill
//! them from its configuration.

use message_bus::RetryPolicy;
use std::time::Duration;

/// Deliveries allowed before an envelope is dead-lettered
pub const DEFAULT_MAX_REDELIVERIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct ReconciliationPolicy {
    /// A failing envelope is dead-lettered on this delivery
    pub max_redeliveries: u32,
    /// Per-order store retries inside one delivery
    pub store_retry: RetryPolicy,
    /// Delay before a nacked envelope is delivered again
    pub redelivery_backoff: RetryPolicy,
    /// Max deliveries leased per poll
    pub batch_size: usize,
    /// Idle wait between polls
    pub poll_interval: Duration,
    /// How long processed event ids are remembered
    pub dedup_window: Duration,
    /// Sweep period
    pub sweep_interval: Duration,
    /// An order is resynced when the user's version is ahead by more than this
    pub staleness_threshold: u64,
}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            store_retry: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_secs(1)),
            redelivery_backoff: RetryPolicy::new(
                DEFAULT_MAX_REDELIVERIES,
                Duration::from_secs(1),
                Duration::from_secs(60),
            ),
            batch_size: 16,
            poll_interval: Duration::from_secs(1),
            dedup_window: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(300),
            staleness_threshold: 0,
        }
    }
}

impl ReconciliationPolicy {
    /// Whether a failed delivery has used up its budget
    pub fn should_dead_letter(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_redeliveries
    }

    pub fn redelivery_delay(&self, delivery_count: u32) -> Duration {
        self.redelivery_backoff.delay_for(delivery_count)
    }

    /// Whether an order synced at `synced_version` lags `user_version` too far
    pub fn is_stale(&self, synced_version: u64, user_version: u64) -> bool {
        user_version.saturating_sub(synced_version) > self.staleness_threshold
    }

    pub fn dedup_window_millis(&self) -> i64 {
        i64::try_from(self.dedup_window.as_millis()).unwrap_or(i64::MAX)
    }
}

//! Storage backends for counters, claims and event logs.
//!
//! The [`StorageBackend`] trait abstracts over the shared [`RedisStore`] and the
//! in-process [`MemoryStore`], so the limiter, deduplicator and abuse tracker
//! work with either. Backend faults are reported as [`BackendError`] and never
//! as a fabricated result; deciding what an outage means is left to callers.

mod memory;
mod remote;

pub use self::memory::{MemoryStore, SweepStats};
pub use self::remote::{RedisStore, RedisStoreConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// The backend could not complete an operation.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend refused the connection or returned an error.
    #[error("{backend} unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },

    /// The backend did not answer within the per-call timeout.
    #[error("{backend} did not respond within {timeout:?}")]
    Timeout {
        backend: &'static str,
        timeout: Duration,
    },
}

/// Result of an atomic windowed increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count after this increment.
    pub count: u64,
    /// Time left until the window expires.
    pub ttl: Duration,
}

/// Key-value operations the abuse-mitigation core needs from a store.
///
/// Every method must be atomic per key and safe to call concurrently.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Increment `key`, creating it at 1 with an expiry of `window` if absent
    /// or expired. Returns the new count and the remaining time-to-live.
    async fn increment_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, BackendError>;

    /// Set `key` only if absent, expiring after `ttl`. Returns whether this
    /// call created the claim.
    async fn claim_once(&self, key: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Add an event at `at` to the ordered set under `key`, dropping events
    /// older than `at - retention`.
    async fn append_event(
        &self,
        key: &str,
        at: DateTime<Utc>,
        retention: Duration,
    ) -> Result<(), BackendError>;

    /// Drop events older than `retain_after`, then count the events at or
    /// after `since`.
    async fn count_events(
        &self,
        key: &str,
        since: DateTime<Utc>,
        retain_after: DateTime<Utc>,
    ) -> Result<u64, BackendError>;
}

//! Fixed-window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::policy::PolicyConfig;
use crate::clock::{add_duration, duration_between, Clock, SystemClock};
use crate::store::StorageBackend;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Whether the request is within quota
    pub allowed: bool,
    /// Requests allowed per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// Set when the backend was unreachable and the failure mode decided
    pub degraded: bool,
}

impl RateLimitStatus {
    /// Time from `now` until the window resets.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        duration_between(now, self.reset_at)
    }
}

/// Counts requests per identifier in fixed windows.
///
/// Each check is a single atomic increment on the backend. A window opens on
/// the first request for a key and ends `window` later, so up to twice the
/// limit can pass across a window boundary.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter over the given backend using the system clock.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Count one request for `identifier` and report whether it is within quota.
    ///
    /// Backend failures never surface as errors: the policy's failure mode
    /// decides the outcome and the status is marked `degraded`.
    pub async fn check(&self, identifier: &str, config: &PolicyConfig) -> RateLimitStatus {
        let key = format!("rl:{}", identifier);

        trace!(key = %key, limit = config.limit(), "Checking rate limit");

        match self.backend.increment_with_expiry(&key, config.window()).await {
            Ok(window) => {
                let now = self.clock.now();
                let allowed = window.count <= config.limit();

                if !allowed {
                    debug!(
                        key = %key,
                        count = window.count,
                        limit = config.limit(),
                        "Rate limit exceeded"
                    );
                }

                RateLimitStatus {
                    allowed,
                    limit: config.limit(),
                    remaining: config.limit().saturating_sub(window.count),
                    reset_at: add_duration(now, window.ttl),
                    degraded: false,
                }
            }
            Err(e) => {
                let allowed = config.failure_mode().allows();
                warn!(
                    key = %key,
                    backend = self.backend.name(),
                    error = %e,
                    failure_mode = %config.failure_mode(),
                    allowed,
                    "Rate limit backend unavailable, applying failure mode"
                );

                RateLimitStatus {
                    allowed,
                    limit: config.limit(),
                    remaining: if allowed { config.limit() } else { 0 },
                    reset_at: add_duration(self.clock.now(), config.window()),
                    degraded: true,
                }
            }
        }
    }
}

//! Per-operation policy configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BulwarkError, Result};

/// What to do when the storage backend cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Allow the request. Suits public, low-risk endpoints.
    #[default]
    Open,
    /// Deny the request. Suits cost-sensitive or privileged endpoints.
    Closed,
}

impl FailureMode {
    /// Whether requests are allowed while the backend is down.
    pub fn allows(&self) -> bool {
        matches!(self, FailureMode::Open)
    }
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureMode::Open => write!(f, "open"),
            FailureMode::Closed => write!(f, "closed"),
        }
    }
}

/// Validated, immutable limits for one protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    limit: u64,
    window: Duration,
    dedup_ttl: Option<Duration>,
    failure_mode: FailureMode,
}

impl PolicyConfig {
    /// Create a policy allowing `limit` requests per `window`.
    ///
    /// Fails if `limit` or `window` is zero.
    pub fn new(limit: u64, window: Duration, failure_mode: FailureMode) -> Result<Self> {
        if limit == 0 {
            return Err(BulwarkError::invalid("policy", "limit must be greater than zero"));
        }
        if window.is_zero() {
            return Err(BulwarkError::invalid("policy", "window must be greater than zero"));
        }

        Ok(Self {
            limit,
            window,
            dedup_ttl: None,
            failure_mode,
        })
    }

    /// Enable session deduplication with the given claim lifetime.
    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Result<Self> {
        if ttl.is_zero() {
            return Err(BulwarkError::invalid("policy", "dedup ttl must be greater than zero"));
        }
        self.dedup_ttl = Some(ttl);
        Ok(self)
    }

    /// Requests allowed per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Length of one counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Claim lifetime, or `None` when deduplication is disabled.
    pub fn dedup_ttl(&self) -> Option<Duration> {
        self.dedup_ttl
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }
}

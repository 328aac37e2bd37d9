//! Rolling abuse scores per identifier.
//!
//! Every non-duplicate attempt is appended to a time-ordered log for the
//! client. The score is the number of attempts within a lookback window. It is
//! a secondary signal for review or stricter downstream handling and never
//! rejects a request on its own.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{trace, warn};

use crate::clock::{sub_duration, Clock, SystemClock};
use crate::error::{BulwarkError, Result};
use crate::store::{BackendError, StorageBackend};

/// Score at which an identifier is flagged for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewThreshold {
    /// Window the score is computed over
    pub lookback: Duration,
    /// Score at or above which the identifier is flagged
    pub threshold: u64,
}

/// Snapshot of an identifier's recent activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbuseAssessment {
    pub identifier: String,
    pub score: u64,
    pub lookback_secs: u64,
    pub flagged: bool,
}

/// Tracks attempts per identifier and computes rolling scores.
#[derive(Debug, Clone)]
pub struct AbuseTracker {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    review: Option<ReviewThreshold>,
}

impl AbuseTracker {
    /// Create a tracker that keeps events for `retention`.
    pub fn new(backend: Arc<dyn StorageBackend>, retention: Duration) -> Result<Self> {
        Self::with_clock(backend, Arc::new(SystemClock::new()), retention)
    }

    /// Create a tracker with an explicit clock.
    pub fn with_clock(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        retention: Duration,
    ) -> Result<Self> {
        if retention.is_zero() {
            return Err(BulwarkError::invalid("abuse", "retention must be greater than zero"));
        }
        Ok(Self {
            backend,
            clock,
            retention,
            review: None,
        })
    }

    /// Flag identifiers whose score over `lookback` reaches `threshold`.
    pub fn with_review(mut self, lookback: Duration, threshold: u64) -> Result<Self> {
        if lookback.is_zero() || lookback > self.retention {
            return Err(BulwarkError::invalid(
                "abuse",
                "lookback must be greater than zero and no longer than retention",
            ));
        }
        if threshold == 0 {
            return Err(BulwarkError::invalid("abuse", "flag threshold must be greater than zero"));
        }
        self.review = Some(ReviewThreshold { lookback, threshold });
        Ok(self)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn review(&self) -> Option<ReviewThreshold> {
        self.review
    }

    /// Append an attempt by `identifier` at the current time.
    pub async fn record(&self, identifier: &str) -> std::result::Result<(), BackendError> {
        let key = event_key(identifier);
        self.backend
            .append_event(&key, self.clock.now(), self.retention)
            .await?;
        trace!(key = %key, "Recorded attempt");
        Ok(())
    }

    /// Count attempts by `identifier` within `lookback` of now.
    ///
    /// Events older than the retention window are removed as a side effect.
    /// A lookback longer than retention is capped to it.
    pub async fn score_since(
        &self,
        identifier: &str,
        lookback: Duration,
    ) -> std::result::Result<u64, BackendError> {
        let now = self.clock.now();
        let since = sub_duration(now, lookback.min(self.retention));
        let retain_after = sub_duration(now, self.retention);
        self.backend
            .count_events(&event_key(identifier), since, retain_after)
            .await
    }

    /// Score `identifier` over the review lookback (or the full retention when
    /// no review threshold is configured).
    pub async fn assess(&self, identifier: &str) -> std::result::Result<AbuseAssessment, BackendError> {
        let lookback = self
            .review
            .map(|r| r.lookback)
            .unwrap_or(self.retention);
        let score = self.score_since(identifier, lookback).await?;
        let flagged = self.review.is_some_and(|r| score >= r.threshold);

        Ok(AbuseAssessment {
            identifier: identifier.to_string(),
            score,
            lookback_secs: lookback.as_secs(),
            flagged,
        })
    }

    /// Record an attempt, then assess it when a review threshold is configured,
    /// logging identifiers that reach it.
    pub async fn record_and_assess(
        &self,
        identifier: &str,
    ) -> std::result::Result<Option<AbuseAssessment>, BackendError> {
        self.record(identifier).await?;
        if self.review.is_none() {
            return Ok(None);
        }

        let assessment = self.assess(identifier).await?;
        if assessment.flagged {
            warn!(
                identifier = %identifier,
                score = assessment.score,
                lookback_secs = assessment.lookback_secs,
                "Identifier flagged for review"
            );
        }
        Ok(Some(assessment))
    }
}

fn event_key(identifier: &str) -> String {
    format!("abuse:{}", identifier)
}

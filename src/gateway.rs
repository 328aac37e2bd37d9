//! Per-operation policy gateway.
//!
//! Each protected operation owns one [`PolicyGateway`]. An evaluation walks a
//! fixed sequence:
//!
//! 1. If the attempt carries a resource/session pair and the policy enables
//!    deduplication, a repeated claim ends in [`Outcome::DeniedDuplicate`]
//!    without touching quota or abuse score.
//! 2. The rate limiter counts the attempt and the abuse tracker records it,
//!    whatever the rate outcome.
//! 3. Over quota ends in [`Outcome::DeniedRateLimit`], otherwise
//!    [`Outcome::Allowed`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::abuse::AbuseTracker;
use crate::clock::{Clock, SystemClock};
use crate::dedup::SessionDeduplicator;
use crate::identifier::Identifier;
use crate::ratelimit::{PolicyConfig, RateLimitStatus, RateLimiter};
use crate::store::StorageBackend;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// One inbound action against a protected operation.
#[derive(Debug, Clone)]
pub struct Attempt {
    identifier: Identifier,
    session: Option<(String, String)>,
}

impl Attempt {
    /// An attempt by the given client.
    pub fn new(identifier: impl Into<Identifier>) -> Self {
        Self {
            identifier: identifier.into(),
            session: None,
        }
    }

    /// Tie the attempt to a logical event so repeats by the same session are
    /// counted once.
    pub fn for_session(mut self, resource_key: impl Into<String>, session_key: impl Into<String>) -> Self {
        self.session = Some((resource_key.into(), session_key.into()));
        self
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }
}

/// Terminal state of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    DeniedDuplicate,
    DeniedRateLimit,
}

/// Result of evaluating an attempt, with what the transport layer needs to
/// build its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub operation: String,
    pub outcome: Outcome,
    /// Quota state; absent for duplicates, which never reach the limiter
    pub rate: Option<RateLimitStatus>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allowed
    }

    /// Status code for an HTTP response. Duplicates are benign and answer 200.
    pub fn status_code(&self) -> u16 {
        match self.outcome {
            Outcome::DeniedRateLimit => 429,
            Outcome::Allowed | Outcome::DeniedDuplicate => 200,
        }
    }

    /// Whole seconds until the window resets, at least one, on rate denial.
    pub fn retry_after_secs(&self) -> Option<u64> {
        if self.outcome != Outcome::DeniedRateLimit {
            return None;
        }
        let rate = self.rate.as_ref()?;
        let wait = rate.retry_after(self.decided_at);
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        Some(secs.max(1))
    }

    /// Rate limit response headers as name/value pairs.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let Some(rate) = &self.rate else {
            return Vec::new();
        };

        let mut headers = vec![
            (HEADER_LIMIT, rate.limit.to_string()),
            (HEADER_REMAINING, rate.remaining.to_string()),
            (HEADER_RESET, rate.reset_at.timestamp().to_string()),
        ];
        if let Some(secs) = self.retry_after_secs() {
            headers.push((HEADER_RETRY_AFTER, secs.to_string()));
        }
        headers
    }
}

/// Composes deduplication, rate limiting and abuse tracking for one operation.
#[derive(Debug)]
pub struct PolicyGateway {
    operation: String,
    config: PolicyConfig,
    dedup: SessionDeduplicator,
    limiter: RateLimiter,
    tracker: Arc<AbuseTracker>,
    clock: Arc<dyn Clock>,
    detach_recording: bool,
}

impl PolicyGateway {
    /// Create a gateway for `operation` using the system clock.
    pub fn new(
        operation: impl Into<String>,
        config: PolicyConfig,
        backend: Arc<dyn StorageBackend>,
        tracker: Arc<AbuseTracker>,
    ) -> Self {
        Self::with_clock(operation, config, backend, tracker, Arc::new(SystemClock::new()))
    }

    /// Create a gateway with an explicit clock.
    pub fn with_clock(
        operation: impl Into<String>,
        config: PolicyConfig,
        backend: Arc<dyn StorageBackend>,
        tracker: Arc<AbuseTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let operation = operation.into();
        info!(
            operation = %operation,
            limit = config.limit(),
            window_secs = config.window().as_secs(),
            dedup_ttl_secs = config.dedup_ttl().map(|t| t.as_secs()),
            failure_mode = %config.failure_mode(),
            backend = backend.name(),
            "Policy gateway configured"
        );

        Self {
            dedup: SessionDeduplicator::new(Arc::clone(&backend)),
            limiter: RateLimiter::with_clock(backend, Arc::clone(&clock)),
            operation,
            config,
            tracker,
            clock,
            detach_recording: false,
        }
    }

    /// Record abuse events on a spawned task instead of awaiting them.
    ///
    /// Requires a Tokio runtime at evaluation time.
    pub fn detach_recording(mut self, detach: bool) -> Self {
        self.detach_recording = detach;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Decide whether `attempt` may proceed.
    #[instrument(
        skip(self, attempt),
        fields(operation = %self.operation, identifier = %attempt.identifier)
    )]
    pub async fn evaluate(&self, attempt: &Attempt) -> Decision {
        if let (Some(ttl), Some((resource, session))) = (self.config.dedup_ttl(), &attempt.session) {
            match self.dedup.try_claim(resource, session, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(resource = %resource, "Duplicate session event");
                    return self.decide(Outcome::DeniedDuplicate, None);
                }
                Err(e) => {
                    // Treated as a first claim; the limiter applies the failure mode.
                    warn!(error = %e, resource = %resource, "Dedup claim failed");
                }
            }
        }

        let key = attempt.identifier.scoped(&self.operation);
        let status = self.limiter.check(&key, &self.config).await;

        self.record(attempt.identifier.as_str()).await;

        let outcome = if status.allowed {
            Outcome::Allowed
        } else {
            Outcome::DeniedRateLimit
        };
        debug!(outcome = ?outcome, remaining = status.remaining, "Decision made");
        self.decide(outcome, Some(status))
    }

    async fn record(&self, identifier: &str) {
        if self.detach_recording {
            let tracker = Arc::clone(&self.tracker);
            let identifier = identifier.to_string();
            tokio::spawn(async move {
                if let Err(e) = tracker.record_and_assess(&identifier).await {
                    warn!(error = %e, identifier = %identifier, "Failed to record attempt");
                }
            });
        } else if let Err(e) = self.tracker.record_and_assess(identifier).await {
            warn!(error = %e, identifier = %identifier, "Failed to record attempt");
        }
    }

    fn decide(&self, outcome: Outcome, rate: Option<RateLimitStatus>) -> Decision {
        Decision {
            operation: self.operation.clone(),
            outcome,
            rate,
            decided_at: self.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::FailureMode;
    use crate::store::testing::UnavailableStore;
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct Harness {
        gateway: PolicyGateway,
        tracker: Arc<AbuseTracker>,
        clock: MockClock,
    }

    fn harness(config: PolicyConfig) -> Harness {
        let clock = MockClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store: Arc<dyn StorageBackend> = Arc::new(MemoryStore::with_clock(Arc::clone(&shared)));
        let tracker = Arc::new(
            AbuseTracker::with_clock(Arc::clone(&store), Arc::clone(&shared), Duration::from_secs(3600))
                .unwrap(),
        );
        let gateway = PolicyGateway::with_clock("views", config, store, Arc::clone(&tracker), shared);
        Harness {
            gateway,
            tracker,
            clock,
        }
    }

    fn views_policy(limit: u64) -> PolicyConfig {
        PolicyConfig::new(limit, Duration::from_secs(60), FailureMode::Open)
            .unwrap()
            .with_dedup_ttl(Duration::from_secs(1800))
            .unwrap()
    }

    async fn score(h: &Harness, identifier: &str) -> u64 {
        h.tracker
            .score_since(identifier, Duration::from_secs(3600))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_then_rate_limited() {
        let h = harness(PolicyConfig::new(2, Duration::from_secs(60), FailureMode::Open).unwrap());
        let attempt = Attempt::new("198.51.100.4");

        assert_eq!(h.gateway.evaluate(&attempt).await.outcome, Outcome::Allowed);
        assert_eq!(h.gateway.evaluate(&attempt).await.outcome, Outcome::Allowed);

        let denied = h.gateway.evaluate(&attempt).await;
        assert_eq!(denied.outcome, Outcome::DeniedRateLimit);
        assert_eq!(denied.status_code(), 429);
        assert_eq!(denied.rate.as_ref().unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_duplicate_leaves_quota_and_score_untouched() {
        let h = harness(views_policy(5));
        let first = Attempt::new("198.51.100.4").for_session("post:42", "S1");

        let allowed = h.gateway.evaluate(&first).await;
        assert_eq!(allowed.outcome, Outcome::Allowed);
        assert_eq!(allowed.rate.unwrap().remaining, 4);
        assert_eq!(score(&h, "198.51.100.4").await, 1);

        let duplicate = h.gateway.evaluate(&first).await;
        assert_eq!(duplicate.outcome, Outcome::DeniedDuplicate);
        assert_eq!(duplicate.status_code(), 200);
        assert!(duplicate.rate.is_none());
        assert!(duplicate.headers().is_empty());
        assert_eq!(score(&h, "198.51.100.4").await, 1);

        let other_session = Attempt::new("198.51.100.4").for_session("post:42", "S2");
        let next = h.gateway.evaluate(&other_session).await;
        assert_eq!(next.outcome, Outcome::Allowed);
        assert_eq!(next.rate.unwrap().remaining, 3);
    }

    #[tokio::test]
    async fn test_dedup_skipped_without_session() {
        let h = harness(views_policy(5));
        let attempt = Attempt::new("a");

        assert!(h.gateway.evaluate(&attempt).await.is_allowed());
        assert!(h.gateway.evaluate(&attempt).await.is_allowed());
    }

    #[tokio::test]
    async fn test_dedup_ignored_when_policy_disables_it() {
        let h = harness(PolicyConfig::new(5, Duration::from_secs(60), FailureMode::Open).unwrap());
        let attempt = Attempt::new("a").for_session("post:42", "S1");

        assert!(h.gateway.evaluate(&attempt).await.is_allowed());
        let second = h.gateway.evaluate(&attempt).await;
        assert!(second.is_allowed());
        assert_eq!(second.rate.unwrap().remaining, 3);
    }

    #[tokio::test]
    async fn test_denied_attempts_are_still_recorded() {
        let h = harness(PolicyConfig::new(1, Duration::from_secs(60), FailureMode::Open).unwrap());
        let attempt = Attempt::new("a");

        for _ in 0..4 {
            h.gateway.evaluate(&attempt).await;
        }
        assert_eq!(score(&h, "a").await, 4);
    }

    #[tokio::test]
    async fn test_blank_identifiers_share_anonymous_bucket() {
        let h = harness(PolicyConfig::new(1, Duration::from_secs(60), FailureMode::Open).unwrap());

        assert!(h.gateway.evaluate(&Attempt::new("")).await.is_allowed());
        let second = h.gateway.evaluate(&Attempt::new("  ")).await;
        assert_eq!(second.outcome, Outcome::DeniedRateLimit);
        assert_eq!(score(&h, crate::identifier::ANONYMOUS).await, 2);
    }

    #[tokio::test]
    async fn test_headers_on_denial() {
        let h = harness(PolicyConfig::new(1, Duration::from_secs(60), FailureMode::Open).unwrap());
        let attempt = Attempt::new("a");

        let allowed = h.gateway.evaluate(&attempt).await;
        let reset = allowed.rate.as_ref().unwrap().reset_at.timestamp().to_string();
        assert_eq!(
            allowed.headers(),
            vec![
                (HEADER_LIMIT, "1".to_string()),
                (HEADER_REMAINING, "0".to_string()),
                (HEADER_RESET, reset.clone()),
            ]
        );

        h.clock.advance(Duration::from_secs(15));
        let denied = h.gateway.evaluate(&attempt).await;
        assert_eq!(denied.retry_after_secs(), Some(45));
        assert_eq!(denied.headers().last().unwrap(), &(HEADER_RETRY_AFTER, "45".to_string()));
        assert_eq!(denied.headers()[2], (HEADER_RESET, reset));
    }

    #[tokio::test]
    async fn test_operations_do_not_share_quota() {
        let h = harness(PolicyConfig::new(1, Duration::from_secs(60), FailureMode::Open).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(h.clock.clone());
        let store: Arc<dyn StorageBackend> = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
        let shares = PolicyGateway::with_clock(
            "shares",
            PolicyConfig::new(1, Duration::from_secs(60), FailureMode::Open).unwrap(),
            store,
            Arc::clone(&h.tracker),
            clock,
        );

        assert!(h.gateway.evaluate(&Attempt::new("a")).await.is_allowed());
        assert!(shares.evaluate(&Attempt::new("a")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_outage_follows_failure_mode() {
        let store: Arc<dyn StorageBackend> = Arc::new(UnavailableStore);
        let tracker = Arc::new(AbuseTracker::new(Arc::clone(&store), Duration::from_secs(60)).unwrap());

        let open = PolicyGateway::new(
            "views",
            views_policy(1),
            Arc::clone(&store),
            Arc::clone(&tracker),
        );
        let closed = PolicyGateway::new(
            "contact",
            PolicyConfig::new(1, Duration::from_secs(60), FailureMode::Closed).unwrap(),
            store,
            tracker,
        );

        let attempt = Attempt::new("a").for_session("post:42", "S1");
        for _ in 0..3 {
            let decision = open.evaluate(&attempt).await;
            assert!(decision.is_allowed());
            assert!(decision.rate.unwrap().degraded);

            assert_eq!(closed.evaluate(&attempt).await.outcome, Outcome::DeniedRateLimit);
        }
    }

    #[tokio::test]
    async fn test_detached_recording_completes() {
        let h = harness(PolicyConfig::new(10, Duration::from_secs(60), FailureMode::Open).unwrap());
        let gateway = h.gateway.detach_recording(true);

        gateway.evaluate(&Attempt::new("a")).await;

        let mut recorded = 0;
        for _ in 0..50 {
            recorded = h
                .tracker
                .score_since("a", Duration::from_secs(60))
                .await
                .unwrap();
            if recorded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(recorded, 1);
    }
}

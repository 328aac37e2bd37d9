//! Assembly of the backend, abuse tracker and per-operation gateways.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::abuse::{AbuseAssessment, AbuseTracker};
use crate::clock::{Clock, SystemClock};
use crate::config::BulwarkConfig;
use crate::error::{BulwarkError, Result};
use crate::gateway::{Attempt, Decision, PolicyGateway};
use crate::store::{MemoryStore, RedisStore, StorageBackend};

/// All protected operations of one process, sharing a backend and tracker.
#[derive(Debug)]
pub struct Bulwark {
    backend: Arc<dyn StorageBackend>,
    tracker: Arc<AbuseTracker>,
    gateways: BTreeMap<String, PolicyGateway>,
    sweeper: Option<JoinHandle<()>>,
}

impl Bulwark {
    /// Build from configuration, connecting to Redis when a URL is set.
    ///
    /// If Redis is configured but unreachable at startup, the in-memory store
    /// is used instead. Invalid configuration fails before any connection is
    /// attempted.
    pub async fn from_config(config: &BulwarkConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        if let Some(redis) = config.store.redis() {
            match RedisStore::connect(redis).await {
                Ok(store) => {
                    info!("Using Redis store");
                    return Self::with_backend(config, Arc::new(store), clock);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Redis unreachable, falling back to the in-memory store; limits are per instance"
                    );
                }
            }
        }

        let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
        let sweeper = store.spawn_sweeper(config.store.sweep_interval());
        info!(
            sweep_interval_secs = config.store.sweep_interval_secs,
            "Using in-memory store"
        );

        let mut bulwark = Self::with_backend(config, store, clock)?;
        bulwark.sweeper = Some(sweeper);
        Ok(bulwark)
    }

    /// Build over an existing backend and clock.
    pub fn with_backend(
        config: &BulwarkConfig,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let policies = config.validate()?;

        let mut tracker = AbuseTracker::with_clock(
            Arc::clone(&backend),
            Arc::clone(&clock),
            config.abuse.retention(),
        )?;
        if let Some(threshold) = config.abuse.flag_threshold {
            tracker = tracker.with_review(config.abuse.lookback(), threshold)?;
        }
        let tracker = Arc::new(tracker);

        let gateways = policies
            .into_iter()
            .map(|(name, policy)| {
                let gateway = PolicyGateway::with_clock(
                    name.clone(),
                    policy,
                    Arc::clone(&backend),
                    Arc::clone(&tracker),
                    Arc::clone(&clock),
                )
                .detach_recording(config.abuse.detached);
                (name, gateway)
            })
            .collect();

        Ok(Self {
            backend,
            tracker,
            gateways,
            sweeper: None,
        })
    }

    /// Evaluate an attempt against the named policy.
    pub async fn evaluate(&self, policy: &str, attempt: &Attempt) -> Result<Decision> {
        let gateway = self.gateway(policy)?;
        Ok(gateway.evaluate(attempt).await)
    }

    /// The gateway for the named policy.
    pub fn gateway(&self, policy: &str) -> Result<&PolicyGateway> {
        self.gateways
            .get(policy)
            .ok_or_else(|| BulwarkError::UnknownPolicy(policy.to_string()))
    }

    /// Names of the configured policies, sorted.
    pub fn policies(&self) -> impl Iterator<Item = &str> {
        self.gateways.keys().map(String::as_str)
    }

    pub fn abuse(&self) -> &AbuseTracker {
        &self.tracker
    }

    /// Abuse assessment for `identifier` over the configured review lookback.
    pub async fn assess(&self, identifier: &str) -> Result<AbuseAssessment> {
        Ok(self.tracker.assess(identifier).await?)
    }

    /// Abuse score for `identifier` over an explicit lookback.
    pub async fn score(&self, identifier: &str, lookback: Duration) -> Result<u64> {
        Ok(self.tracker.score_since(identifier, lookback).await?)
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

impl Drop for Bulwark {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::gateway::Outcome;
    use crate::store::testing::UnavailableStore;
    use crate::store::BackendError;

    const CONFIG: &str = r#"
abuse:
  retention_secs: 3600
  lookback_secs: 600
  flag_threshold: 3
  detached: false
policies:
  contact_form:
    limit: 2
    window_secs: 3600
    failure_mode: closed
  views:
    limit: 100
    window_secs: 60
    dedup_ttl_secs: 1800
"#;

    fn bulwark() -> (Bulwark, MockClock) {
        let config = BulwarkConfig::from_yaml(CONFIG).unwrap();
        let clock = MockClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::with_clock(Arc::clone(&shared)));
        (Bulwark::with_backend(&config, store, shared).unwrap(), clock)
    }

    #[tokio::test]
    async fn test_policies_are_listed() {
        let (bulwark, _clock) = bulwark();
        assert_eq!(bulwark.policies().collect::<Vec<_>>(), vec!["contact_form", "views"]);
        assert_eq!(bulwark.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let (bulwark, _clock) = bulwark();
        let err = bulwark.evaluate("checkout", &Attempt::new("a")).await.unwrap_err();
        assert!(matches!(err, BulwarkError::UnknownPolicy(name) if name == "checkout"));
    }

    #[tokio::test]
    async fn test_abuse_score_spans_operations() {
        let (bulwark, _clock) = bulwark();

        bulwark.evaluate("contact_form", &Attempt::new("a")).await.unwrap();
        bulwark
            .evaluate("views", &Attempt::new("a").for_session("post:1", "S1"))
            .await
            .unwrap();
        bulwark.evaluate("views", &Attempt::new("a")).await.unwrap();

        let assessment = bulwark.abuse().assess("a").await.unwrap();
        assert_eq!(assessment.score, 3);
        assert!(assessment.flagged);
    }

    #[tokio::test]
    async fn test_contact_form_window() {
        let (bulwark, clock) = bulwark();
        let attempt = Attempt::new("203.0.113.1");

        for _ in 0..2 {
            let decision = bulwark.evaluate("contact_form", &attempt).await.unwrap();
            assert_eq!(decision.outcome, Outcome::Allowed);
        }
        let denied = bulwark.evaluate("contact_form", &attempt).await.unwrap();
        assert_eq!(denied.outcome, Outcome::DeniedRateLimit);

        clock.advance(Duration::from_secs(3600));
        let fresh = bulwark.evaluate("contact_form", &attempt).await.unwrap();
        assert_eq!(fresh.outcome, Outcome::Allowed);
        assert_eq!(fresh.rate.unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_from_config_without_redis_uses_memory() {
        let config = BulwarkConfig::from_yaml(CONFIG).unwrap();
        let bulwark = Bulwark::from_config(&config).await.unwrap();
        assert_eq!(bulwark.backend_name(), "memory");
        assert!(bulwark.sweeper.is_some());
    }

    #[tokio::test]
    async fn test_from_config_falls_back_when_redis_unreachable() {
        let mut config = BulwarkConfig::from_yaml(CONFIG).unwrap();
        config.store.redis_url = Some("redis://192.0.2.1:6390/".to_string());
        config.store.connect_timeout_ms = 100;

        let bulwark = Bulwark::from_config(&config).await.unwrap();
        assert_eq!(bulwark.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let mut config = BulwarkConfig::from_yaml(CONFIG).unwrap();
        config.policies.get_mut("views").unwrap().window_secs = 0;

        let err = Bulwark::from_config(&config).await.unwrap_err();
        assert!(matches!(err, BulwarkError::InvalidConfig { name, .. } if name == "views"));
    }

    #[tokio::test]
    async fn test_score_reports_backend_errors() {
        let config = BulwarkConfig::from_yaml(CONFIG).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(MockClock::starting_now());
        let bulwark = Bulwark::with_backend(&config, Arc::new(UnavailableStore), clock).unwrap();

        let err = bulwark.assess("a").await.unwrap_err();
        assert!(matches!(err, BulwarkError::Backend(BackendError::Unavailable { .. })));

        let err = bulwark.score("a", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, BulwarkError::Backend(_)));
    }

    #[tokio::test]
    async fn test_score_over_explicit_lookback() {
        let (bulwark, clock) = bulwark();

        bulwark.evaluate("views", &Attempt::new("a")).await.unwrap();
        clock.advance(Duration::from_secs(120));
        bulwark.evaluate("views", &Attempt::new("a")).await.unwrap();

        assert_eq!(bulwark.score("a", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(bulwark.score("a", Duration::from_secs(600)).await.unwrap(), 2);
        assert_eq!(bulwark.assess("a").await.unwrap().score, 2);
    }
}

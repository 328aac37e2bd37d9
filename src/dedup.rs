//! One-time claims per (resource, session) pair.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::store::{BackendError, StorageBackend};

/// Ensures one session counts at most once per resource within a TTL.
///
/// A repeated view or share from the same reader is benign client behaviour,
/// so callers reject it quietly without charging quota or abuse score.
#[derive(Debug, Clone)]
pub struct SessionDeduplicator {
    backend: Arc<dyn StorageBackend>,
}

impl SessionDeduplicator {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Claim `(resource_key, session_key)` for `ttl`.
    ///
    /// Returns `true` exactly once per pair until the claim expires.
    pub async fn try_claim(
        &self,
        resource_key: &str,
        session_key: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let key = claim_key(resource_key, session_key);
        let claimed = self.backend.claim_once(&key, ttl).await?;
        trace!(key = %key, claimed, "Dedup claim attempted");
        Ok(claimed)
    }
}

/// Builds `dedup:{resource}:{session}`.
///
/// Parts are joined as-is, so `(a:b, c)` and `(a, b:c)` share a key. Session
/// keys are expected to be opaque tokens without `:`.
fn claim_key(resource_key: &str, session_key: &str) -> String {
    format!("dedup:{}:{}", resource_key, session_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::testing::UnavailableStore;
    use crate::store::MemoryStore;

    const TTL: Duration = Duration::from_secs(1800);

    fn dedup_with_clock() -> (SessionDeduplicator, MockClock) {
        let clock = MockClock::starting_now();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (SessionDeduplicator::new(store), clock)
    }

    #[test]
    fn test_claim_key_format() {
        assert_eq!(claim_key("post:42", "S1"), "dedup:post:42:S1");
    }

    #[test]
    fn test_claim_key_joins_parts_verbatim() {
        assert_eq!(claim_key("a:b", "c"), claim_key("a", "b:c"));
        assert_ne!(claim_key("post:42", "S1"), claim_key("post:4", "2:S1:x"));
    }

    #[tokio::test]
    async fn test_post_42_scenario() {
        let (dedup, _clock) = dedup_with_clock();

        assert!(dedup.try_claim("post:42", "S1", TTL).await.unwrap());
        assert!(!dedup.try_claim("post:42", "S1", TTL).await.unwrap());
        assert!(dedup.try_claim("post:42", "S2", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_available_again_after_ttl() {
        let (dedup, clock) = dedup_with_clock();

        assert!(dedup.try_claim("post:42", "S1", TTL).await.unwrap());
        clock.advance(Duration::from_secs(1799));
        assert!(!dedup.try_claim("post:42", "S1", TTL).await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(dedup.try_claim("post:42", "S1", TTL).await.unwrap());
    }

    #[test]
    fn test_resources_are_independent() {
        let (dedup, _clock) = dedup_with_clock();

        tokio_test::block_on(async {
            assert!(dedup.try_claim("post:1", "S1", TTL).await.unwrap());
            assert!(dedup.try_claim("post:2", "S1", TTL).await.unwrap());
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_succeed_once() {
        let dedup = SessionDeduplicator::new(Arc::new(MemoryStore::new()));

        let attempts = (0..50).map(|_| {
            let dedup = dedup.clone();
            tokio::spawn(async move { dedup.try_claim("post:7", "S1", TTL).await.unwrap() })
        });

        let wins = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported() {
        let dedup = SessionDeduplicator::new(Arc::new(UnavailableStore));
        let result = dedup.try_claim("post:42", "S1", TTL).await;
        assert!(matches!(result, Err(BackendError::Unavailable { .. })));
    }
}

//! Redis-backed storage shared by every running instance.
//!
//! Each operation is one round trip: the windowed increment runs as a Lua
//! script so count and expiry are set together, claims use `SET NX PX`, and
//! event logs are sorted sets scored by epoch milliseconds, updated in a
//! `MULTI`/`EXEC` pipeline. Every call is bounded by `timeout`; on expiry or
//! any Redis error the caller receives a [`BackendError`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, info};

use super::{BackendError, StorageBackend, WindowCount};

const BACKEND: &str = "redis";

/// `INCR` the key, giving it an expiry when it is new or somehow lost its TTL.
/// Returns `{count, pttl}`.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1/`
    pub url: String,
    /// Prefix prepended to every key
    pub key_prefix: String,
    /// Upper bound on a single operation
    pub timeout: Duration,
    /// Upper bound on establishing the initial connection
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            key_prefix: "bulwark:".to_string(),
            timeout: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Storage backend over a shared Redis instance.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    increment: Script,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl From<RedisError> for BackendError {
    fn from(e: RedisError) -> Self {
        BackendError::Unavailable {
            backend: BACKEND,
            reason: e.to_string(),
        }
    }
}

impl RedisStore {
    /// Connect using the given configuration.
    ///
    /// Fails if the URL is invalid or the server cannot be reached within
    /// `connect_timeout`.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, BackendError> {
        info!(
            url = %config.url,
            key_prefix = %config.key_prefix,
            timeout_ms = config.timeout.as_millis() as u64,
            "Connecting to Redis"
        );

        let client = Client::open(config.url.as_str())?;
        let connection = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| BackendError::Timeout {
                backend: BACKEND,
                timeout: config.connect_timeout,
            })??;

        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
            config,
        })
    }

    /// The configuration this store was built with.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Run one Redis operation under the per-call timeout.
    async fn bounded<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.config.timeout, op).await {
            Ok(result) => result.map_err(BackendError::from),
            Err(_) => Err(BackendError::Timeout {
                backend: BACKEND,
                timeout: self.config.timeout,
            }),
        }
    }
}

fn millis(d: Duration) -> u64 {
    // Redis rejects a zero expiry.
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Score below which events fall outside `retention` of `at`.
fn retention_cutoff(at: DateTime<Utc>, retention: Duration) -> i64 {
    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
    at.timestamp_millis().saturating_sub(retention_ms)
}

/// Unique sorted-set member so simultaneous events are all kept.
fn event_member(at: DateTime<Utc>) -> String {
    format!("{}:{}", at.timestamp_millis(), uuid::Uuid::new_v4())
}

#[async_trait]
impl StorageBackend for RedisStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, BackendError> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        let mut invocation = self.increment.key(&key);
        invocation.arg(millis(window));

        let (count, ttl_ms): (u64, i64) = self.bounded(invocation.invoke_async(&mut conn)).await?;

        debug!(key = %key, count, ttl_ms, "Incremented window counter");
        Ok(WindowCount {
            count,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn claim_once(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(1).arg("NX").arg("PX").arg(millis(ttl));

        let reply: Option<redis::Value> = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn append_event(
        &self,
        key: &str,
        at: DateTime<Utc>,
        retention: Duration,
    ) -> Result<(), BackendError> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        let cutoff = retention_cutoff(at, retention);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg(at.timestamp_millis())
            .arg(event_member(at))
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(format!("({}", cutoff))
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(millis(retention))
            .ignore();

        let () = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn count_events(
        &self,
        key: &str,
        since: DateTime<Utc>,
        retain_after: DateTime<Utc>,
    ) -> Result<u64, BackendError> {
        let key = self.key(key);
        let mut conn = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(format!("({}", retain_after.timestamp_millis()))
            .ignore()
            .cmd("ZCOUNT")
            .arg(&key)
            .arg(since.timestamp_millis())
            .arg("+inf");

        let (count,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }
}

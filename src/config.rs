//! Configuration management for Bulwark.
//!
//! Configuration is read from a YAML file, with any value overridable through
//! `BULWARK__`-prefixed environment variables using `__` as the path
//! separator, e.g. `BULWARK__STORE__REDIS_URL=redis://cache:6379/`.
//! Policy names are case-insensitive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{BulwarkError, Result};
use crate::ratelimit::{FailureMode, PolicyConfig};
use crate::store::RedisStoreConfig;

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Storage backend configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Abuse tracking configuration
    #[serde(default)]
    pub abuse: AbuseConfig,

    /// Protected operations by name
    #[serde(default)]
    pub policies: BTreeMap<String, PolicySettings>,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; the in-memory store is used when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Initial connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How often the in-memory store sweeps expired entries, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_key_prefix() -> String {
    "bulwark:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_sweep_interval() -> u64 {
    60
}

impl StoreConfig {
    /// Redis settings, or `None` when no URL is configured.
    pub fn redis(&self) -> Option<RedisStoreConfig> {
        let url = self.redis_url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        Some(RedisStoreConfig {
            url: url.to_string(),
            key_prefix: self.key_prefix.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Abuse tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// How long events are kept, in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Window the review score is computed over, in seconds
    #[serde(default = "default_lookback")]
    pub lookback_secs: u64,

    /// Score within the lookback at which an identifier is flagged
    #[serde(default)]
    pub flag_threshold: Option<u64>,

    /// Record events on a spawned task rather than inline
    #[serde(default = "default_true")]
    pub detached: bool,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            lookback_secs: default_lookback(),
            flag_threshold: None,
            detached: default_true(),
        }
    }
}

fn default_retention() -> u64 {
    3600
}

fn default_lookback() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl AbuseConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }
}

/// Limits for one protected operation as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Requests allowed per window
    pub limit: u64,

    /// Window length in seconds
    pub window_secs: u64,

    /// Dedup claim lifetime in seconds; omit to disable deduplication
    #[serde(default)]
    pub dedup_ttl_secs: Option<u64>,

    /// Behaviour when the backend is unavailable
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl PolicySettings {
    /// Validate into an enforceable policy.
    pub fn to_policy(&self, name: &str) -> Result<PolicyConfig> {
        let build = || -> Result<PolicyConfig> {
            let policy = PolicyConfig::new(
                self.limit,
                Duration::from_secs(self.window_secs),
                self.failure_mode,
            )?;
            match self.dedup_ttl_secs {
                Some(ttl) => policy.with_dedup_ttl(Duration::from_secs(ttl)),
                None => Ok(policy),
            }
        };

        build().map_err(|e| match e {
            BulwarkError::InvalidConfig { reason, .. } => BulwarkError::invalid(name, reason),
            other => other,
        })
    }
}

impl BulwarkConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("BULWARK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BulwarkError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BulwarkError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Check every section, returning the validated policies by name.
    pub fn validate(&self) -> Result<BTreeMap<String, PolicyConfig>> {
        if self.abuse.retention_secs == 0 {
            return Err(BulwarkError::invalid("abuse", "retention_secs must be greater than zero"));
        }
        if self.abuse.lookback_secs == 0 || self.abuse.lookback_secs > self.abuse.retention_secs {
            return Err(BulwarkError::invalid(
                "abuse",
                "lookback_secs must be greater than zero and no longer than retention_secs",
            ));
        }
        if self.abuse.flag_threshold == Some(0) {
            return Err(BulwarkError::invalid("abuse", "flag_threshold must be greater than zero"));
        }
        if self.store.timeout_ms == 0 {
            return Err(BulwarkError::invalid("store", "timeout_ms must be greater than zero"));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(BulwarkError::invalid("store", "sweep_interval_secs must be greater than zero"));
        }
        if self.policies.is_empty() {
            return Err(BulwarkError::Config("no policies configured".to_string()));
        }

        self.policies
            .iter()
            .map(|(name, settings)| settings.to_policy(name).map(|policy| (name.clone(), policy)))
            .collect()
    }
}

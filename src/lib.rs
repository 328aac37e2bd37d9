//! Bulwark - Abuse Mitigation for Public Endpoints
//!
//! This crate protects unauthenticated endpoints such as contact forms,
//! view counters and data APIs from automated abuse. It combines fixed-window
//! rate limiting, one-time session claims and rolling abuse scores over a
//! shared Redis store, falling back to an in-process store when no shared
//! store is available.

pub mod abuse;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod identifier;
pub mod ratelimit;
pub mod service;
pub mod store;

pub use abuse::{AbuseAssessment, AbuseTracker};
pub use config::BulwarkConfig;
pub use dedup::SessionDeduplicator;
pub use error::{BulwarkError, Result};
pub use gateway::{Attempt, Decision, Outcome, PolicyGateway};
pub use identifier::Identifier;
pub use ratelimit::{FailureMode, PolicyConfig, RateLimitStatus, RateLimiter};
pub use service::Bulwark;
pub use store::{BackendError, MemoryStore, RedisStore, StorageBackend};

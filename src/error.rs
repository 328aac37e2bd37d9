//! Error types for the Bulwark service.

use thiserror::Error;

use crate::store::BackendError;

/// Main error type for Bulwark operations.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy was configured with values that cannot be enforced
    #[error("Invalid configuration for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    /// A request named a policy that was never configured
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// The storage backend could not be reached
    #[error("Storage backend error: {0}")]
    Backend(#[from] BackendError),
}

impl BulwarkError {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;

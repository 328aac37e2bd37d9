//! Client identifiers used to partition rate-limit and abuse state.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Shared bucket for requests that arrive without a usable identifier.
pub const ANONYMOUS: &str = "anonymous";

/// An opaque client key, normally a network address.
///
/// Blank input maps to the shared [`ANONYMOUS`] bucket instead of being
/// rejected, so a broken address extractor throttles the anonymous bucket
/// rather than denying every unauthenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Build an identifier from raw input, trimming surrounding whitespace.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            debug!("Empty identifier, using the anonymous bucket");
            return Self::anonymous();
        }
        Self(trimmed.to_string())
    }

    /// Build an identifier from an optional value; `None` is anonymous.
    pub fn from_optional(raw: Option<&str>) -> Self {
        raw.map(Self::new).unwrap_or_else(Self::anonymous)
    }

    /// The shared anonymous identifier.
    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    /// Whether this is the shared anonymous bucket.
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Composite key `scope:identifier`.
    pub fn scoped(&self, scope: &str) -> String {
        format!("{}:{}", scope, self.0)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Identifier {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

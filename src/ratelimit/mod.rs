//! Rate limiting logic and per-operation policies.

mod limiter;
mod policy;

pub use limiter::{RateLimitStatus, RateLimiter};
pub use policy::{FailureMode, PolicyConfig};

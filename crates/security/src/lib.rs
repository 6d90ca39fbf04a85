//! Request admission for pilestore: per-peer rate limiting and bearer-token checks.

pub mod auth;
pub mod rate_limiter;

pub use auth::{has_bearer_token, DISABLED_TOKEN};
pub use rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter};

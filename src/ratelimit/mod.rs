//! Rate limiting decisions and limit resolution.

mod limiter;
mod rules;

pub use limiter::{Decision, RateLimiter, WINDOW};
pub use rules::{LimitKey, RateLimitConfig, ResolvedLimit, TokenLimit};

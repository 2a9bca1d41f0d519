//! Counting and blocking storage for the rate limiter.
//!
//! The limiter only talks to a [`RateLimitStore`]; the in-process
//! [`MemoryStore`] and the networked [`RedisStore`] are interchangeable.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, RedisStoreConfig};

/// Storage contract for request counters and key blocks.
///
/// Counters live in fixed windows: the first increment for a key opens a
/// window of the given length, later increments in that window do not
/// extend it, and once it has elapsed the key reads as zero again.
/// Blocks are timed independently of counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Requests seen for `key` in its current window; 0 for unknown or
    /// expired keys.
    async fn get_request_count(&self, ctx: &Context, key: &str) -> Result<u64>;

    /// Atomically count one request for `key`, opening a new window of
    /// `window` if none is active.
    async fn increment_request_count(&self, ctx: &Context, key: &str, window: Duration)
        -> Result<()>;

    /// Whether an unexpired block exists for `key`.
    async fn is_blocked(&self, ctx: &Context, key: &str) -> Result<bool>;

    /// Block `key` for `duration` from now, replacing any earlier block.
    /// A zero duration leaves the key unblocked.
    async fn block(&self, ctx: &Context, key: &str, duration: Duration) -> Result<()>;

    /// Remove any block for `key`. Idempotent.
    async fn unblock(&self, ctx: &Context, key: &str) -> Result<()>;

    /// Release connections and background tasks. Call once, at shutdown,
    /// with no other operations in flight.
    async fn close(&self) -> Result<()>;
}

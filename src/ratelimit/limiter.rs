//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::rules::{RateLimitConfig, ResolvedLimit};
use crate::context::Context;
use crate::error::Result;
use crate::store::RateLimitStore;

/// Length of a counting window.
pub const WINDOW: Duration = Duration::from_secs(1);

const REASON_ALLOWED: &str = "Request allowed";
const REASON_IP_BLOCKED: &str = "IP is blocked";
const REASON_TOKEN_BLOCKED: &str = "Token is blocked";

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Human-readable cause, suitable for showing to the client.
    pub reason: String,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: REASON_ALLOWED.to_string(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Admits or rejects requests by client IP and optional access token.
///
/// Uses a fixed one-second window per key. A key that reaches its limit
/// is blocked for its configured duration, and the request that reached
/// the limit is itself denied. Concurrent checks for the same key are only
/// as ordered as the store's increments, so a window can briefly admit up
/// to (concurrency - 1) requests past the limit.
///
/// Store failures are returned as errors, never folded into a decision:
/// whether to fail open or closed is the caller's call.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: Arc<RateLimitConfig>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter, rejecting unusable limits up front.
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Result<Self> {
        config.validate()?;

        debug!(
            ip_requests_per_second = config.ip_requests_per_second,
            ip_block_duration_minutes = config.ip_block_duration_minutes,
            tokens = config.token_limits.len(),
            "Rate limiter configured"
        );

        Ok(Self {
            store,
            config: Arc::new(config),
        })
    }

    /// Decide whether a request from `ip`, presenting `token` (empty for
    /// none), may proceed.
    ///
    /// An IP block is checked first and cannot be bypassed with a token.
    pub async fn check_request(&self, ctx: &Context, ip: &str, token: &str) -> Result<Decision> {
        trace!(ip = %ip, has_token = !token.is_empty(), "Checking request");

        if self.store.is_blocked(ctx, ip).await.map_err(|e| {
            warn!(ip = %ip, error = %e, "Failed to check IP block status");
            e
        })? {
            debug!(ip = %ip, "Denied: IP is blocked");
            return Ok(Decision::deny(REASON_IP_BLOCKED));
        }

        if !token.is_empty()
            && self.store.is_blocked(ctx, token).await.map_err(|e| {
                warn!(error = %e, "Failed to check token block status");
                e
            })?
        {
            debug!(ip = %ip, "Denied: token is blocked");
            return Ok(Decision::deny(REASON_TOKEN_BLOCKED));
        }

        let limit = self.config.resolve(ip, token);
        self.count_or_block(ctx, limit).await.map_err(|e| {
            warn!(key = %limit.key, error = %e, "Rate limit check failed");
            e
        })
    }

    async fn count_or_block(&self, ctx: &Context, limit: ResolvedLimit<'_>) -> Result<Decision> {
        let key = limit.key.as_str();
        let current = self.store.get_request_count(ctx, key).await?;

        if current >= limit.requests_per_second {
            if limit.block_duration.is_zero() {
                debug!(key = %limit.key, count = current, "Limit reached; zero block duration, not blocking");
            } else {
                self.store.block(ctx, key, limit.block_duration).await?;
                debug!(
                    key = %limit.key,
                    count = current,
                    limit = limit.requests_per_second,
                    block_secs = limit.block_duration.as_secs(),
                    "Rate limit exceeded, key blocked"
                );
            }

            return Ok(Decision::deny(format!(
                "Rate limit exceeded: {} requests per second",
                limit.requests_per_second
            )));
        }

        self.store.increment_request_count(ctx, key, WINDOW).await?;
        trace!(key = %limit.key, count = current + 1, "Request allowed");

        Ok(Decision::allow())
    }

    /// Requests still available in the current window for this caller.
    ///
    /// Advisory only; never used to gate a decision.
    pub async fn remaining_requests(&self, ctx: &Context, ip: &str, token: &str) -> Result<u64> {
        let limit = self.config.resolve(ip, token);
        let current = self.store.get_request_count(ctx, limit.key.as_str()).await?;
        Ok(limit.requests_per_second.saturating_sub(current))
    }

    /// Whether the IP, or else the token if one is given, is blocked.
    pub async fn is_blocked(&self, ctx: &Context, ip: &str, token: &str) -> Result<bool> {
        if self.store.is_blocked(ctx, ip).await? {
            return Ok(true);
        }

        if token.is_empty() {
            return Ok(false);
        }

        self.store.is_blocked(ctx, token).await
    }

    /// Block an IP or token for `duration`, replacing any existing block.
    pub async fn block(&self, ctx: &Context, key: &str, duration: Duration) -> Result<()> {
        self.store.block(ctx, key, duration).await?;
        debug!(key = %key, duration_secs = duration.as_secs(), "Key blocked by administrator");
        Ok(())
    }

    /// Lift any block on an IP or token.
    pub async fn unblock(&self, ctx: &Context, key: &str) -> Result<()> {
        self.store.unblock(ctx, key).await?;
        debug!(key = %key, "Key unblocked by administrator");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use tokio::sync::Barrier;
    use tokio_test::{assert_err, assert_ok};

    fn limiter_with(config: RateLimitConfig) -> (RateLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), config).unwrap();
        (limiter, store)
    }

    /// A store whose backend is always down.
    struct UnavailableStore;

    #[async_trait]
    impl RateLimitStore for UnavailableStore {
        async fn get_request_count(&self, _: &Context, _: &str) -> Result<u64> {
            Err(TurnstileError::StoreUnavailable("connection refused".to_string()))
        }
        async fn increment_request_count(&self, _: &Context, _: &str, _: Duration) -> Result<()> {
            Err(TurnstileError::StoreUnavailable("connection refused".to_string()))
        }
        async fn is_blocked(&self, _: &Context, _: &str) -> Result<bool> {
            Err(TurnstileError::StoreUnavailable("connection refused".to_string()))
        }
        async fn block(&self, _: &Context, _: &str, _: Duration) -> Result<()> {
            Err(TurnstileError::StoreUnavailable("connection refused".to_string()))
        }
        async fn unblock(&self, _: &Context, _: &str) -> Result<()> {
            Err(TurnstileError::StoreUnavailable("connection refused".to_string()))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Holds every count read until two readers have arrived, forcing two
    /// checks to observe the same count before either increments.
    struct LockstepStore {
        inner: MemoryStore,
        barrier: Barrier,
    }

    #[async_trait]
    impl RateLimitStore for LockstepStore {
        async fn get_request_count(&self, ctx: &Context, key: &str) -> Result<u64> {
            let count = self.inner.get_request_count(ctx, key).await?;
            self.barrier.wait().await;
            Ok(count)
        }
        async fn increment_request_count(&self, ctx: &Context, key: &str, window: Duration) -> Result<()> {
            self.inner.increment_request_count(ctx, key, window).await
        }
        async fn is_blocked(&self, ctx: &Context, key: &str) -> Result<bool> {
            self.inner.is_blocked(ctx, key).await
        }
        async fn block(&self, ctx: &Context, key: &str, duration: Duration) -> Result<()> {
            self.inner.block(ctx, key, duration).await
        }
        async fn unblock(&self, ctx: &Context, key: &str) -> Result<()> {
            self.inner.unblock(ctx, key).await
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let store = Arc::new(MemoryStore::new());
        let err = RateLimiter::new(store, RateLimitConfig::new(0, 1)).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidConfiguration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_limit_blocks_and_recovers() {
        let (limiter, _store) = limiter_with(RateLimitConfig::new(3, 1));
        let ctx = Context::background();
        let ip = "10.0.0.1";

        for i in 1..=3 {
            let decision = limiter.check_request(&ctx, ip, "").await.unwrap();
            assert!(decision.allowed, "Request {} should be allowed", i);
            assert_eq!(decision.reason, "Request allowed");
        }

        let decision = limiter.check_request(&ctx, ip, "").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "Rate limit exceeded: 3 requests per second");
        assert!(limiter.is_blocked(&ctx, ip, "").await.unwrap());

        // The window resets long before the block lifts.
        tokio::time::advance(Duration::from_secs(2)).await;
        let decision = limiter.check_request(&ctx, ip, "").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "IP is blocked");

        tokio::time::advance(Duration::from_secs(58)).await;
        assert!(!limiter.is_blocked(&ctx, ip, "").await.unwrap());
        let decision = limiter.check_request(&ctx, ip, "").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_n_allowed_per_window() {
        for n in [1u64, 2, 7, 20] {
            let (limiter, _store) = limiter_with(RateLimitConfig::new(n, 1));
            let ctx = Context::background();

            let mut allowed = 0;
            for _ in 0..n + 5 {
                if limiter.check_request(&ctx, "ip", "").await.unwrap().allowed {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, n);
        }
    }

    #[tokio::test]
    async fn test_token_limit_independent_of_ip_counter() {
        let config = RateLimitConfig::new(2, 1).with_token("abc", 5, 1);
        let (limiter, _store) = limiter_with(config);
        let ctx = Context::background();
        let ip = "1.2.3.4";

        for i in 1..=5 {
            assert!(
                limiter.check_request(&ctx, ip, "abc").await.unwrap().allowed,
                "Token request {} should be allowed",
                i
            );

            if i == 2 {
                // Same IP, no token: counted against the IP, untouched so far.
                assert!(limiter.check_request(&ctx, ip, "").await.unwrap().allowed);
                assert_eq!(limiter.remaining_requests(&ctx, ip, "").await.unwrap(), 1);
            }
        }

        let decision = limiter.check_request(&ctx, ip, "abc").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "Rate limit exceeded: 5 requests per second");

        assert!(limiter.is_blocked(&ctx, ip, "abc").await.unwrap());
        assert!(!limiter.is_blocked(&ctx, ip, "").await.unwrap());

        let decision = limiter.check_request(&ctx, ip, "abc").await.unwrap();
        assert_eq!(decision.reason, "Token is blocked");
    }

    #[tokio::test]
    async fn test_unknown_token_falls_back_to_ip() {
        let config = RateLimitConfig::new(2, 1).with_token("known-token", 10, 5);
        let (limiter, store) = limiter_with(config);
        let ctx = Context::background();
        let ip = "192.168.1.1";

        for _ in 0..2 {
            assert!(limiter.check_request(&ctx, ip, "unknown-token").await.unwrap().allowed);
        }
        let decision = limiter.check_request(&ctx, ip, "unknown-token").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "Rate limit exceeded: 2 requests per second");

        // The IP was blocked, not the unrecognized token.
        assert!(store.is_blocked(&ctx, ip).await.unwrap());
        assert!(!store.is_blocked(&ctx, "unknown-token").await.unwrap());

        let decision = limiter.check_request(&ctx, ip, "").await.unwrap();
        assert_eq!(decision.reason, "IP is blocked");
    }

    #[tokio::test]
    async fn test_ip_block_cannot_be_bypassed_with_token() {
        let config = RateLimitConfig::new(1, 1).with_token("vip", 100, 1);
        let (limiter, _store) = limiter_with(config);
        let ctx = Context::background();

        limiter.block(&ctx, "5.6.7.8", Duration::from_secs(60)).await.unwrap();

        let decision = limiter.check_request(&ctx, "5.6.7.8", "vip").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "IP is blocked");

        // The token still works from another address.
        assert!(limiter.check_request(&ctx, "9.9.9.9", "vip").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_block_checked_for_any_token() {
        let (limiter, _store) = limiter_with(RateLimitConfig::new(10, 1));
        let ctx = Context::background();

        limiter.block(&ctx, "stolen", Duration::from_secs(60)).await.unwrap();

        let decision = limiter.check_request(&ctx, "1.1.1.1", "stolen").await.unwrap();
        assert_eq!(decision, Decision::deny("Token is blocked"));
        assert!(limiter.is_blocked(&ctx, "1.1.1.1", "stolen").await.unwrap());
    }

    #[tokio::test]
    async fn test_unblock_restores_access() {
        let (limiter, _store) = limiter_with(RateLimitConfig::new(1, 10));
        let ctx = Context::background();

        assert!(limiter.check_request(&ctx, "ip", "").await.unwrap().allowed);
        assert!(!limiter.check_request(&ctx, "ip", "").await.unwrap().allowed);
        assert!(limiter.is_blocked(&ctx, "ip", "").await.unwrap());

        assert_ok!(limiter.unblock(&ctx, "ip").await);
        assert_ok!(limiter.unblock(&ctx, "ip").await);
        assert!(!limiter.is_blocked(&ctx, "ip", "").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_requests() {
        let (limiter, _store) = limiter_with(RateLimitConfig::new(3, 1));
        let ctx = Context::background();

        assert_eq!(limiter.remaining_requests(&ctx, "ip", "").await.unwrap(), 3);
        for expected in [2, 1, 0] {
            limiter.check_request(&ctx, "ip", "").await.unwrap();
            assert_eq!(limiter.remaining_requests(&ctx, "ip", "").await.unwrap(), expected);
        }

        // Denied checks are not counted; the floor holds.
        limiter.check_request(&ctx, "ip", "").await.unwrap();
        assert_eq!(limiter.remaining_requests(&ctx, "ip", "").await.unwrap(), 0);

        tokio::time::advance(WINDOW).await;
        assert_eq!(limiter.remaining_requests(&ctx, "ip", "").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_remaining_never_negative_after_overshoot() {
        let (limiter, store) = limiter_with(RateLimitConfig::new(2, 1));
        let ctx = Context::background();

        for _ in 0..5 {
            store.increment_request_count(&ctx, "ip", WINDOW).await.unwrap();
        }
        assert_eq!(limiter.remaining_requests(&ctx, "ip", "").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_self_heals_without_block() {
        let (limiter, _store) = limiter_with(RateLimitConfig::new(2, 1));
        let ctx = Context::background();

        assert!(limiter.check_request(&ctx, "ip", "").await.unwrap().allowed);
        assert!(limiter.check_request(&ctx, "ip", "").await.unwrap().allowed);

        tokio::time::advance(WINDOW).await;

        assert!(limiter.check_request(&ctx, "ip", "").await.unwrap().allowed);
        assert!(limiter.check_request(&ctx, "ip", "").await.unwrap().allowed);
        assert!(!limiter.check_request(&ctx, "ip", "").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_zero_block_duration_denies_without_blocking() {
        let (limiter, store) = limiter_with(RateLimitConfig::new(1, 0));
        let ctx = Context::background();

        assert!(limiter.check_request(&ctx, "ip", "").await.unwrap().allowed);

        let decision = limiter.check_request(&ctx, "ip", "").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "Rate limit exceeded: 1 requests per second");
        assert!(!limiter.is_blocked(&ctx, "ip", "").await.unwrap());
        assert_eq!(store.block_count(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_a_decision() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), RateLimitConfig::default()).unwrap();
        let ctx = Context::background();

        let err = assert_err!(limiter.check_request(&ctx, "ip", "token").await);
        assert!(matches!(err, TurnstileError::StoreUnavailable(_)));

        assert_err!(limiter.remaining_requests(&ctx, "ip", "").await);
        assert_err!(limiter.is_blocked(&ctx, "ip", "").await);
        assert_err!(limiter.unblock(&ctx, "ip").await);
    }

    #[tokio::test]
    async fn test_cancelled_context_is_an_error() {
        let (limiter, store) = limiter_with(RateLimitConfig::new(5, 1));
        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();

        let err = assert_err!(limiter.check_request(&ctx, "ip", "").await);
        assert!(matches!(err, TurnstileError::ContextCancelled(_)));
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_checks_may_overshoot_by_one_per_racer() {
        let store = Arc::new(LockstepStore {
            inner: MemoryStore::new(),
            barrier: Barrier::new(2),
        });
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::new(3, 1)).unwrap();
        let ctx = Context::background();

        // One below the threshold.
        for _ in 0..2 {
            store.inner.increment_request_count(&ctx, "ip", WINDOW).await.unwrap();
        }

        let (first, second) = tokio::join!(
            limiter.check_request(&ctx, "ip", ""),
            limiter.check_request(&ctx, "ip", ""),
        );

        // Both saw a count of 2 and both were admitted.
        assert!(first.unwrap().allowed);
        assert!(second.unwrap().allowed);
        assert_eq!(store.inner.get_request_count(&ctx, "ip").await.unwrap(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overshoot_is_bounded() {
        const LIMIT: u64 = 10;
        const CONCURRENCY: u64 = 32;

        let (limiter, store) = limiter_with(RateLimitConfig::new(LIMIT, 1));
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..CONCURRENCY)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check_request(&Context::background(), "10.1.1.1", "")
                        .await
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let allowed = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count() as u64;

        assert!(allowed >= LIMIT);
        assert!(allowed <= LIMIT + CONCURRENCY - 1);

        // Every admitted request was counted.
        let ctx = Context::background();
        let counted = store.get_request_count(&ctx, "10.1.1.1").await.unwrap();
        assert_eq!(counted, allowed);
    }
}

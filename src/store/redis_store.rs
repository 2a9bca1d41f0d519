//! Shared store backed by Redis.
//!
//! Several limiter processes pointed at the same Redis database see the same
//! counters and blocks. Redis key expiry is the source of truth for both
//! windows and blocks; nothing here compares timestamps locally.
//!
//! Counting runs as a Lua script, so any Redis with `EVALSHA` (2.6+) works.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError, Script,
};
use tracing::{debug, info, trace};

use super::RateLimitStore;
use crate::context::Context;
use crate::error::{Result, TurnstileError};

/// Connection parameters for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index.
    pub db: i64,
    /// Prepended to a key to form its block key, keeping blocks and
    /// counters in separate namespaces.
    pub block_prefix: String,
    /// Upper bound on connecting and the initial PING.
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            block_prefix: "block:".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn unavailable(err: RedisError) -> TurnstileError {
    TurnstileError::StoreUnavailable(err.to_string())
}

/// Increment a counter, giving it a TTL if it has none.
///
/// A live window keeps its TTL, so later increments never extend it. A
/// counter that expired before the INCR comes back at 1 with a fresh TTL.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Clamp a duration to whole milliseconds, at least 1.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// A [`RateLimitStore`] shared through Redis.
pub struct RedisStore {
    /// `None` once closed.
    conn: RwLock<Option<ConnectionManager>>,
    increment: Script,
    block_prefix: String,
    address: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("address", &self.address)
            .field("block_prefix", &self.block_prefix)
            .field("open", &self.conn.read().is_some())
            .finish()
    }
}

impl RedisStore {
    /// Connect and verify the server answers a PING.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        let address = config.address();
        info!(address = %address, db = config.db, "Connecting to Redis");

        let client = Client::open(config.connection_info()).map_err(unavailable)?;
        let connect = async {
            let mut conn = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, RedisError>(conn)
        };

        let conn = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                TurnstileError::StoreUnavailable(format!(
                    "timed out connecting to Redis at {}",
                    address
                ))
            })?
            .map_err(unavailable)?;

        info!(address = %address, "Connected to Redis");

        Ok(Self {
            conn: RwLock::new(Some(conn)),
            increment: Script::new(INCREMENT_SCRIPT),
            block_prefix: config.block_prefix.clone(),
            address,
        })
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .clone()
            .ok_or_else(|| TurnstileError::StoreUnavailable("store is closed".to_string()))
    }

    fn block_key(&self, key: &str) -> String {
        format!("{}{}", self.block_prefix, key)
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn get_request_count(&self, ctx: &Context, key: &str) -> Result<u64> {
        let mut conn = self.connection()?;

        ctx.run(async move {
            let count: Option<u64> = conn.get(key).await.map_err(unavailable)?;
            Ok(count.unwrap_or(0))
        })
        .await
    }

    async fn increment_request_count(
        &self,
        ctx: &Context,
        key: &str,
        window: Duration,
    ) -> Result<()> {
        let mut conn = self.connection()?;
        let window_ms = millis(window);

        let increment = &self.increment;

        let count = ctx
            .run(async move {
                let count: u64 = increment
                    .key(key)
                    .arg(window_ms)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                Ok(count)
            })
            .await?;

        trace!(key = %key, count, window_ms, "Incremented request count");
        Ok(())
    }

    async fn is_blocked(&self, ctx: &Context, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let block_key = self.block_key(key);

        ctx.run(async move {
            let exists: bool = conn.exists(&block_key).await.map_err(unavailable)?;
            Ok(exists)
        })
        .await
    }

    async fn block(&self, ctx: &Context, key: &str, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return self.unblock(ctx, key).await;
        }

        let mut conn = self.connection()?;
        let block_key = self.block_key(key);
        let duration_ms = millis(duration);

        ctx.run(async move {
            let _: () = redis::cmd("SET")
                .arg(&block_key)
                .arg(1)
                .arg("PX")
                .arg(duration_ms)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(())
        })
        .await?;

        debug!(key = %key, duration_ms, "Blocked key");
        Ok(())
    }

    async fn unblock(&self, ctx: &Context, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let block_key = self.block_key(key);

        ctx.run(async move {
            let _: () = conn.del(&block_key).await.map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.conn.write().take().is_some() {
            info!(address = %self.address, "Closed Redis connection");
        }
        Ok(())
    }
}

//! In-process store backed by hash maps.
//!
//! State lives only as long as the store; nothing survives a restart and
//! nothing is shared with other processes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace};

use super::RateLimitStore;
use crate::context::Context;
use crate::error::Result;

/// How often the background sweep reclaims expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

impl CounterEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Counters and blocks share one lock so a sweep sees a consistent view.
#[derive(Debug, Default)]
struct Tables {
    counters: HashMap<String, CounterEntry>,
    /// Key -> blocked until.
    blocks: HashMap<String, Instant>,
}

impl Tables {
    /// Drop every entry whose expiry has passed. Returns (counters, blocks) removed.
    fn purge_expired(&mut self, now: Instant) -> (usize, usize) {
        let counters_before = self.counters.len();
        self.counters.retain(|_, entry| entry.is_live(now));

        let blocks_before = self.blocks.len();
        self.blocks.retain(|_, until| now < *until);

        (
            counters_before - self.counters.len(),
            blocks_before - self.blocks.len(),
        )
    }
}

/// A [`RateLimitStore`] kept in process memory.
///
/// Expiry is checked on every read and write, so results never depend on
/// when the sweep last ran; the sweep only bounds memory held by keys that
/// are never seen again.
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryStore")
            .field("counters", &tables.counters.len())
            .field("blocks", &tables.blocks.len())
            .field("sweeping", &self.sweeper.lock().is_some())
            .finish()
    }
}

impl MemoryStore {
    /// Create a store that sweeps every [`SWEEP_INTERVAL`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }

    /// Create a store with a custom sweep interval.
    ///
    /// The first sweep runs one `interval` after this call. Intervals
    /// shorter than a millisecond are raised to one millisecond.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let period = interval.max(MIN_SWEEP_INTERVAL);
        let tables = Arc::new(RwLock::new(Tables::default()));

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&tables), ticker));

        debug!(interval_ms = period.as_millis() as u64, "Started in-memory store sweep");

        Self {
            tables,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Reclaim expired entries now. Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let (counters, blocks) = self.tables.write().purge_expired(Instant::now());
        counters + blocks
    }

    /// Number of counter entries held, expired or not.
    pub fn counter_count(&self) -> usize {
        self.tables.read().counters.len()
    }

    /// Number of block entries held, expired or not.
    pub fn block_count(&self) -> usize {
        self.tables.read().blocks.len()
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

async fn sweep_loop(tables: Weak<RwLock<Tables>>, mut ticker: Interval) {
    loop {
        ticker.tick().await;

        let Some(tables) = tables.upgrade() else {
            break;
        };
        let (counters, blocks) = tables.write().purge_expired(Instant::now());

        if counters + blocks > 0 {
            debug!(counters, blocks, "Reclaimed expired rate limit entries");
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get_request_count(&self, ctx: &Context, key: &str) -> Result<u64> {
        ctx.check()?;

        let now = Instant::now();
        let tables = self.tables.read();
        let count = tables
            .counters
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map_or(0, |entry| entry.count);

        Ok(count)
    }

    async fn increment_request_count(
        &self,
        ctx: &Context,
        key: &str,
        window: Duration,
    ) -> Result<()> {
        ctx.check()?;

        let now = Instant::now();
        let mut tables = self.tables.write();

        let fresh = CounterEntry {
            count: 0,
            expires_at: now + window,
        };
        let entry = tables.counters.entry(key.to_string()).or_insert(fresh);
        if !entry.is_live(now) {
            *entry = fresh;
        }
        entry.count += 1;

        trace!(key = %key, count = entry.count, "Incremented request count");
        Ok(())
    }

    async fn is_blocked(&self, ctx: &Context, key: &str) -> Result<bool> {
        ctx.check()?;

        let now = Instant::now();
        let tables = self.tables.read();
        Ok(tables.blocks.get(key).map_or(false, |until| now < *until))
    }

    async fn block(&self, ctx: &Context, key: &str, duration: Duration) -> Result<()> {
        ctx.check()?;

        let mut tables = self.tables.write();
        if duration.is_zero() {
            tables.blocks.remove(key);
        } else {
            tables.blocks.insert(key.to_string(), Instant::now() + duration);
        }
        Ok(())
    }

    async fn unblock(&self, ctx: &Context, key: &str) -> Result<()> {
        ctx.check()?;

        self.tables.write().blocks.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop_sweeper();
        debug!("Closed in-memory store");
        Ok(())
    }
}

//! Memory cache in front of a durable store.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{MemoryStore, Store, StoreResult};
use crate::ratelimit::Window;

/// Write-through cache over a durable store.
///
/// The durable tier is the source of truth for every count returned by
/// `increment`; the memory tier only speeds up `get`.
///
/// A counter that is legitimately zero looks the same as a cache miss, so
/// `get` for an idle resource always reads through to the durable tier.
///
/// Every `reset` bumps a generation. A mirror or backfill that began before
/// the bump is dropped, so a count read ahead of a reset never lands in the
/// memory tier after it.
pub struct TieredStore {
    memory: MemoryStore,
    durable: Arc<dyn Store>,
    generation: Mutex<u64>,
}

impl TieredStore {
    /// Wrap `durable` with a fresh memory tier.
    pub fn new(durable: Arc<dyn Store>) -> Self {
        Self {
            memory: MemoryStore::new(),
            durable,
            generation: Mutex::new(0),
        }
    }

    /// The durable tier this store writes through to.
    pub fn durable(&self) -> &Arc<dyn Store> {
        &self.durable
    }

    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Copy `count` into the memory tier unless a reset ran since `seen`.
    fn mirror(&self, seen: u64, key: &str, bucket_key: &str, count: u64) {
        let generation = self.generation.lock();
        if *generation == seen {
            self.memory.observe(key, bucket_key, count);
        } else {
            trace!(key, count, "Dropping mirror from before a reset");
        }
    }
}

#[async_trait]
impl Store for TieredStore {
    async fn increment(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64> {
        let seen = self.generation();
        let count = self.durable.increment(cancel, key, window).await?;

        // Mirror as the durable count so the tiers agree once writers settle.
        self.mirror(seen, key, &window.bucket_key, count);

        Ok(count)
    }

    async fn get(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64> {
        let cached = self.memory.get(cancel, key, window).await?;
        if cached > 0 {
            trace!(key, count = cached, "Tiered cache hit");
            return Ok(cached);
        }

        let seen = self.generation();
        let count = self.durable.get(cancel, key, window).await?;
        if count > 0 {
            debug!(key, count, bucket = %window.bucket_key, "Backfilling memory tier");
            self.mirror(seen, key, &window.bucket_key, count);
        }

        Ok(count)
    }

    async fn reset(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()> {
        self.durable.reset(cancel, key).await?;

        let mut generation = self.generation.lock();
        *generation += 1;
        self.memory.remove(key);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.durable.close().await
    }

    fn store_type(&self) -> &'static str {
        "tiered"
    }
}

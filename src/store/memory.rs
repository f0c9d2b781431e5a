//! In-memory counter store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{ensure_live, Store, StoreResult};
use crate::ratelimit::Window;

#[derive(Debug, Clone)]
struct Bucket {
    count: u64,
    bucket_key: String,
}

/// Process-local counters. Lost on restart.
///
/// One mutex covers the read-check-write of every operation, which is what
/// makes `increment` linearizable per key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment_now(&self, key: &str, window: &Window) -> u64 {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                count: 0,
                bucket_key: window.bucket_key.clone(),
            });

        if bucket.bucket_key != window.bucket_key {
            trace!(key, from = %bucket.bucket_key, to = %window.bucket_key, "Bucket rolled over");
            bucket.bucket_key.clone_from(&window.bucket_key);
            bucket.count = 0;
        }

        bucket.count += 1;
        bucket.count
    }

    pub(crate) fn get_now(&self, key: &str, window: &Window) -> u64 {
        let buckets = self.buckets.lock();
        match buckets.get(key) {
            Some(bucket) if bucket.bucket_key == window.bucket_key => bucket.count,
            _ => 0,
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        self.buckets.lock().remove(key);
    }

    /// Raise the cached counter to `count` unless it already holds a higher
    /// value for the same bucket. A different bucket is replaced outright.
    pub(crate) fn observe(&self, key: &str, bucket_key: &str, count: u64) {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(key) {
            Some(bucket) if bucket.bucket_key == bucket_key => {
                bucket.count = bucket.count.max(count);
            }
            _ => {
                buckets.insert(
                    key.to_string(),
                    Bucket {
                        count,
                        bucket_key: bucket_key.to_string(),
                    },
                );
            }
        }
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64> {
        ensure_live(cancel)?;
        Ok(self.increment_now(key, window))
    }

    async fn get(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64> {
        ensure_live(cancel)?;
        Ok(self.get_now(key, window))
    }

    async fn reset(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()> {
        ensure_live(cancel)?;
        self.remove(key);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

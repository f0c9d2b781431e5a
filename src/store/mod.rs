//! Counter storage backends.
//!
//! - **Memory**: process-local counters behind a single mutex
//! - **SQLite**: durable counters that survive restarts
//! - **Tiered**: memory in front of any other store, write-through
//! - **Redis**: shared counters for multi-instance deployments (feature `redis`)
//!
//! Every backend resets a counter lazily: a stored count is only valid while
//! its bucket key equals the caller's, so there is no background sweep.

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod sqlite;
mod tiered;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use sqlite::SqliteStore;
pub use tiered::TieredStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::Window;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation's cancellation token fired before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// The store was used after `close`
    #[error("store is closed")]
    Closed,

    /// SQLite failures
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Redis failures
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Filesystem failures while preparing a store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking worker panicked or was aborted
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Persisted data could not be interpreted
    #[error("corrupt counter data: {0}")]
    Corrupt(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for counter storage backends.
///
/// The limiter only ever talks to this trait, so any backend (or a test
/// double) can sit behind it. Implementations must make `increment` atomic
/// per key: concurrent callers never observe the same pre-increment value.
#[async_trait]
pub trait Store: Send + Sync {
    /// Add one to the counter for `key` in `window`'s bucket and return the
    /// new count. A missing counter, or one from another bucket, starts at
    /// zero, so the first increment of a bucket returns 1.
    async fn increment(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64>;

    /// Current count for `key` in `window`'s bucket, or 0.
    async fn get(&self, cancel: &CancellationToken, key: &str, window: &Window)
        -> StoreResult<u64>;

    /// Delete the counter for `key` regardless of bucket.
    async fn reset(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()>;

    /// Release backend resources.
    async fn close(&self) -> StoreResult<()>;

    /// Backend name for logging.
    fn store_type(&self) -> &'static str;
}

/// Fail fast when the caller has already given up.
pub(crate) fn ensure_live(cancel: &CancellationToken) -> StoreResult<()> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use crate::ratelimit::Window;

    pub fn minute(bucket_key: &str, minute: u32) -> Window {
        Window {
            duration: Duration::from_secs(60),
            bucket_key: bucket_key.to_string(),
            bucket_start: Utc.with_ymd_and_hms(2024, 1, 15, 14, minute, 0).unwrap(),
        }
    }

    pub fn w1() -> Window {
        minute("2024-01-15T14:30", 30)
    }

    pub fn w2() -> Window {
        minute("2024-01-15T14:31", 31)
    }
}

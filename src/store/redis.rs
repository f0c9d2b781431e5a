//! Redis-backed counter store for instances sharing one budget.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ensure_live, Store, StoreError, StoreResult};
use crate::ratelimit::Window;

/// Default namespace for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "erl:";

// KEYS[1] = counter key
// ARGV[1] = bucket key
// ARGV[2] = window duration in seconds
const INCREMENT_SCRIPT: &str = r#"
local current_bucket = redis.call("HGET", KEYS[1], "bucket_key")
if current_bucket ~= ARGV[1] then
    redis.call("HSET", KEYS[1], "count", "1", "bucket_key", ARGV[1])
    local ttl = tonumber(ARGV[2])
    if ttl > 0 then
        redis.call("EXPIRE", KEYS[1], ttl)
    end
    return 1
end
return redis.call("HINCRBY", KEYS[1], "count", 1)
"#;

/// Counters stored as Redis hashes (`count`, `bucket_key`) under
/// `prefix + name`.
///
/// A Lua script does compare-bucket, reset-or-increment and expiry in one
/// atomic step, and the expiry equals the window duration so stale hashes
/// clean themselves up.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    increment: Script,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connect to `url` using the default key prefix.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with_prefix(url, DEFAULT_KEY_PREFIX).await
    }

    /// Connect to `url`, namespacing every key with `prefix`.
    pub async fn connect_with_prefix(url: &str, prefix: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(prefix, "Connected Redis counter store");
        Ok(Self::with_connection(conn, prefix))
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            increment: Script::new(INCREMENT_SCRIPT),
            closed: AtomicBool::new(false),
        }
    }

    fn key(&self, name: &str) -> String {
        namespaced(&self.prefix, name)
    }

    async fn run<T, F>(&self, cancel: &CancellationToken, op: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        ensure_live(cancel)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        tokio::select! {
            res = op => Ok(res?),
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
        }
    }
}

fn namespaced(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let mut invocation = self.increment.key(self.key(key));
        invocation
            .arg(&window.bucket_key)
            .arg(window.duration_secs());

        self.run(cancel, async move { invocation.invoke_async(&mut conn).await })
            .await
    }

    async fn get(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let redis_key = self.key(key);

        let fields: HashMap<String, String> = self
            .run(cancel, async move { conn.hgetall(redis_key).await })
            .await?;

        match (fields.get("bucket_key"), fields.get("count")) {
            (Some(bucket), Some(count)) if *bucket == window.bucket_key => count
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("count {count:?} for {key}"))),
            _ => Ok(0),
        }
    }

    async fn reset(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let redis_key = self.key(key);
        self.run(cancel, async move { conn.del(redis_key).await })
            .await
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}

//! SQLite-backed durable counter store.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ensure_live, Store, StoreError, StoreResult};
use crate::ratelimit::Window;

/// Default time a writer waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between attempts while another connection holds the write lock.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS erl_counters (
    key            TEXT PRIMARY KEY,
    count          INTEGER NOT NULL DEFAULT 0,
    bucket_key     TEXT NOT NULL DEFAULT '',
    window_seconds INTEGER NOT NULL DEFAULT 0
)";

/// Durable counters in a single `erl_counters` table, one row per key.
///
/// Queries run on tokio's blocking pool. Each `increment` is one
/// `BEGIN IMMEDIATE` transaction, so separate processes sharing the file
/// cannot interleave a read-modify-write either.
///
/// A call that returns [`StoreError::Cancelled`] never commits. The blocking
/// worker checks in after taking the connection, between busy retries, and
/// right before `COMMIT`.
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a database file with a custom busy timeout.
    pub fn open_with_timeout<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        info!(path = %path.display(), "Opened SQLite counter store");
        Self::init(conn, busy_timeout)
    }

    /// Open a private in-memory database, mostly for tests.
    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, DEFAULT_BUSY_TIMEOUT)
    }

    fn init(conn: Connection, busy_timeout: Duration) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        // Lock waits are retried by `Attempt::retry_busy` so they stay cancellable.
        conn.busy_timeout(Duration::ZERO)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            busy_timeout,
        })
    }

    /// Run `op` against the connection on the blocking pool.
    ///
    /// If `cancel` fires before `op` claims its commit, the caller gets
    /// `Cancelled` at once and `op` rolls back whenever it next checks in.
    /// If the commit was already claimed, the caller waits for its outcome.
    async fn run<T, F>(&self, cancel: &CancellationToken, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Attempt) -> StoreResult<T> + Send + 'static,
    {
        ensure_live(cancel)?;

        let attempt = Arc::new(Attempt::new(self.busy_timeout));
        let conn = self.conn.clone();
        let worker = attempt.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            worker.live()?;
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            op(conn, &worker)
        });

        tokio::select! {
            res = &mut task => res?,
            _ = cancel.cancelled() => {
                if attempt.abandon() {
                    debug!("Abandoned SQLite operation before commit");
                    Err(StoreError::Cancelled)
                } else {
                    task.await?
                }
            }
        }
    }
}

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

/// Handshake between a waiting caller and its blocking worker. Exactly one
/// side wins: the worker claims the commit or the caller abandons it.
struct Attempt {
    state: AtomicU8,
    busy_timeout: Duration,
}

impl Attempt {
    fn new(busy_timeout: Duration) -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            busy_timeout,
        }
    }

    fn live(&self) -> StoreResult<()> {
        match self.state.load(Ordering::Acquire) {
            ABANDONED => Err(StoreError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Claim the right to commit. Fails once the caller has given up.
    fn claim(&self) -> StoreResult<()> {
        self.state
            .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| StoreError::Cancelled)
    }

    /// Give up on the worker. False if it already claimed its commit.
    fn abandon(&self) -> bool {
        self.state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Retry `f` while the database is locked by another connection, until
    /// the busy timeout passes or the caller abandons the attempt.
    fn retry_busy<T>(&self, mut f: impl FnMut() -> rusqlite::Result<T>) -> StoreResult<T> {
        let deadline = Instant::now() + self.busy_timeout;
        loop {
            match f() {
                Err(e) if is_busy(&e) && Instant::now() < deadline => {
                    self.live()?;
                    thread::sleep(BUSY_RETRY_INTERVAL);
                }
                res => return Ok(res?),
            }
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn begin_immediate<'c>(conn: &'c Connection, attempt: &Attempt) -> StoreResult<Transaction<'c>> {
    attempt.retry_busy(|| Transaction::new_unchecked(conn, TransactionBehavior::Immediate))
}

fn to_count(raw: i64) -> StoreResult<u64> {
    u64::try_from(raw).map_err(|_| StoreError::Corrupt(format!("negative count {raw}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn increment(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64> {
        let key = key.to_string();
        let bucket_key = window.bucket_key.clone();
        let window_seconds = window.duration_secs();

        self.run(cancel, move |conn, attempt| {
            let tx = begin_immediate(conn, attempt)?;

            let row: Option<(i64, String)> = tx
                .query_row(
                    "SELECT count, bucket_key FROM erl_counters WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let count = match row {
                Some((count, stored)) if stored == bucket_key => to_count(count)? + 1,
                Some((_, stored)) => {
                    debug!(key = %key, from = %stored, to = %bucket_key, "Bucket rolled over");
                    1
                }
                None => 1,
            };

            tx.execute(
                "INSERT INTO erl_counters (key, count, bucket_key, window_seconds)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    count = excluded.count,
                    bucket_key = excluded.bucket_key,
                    window_seconds = excluded.window_seconds",
                params![key, count as i64, bucket_key, window_seconds],
            )?;

            // Dropping `tx` on a failed claim rolls the increment back.
            attempt.claim()?;
            tx.commit()?;

            Ok(count)
        })
        .await
    }

    async fn get(
        &self,
        cancel: &CancellationToken,
        key: &str,
        window: &Window,
    ) -> StoreResult<u64> {
        let key = key.to_string();
        let bucket_key = window.bucket_key.clone();

        self.run(cancel, move |conn, attempt| {
            let row: Option<(i64, String)> = attempt.retry_busy(|| {
                conn.query_row(
                    "SELECT count, bucket_key FROM erl_counters WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            })?;

            match row {
                Some((count, stored)) if stored == bucket_key => to_count(count),
                _ => Ok(0),
            }
        })
        .await
    }

    async fn reset(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.run(cancel, move |conn, attempt| {
            let tx = begin_immediate(conn, attempt)?;
            tx.execute("DELETE FROM erl_counters WHERE key = ?1", params![key])?;
            attempt.claim()?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> StoreResult<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            info!("Closed SQLite counter store");
        }
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "sqlite"
    }
}

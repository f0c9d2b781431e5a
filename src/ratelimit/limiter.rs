//! Admission checks against registered resources.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::matcher;
use super::resource::{Resource, Strategy};
use crate::error::{LimiterError, Result};
use crate::store::{MemoryStore, Store};

/// Callback fired whenever a resource goes over its limit.
///
/// Runs synchronously on the task calling [`Limiter::check`], so a slow
/// callback stalls that caller.
pub type LimitCallback = Arc<dyn Fn(&Resource, u64) + Send + Sync>;

/// Time source used to resolve buckets.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A request was rejected because its resource is over budget.
#[derive(Clone, Error)]
#[error("rate limit exceeded for {} ({current}/{})", .resource.name, .resource.limit)]
pub struct LimitExceeded {
    /// The resource that hit its limit
    pub resource: Resource,
    /// Count recorded for this request
    pub current: u64,
    reset_at: DateTime<Utc>,
    clock: Clock,
}

impl fmt::Debug for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitExceeded")
            .field("resource", &self.resource)
            .field("current", &self.current)
            .field("reset_at", &self.reset_at)
            .finish_non_exhaustive()
    }
}

impl LimitExceeded {
    /// When the bucket that rejected the request resets.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// A waiter for the bucket reset, available for `BlockWithQueue`
    /// resources only. It reads time from the limiter's clock.
    pub fn waiter(&self) -> Option<ResetWaiter> {
        match self.resource.strategy {
            Strategy::BlockWithQueue => Some(ResetWaiter {
                reset_at: self.reset_at,
                clock: self.clock.clone(),
            }),
            Strategy::Block | Strategy::LogOnly => None,
        }
    }
}

/// Suspends a caller until a bucket resets.
#[derive(Clone)]
pub struct ResetWaiter {
    reset_at: DateTime<Utc>,
    clock: Clock,
}

impl fmt::Debug for ResetWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetWaiter")
            .field("reset_at", &self.reset_at)
            .finish_non_exhaustive()
    }
}

impl ResetWaiter {
    /// When the wait ends.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Sleep until the reset instant or until `cancel` fires.
    ///
    /// The remaining time is measured against the clock of the limiter that
    /// rejected the request. Returns immediately if the reset instant has
    /// already passed, and [`LimiterError::Cancelled`] if the token fires
    /// first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let Ok(delay) = (self.reset_at - (self.clock)()).to_std() else {
            return Ok(());
        };
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(LimiterError::Cancelled),
        }
    }
}

/// Point-in-time usage of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    /// The registered resource
    pub resource: Resource,
    /// Count in the active bucket
    pub current: u64,
}

/// Tracks outgoing requests against registered resources and enforces
/// their budgets.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct Limiter {
    /// Registered resources, first match wins
    resources: RwLock<Vec<Resource>>,
    /// Counter backend
    store: Arc<dyn Store>,
    on_limit_reached: Option<LimitCallback>,
    clock: Clock,
}

impl Limiter {
    /// Create a limiter backed by a fresh in-memory store.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Create a limiter backed by the given store.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self {
            resources: RwLock::new(Vec::new()),
            store,
            on_limit_reached: None,
            clock: Arc::new(Utc::now),
        }
    }

    /// Install the over-limit callback.
    pub fn on_limit_reached<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Resource, u64) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(callback));
        self
    }

    /// Replace the time source used to resolve buckets.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// The counter backend.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Add a resource to the end of the match list.
    ///
    /// Duplicate names are accepted; the earlier registration matches first.
    pub fn register(&self, resource: Resource) {
        debug!(
            resource = %resource.name,
            pattern = %resource.pattern,
            limit = resource.limit,
            window = %resource.window,
            strategy = %resource.strategy,
            "Registering resource"
        );
        self.resources.write().push(resource);
    }

    /// Check whether a request to `request_url` may be sent.
    ///
    /// Charges the first matching resource once. Requests that match no
    /// resource, including unparseable URLs, are always allowed.
    pub async fn check(&self, cancel: &CancellationToken, request_url: &str) -> Result<()> {
        let Some(target) = matcher::request_target(request_url) else {
            trace!(url = request_url, "Unparseable request URL, allowing");
            return Ok(());
        };

        let matched = {
            let resources = self.resources.read();
            resources
                .iter()
                .find(|r| matcher::target_matches(&target, &r.pattern))
                .cloned()
        };
        let Some(resource) = matched else {
            trace!(request = %target, "No resource matched, allowing");
            return Ok(());
        };

        let window = resource.window.resolve((self.clock)());
        let current = self
            .store
            .increment(cancel, &resource.name, &window)
            .await
            .map_err(|e| LimiterError::store("increment", &resource.name, e))?;

        trace!(
            resource = %resource.name,
            bucket = %window.bucket_key,
            count = current,
            limit = resource.limit,
            "Checked rate limit"
        );

        if current <= resource.limit {
            return Ok(());
        }

        if let Some(callback) = &self.on_limit_reached {
            callback(&resource, current);
        }

        match resource.strategy {
            Strategy::LogOnly => {
                warn!(
                    resource = %resource.name,
                    count = current,
                    limit = resource.limit,
                    "Rate limit exceeded, allowing (log only)"
                );
                Ok(())
            }
            Strategy::Block | Strategy::BlockWithQueue => {
                warn!(
                    resource = %resource.name,
                    count = current,
                    limit = resource.limit,
                    reset_at = %window.reset_at(),
                    "Rate limit exceeded"
                );
                Err(LimitExceeded {
                    resource,
                    current,
                    reset_at: window.reset_at(),
                    clock: self.clock.clone(),
                }
                .into())
            }
        }
    }

    /// Current count for the first resource registered under `name`.
    pub async fn get_usage(&self, cancel: &CancellationToken, name: &str) -> Result<u64> {
        let resource = self
            .resources
            .read()
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| LimiterError::NotFound(name.to_string()))?;

        let window = resource.window.resolve((self.clock)());
        self.store
            .get(cancel, &resource.name, &window)
            .await
            .map_err(|e| LimiterError::store("get", name, e))
    }

    /// Clear the counter stored under `name`, registered or not.
    pub async fn reset_usage(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        self.store
            .reset(cancel, name)
            .await
            .map_err(|e| LimiterError::store("reset", name, e))?;
        info!(resource = %name, "Reset usage");
        Ok(())
    }

    /// A copy of the registered resources in match order.
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.read().clone()
    }

    /// Current count of every registered resource in its active bucket.
    pub async fn snapshot(&self, cancel: &CancellationToken) -> Result<Vec<ResourceStatus>> {
        let resources = self.resources();
        let now = (self.clock)();

        let mut out = Vec::with_capacity(resources.len());
        for resource in resources {
            let window = resource.window.resolve(now);
            let current = self
                .store
                .get(cancel, &resource.name, &window)
                .await
                .map_err(|e| LimiterError::store("snapshot", &resource.name, e))?;
            out.push(ResourceStatus { resource, current });
        }

        Ok(out)
    }

    /// Release the store's resources. Call once, at shutdown.
    pub async fn close(&self) -> Result<()> {
        info!(store = self.store.store_type(), "Closing limiter store");
        self.store
            .close()
            .await
            .map_err(|e| LimiterError::store("close", "*", e))
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use chrono::{TimeDelta, TimeZone};
    use parking_lot::Mutex;

    use super::*;
    use crate::ratelimit::TimeWindow;
    use crate::store::{SqliteStore, StoreError, TieredStore};

    fn resource(name: &str, pattern: &str, limit: u64, strategy: Strategy) -> Resource {
        Resource::new(name, pattern, limit, TimeWindow::Minute).with_strategy(strategy)
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 5).unwrap()
    }

    /// A limiter whose buckets never roll over mid-test.
    fn limiter() -> Limiter {
        Limiter::new().with_clock(fixed_now)
    }

    fn waiter_at(reset_at: DateTime<Utc>) -> ResetWaiter {
        ResetWaiter {
            reset_at,
            clock: Arc::new(Utc::now),
        }
    }

    /// A clock the test can move forward.
    fn manual_clock(
        start: DateTime<Utc>,
    ) -> (Arc<Mutex<DateTime<Utc>>>, impl Fn() -> DateTime<Utc>) {
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        (handle, move || *now.lock())
    }

    #[tokio::test]
    async fn test_block_strategy() {
        let limiter = limiter();
        limiter.register(resource("test-api", "api.test.com/*", 3, Strategy::Block));
        let cancel = CancellationToken::new();
        let url = "https://api.test.com/v1/foo";

        for i in 1..=3 {
            assert!(limiter.check(&cancel, url).await.is_ok(), "request {i}");
        }

        let err = limiter.check(&cancel, url).await.unwrap_err();
        assert!(err.is_limit_exceeded());
        let exceeded = err.as_limit_exceeded().unwrap();
        assert_eq!(exceeded.resource.name, "test-api");
        assert_eq!(exceeded.current, 4);
        assert_eq!(
            exceeded.reset_at(),
            Utc.with_ymd_and_hms(2024, 1, 15, 14, 31, 0).unwrap()
        );
        assert!(exceeded.waiter().is_none());
        assert_eq!(err.to_string(), "rate limit exceeded for test-api (4/3)");
    }

    #[tokio::test]
    async fn test_block_with_queue_exposes_waiter() {
        let limiter = limiter();
        limiter.register(resource("queued", "api.queued.com/*", 1, Strategy::BlockWithQueue));
        let cancel = CancellationToken::new();

        limiter.check(&cancel, "https://api.queued.com/a").await.unwrap();
        let err = limiter
            .check(&cancel, "https://api.queued.com/a")
            .await
            .unwrap_err();

        let exceeded = err.as_limit_exceeded().unwrap();
        let waiter = exceeded.waiter().expect("queued resources can wait");
        assert_eq!(waiter.reset_at(), exceeded.reset_at());
    }

    #[tokio::test]
    async fn test_waiter_follows_limiter_clock() {
        // Far enough ahead that the wall clock never reaches the reset.
        let start = Utc.with_ymd_and_hms(2099, 1, 15, 14, 30, 5).unwrap();
        let (now, clock) = manual_clock(start);
        let limiter = Limiter::new().with_clock(clock);
        limiter.register(resource("queued", "api.queued.com/*", 1, Strategy::BlockWithQueue));
        let cancel = CancellationToken::new();

        limiter.check(&cancel, "https://api.queued.com/a").await.unwrap();
        let err = limiter
            .check(&cancel, "https://api.queued.com/a")
            .await
            .unwrap_err();
        let waiter = err.as_limit_exceeded().unwrap().waiter().unwrap();
        assert_eq!(
            waiter.reset_at(),
            Utc.with_ymd_and_hms(2099, 1, 15, 14, 31, 0).unwrap()
        );

        *now.lock() = waiter.reset_at();
        tokio::time::timeout(Duration::from_millis(100), waiter.wait(&cancel))
            .await
            .expect("the limiter's clock says the bucket has reset")
            .unwrap();
        limiter.check(&cancel, "https://api.queued.com/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_log_only_strategy() {
        let fired = Arc::new(AtomicU64::new(0));
        let seen = fired.clone();
        let limiter = limiter().on_limit_reached(move |r, current| {
            assert_eq!(r.name, "log-api");
            seen.store(current, Ordering::SeqCst);
        });
        limiter.register(resource("log-api", "api.logged.com/*", 1, Strategy::LogOnly));
        let cancel = CancellationToken::new();
        let url = "https://api.logged.com/endpoint";

        limiter.check(&cancel, url).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        limiter.check(&cancel, url).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        limiter.check(&cancel, url).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_callback_fires_for_blocking_strategies() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let limiter = limiter().on_limit_reached(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        limiter.register(resource("blocked", "api.blocked.com/*", 1, Strategy::Block));
        let cancel = CancellationToken::new();

        limiter.check(&cancel, "https://api.blocked.com").await.unwrap();
        assert!(limiter.check(&cancel, "https://api.blocked.com").await.is_err());
        assert!(limiter.check(&cancel, "https://api.blocked.com").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unmatched_url_passes_through() {
        let limiter = limiter();
        limiter.register(resource("only-stripe", "api.stripe.com/*", 1, Strategy::Block));
        let cancel = CancellationToken::new();

        for i in 0..10 {
            assert!(
                limiter.check(&cancel, "https://api.github.com/repos").await.is_ok(),
                "unmatched request {i}"
            );
        }
        assert_eq!(limiter.get_usage(&cancel, "only-stripe").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_url_passes_through() {
        let limiter = limiter();
        limiter.register(resource("everything", "*", 1, Strategy::Block));
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            assert!(limiter.check(&cancel, "http://[::1/broken").await.is_ok());
        }
        assert_eq!(limiter.get_usage(&cancel, "everything").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_first_match_wins_and_only_it_is_charged() {
        let limiter = limiter();
        limiter.register(resource("chat", "api.openai.com/v1/chat/*", 10, Strategy::Block));
        limiter.register(resource("openai", "api.openai.com/*", 10, Strategy::Block));
        let cancel = CancellationToken::new();

        limiter
            .check(&cancel, "https://api.openai.com/v1/chat/completions")
            .await
            .unwrap();
        limiter
            .check(&cancel, "https://api.openai.com/v1/embeddings")
            .await
            .unwrap();

        assert_eq!(limiter.get_usage(&cancel, "chat").await.unwrap(), 1);
        assert_eq!(limiter.get_usage(&cancel, "openai").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_names_match_in_registration_order() {
        let limiter = limiter();
        limiter.register(resource("dup", "api.one.com/*", 5, Strategy::Block));
        limiter.register(resource("dup", "api.two.com/*", 50, Strategy::Block));

        assert_eq!(limiter.resources().len(), 2);
        let status = limiter.snapshot(&CancellationToken::new()).await.unwrap();
        assert_eq!(status[0].resource.limit, 5);
        assert_eq!(status[1].resource.limit, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks() {
        let limiter = Arc::new(limiter());
        limiter.register(resource("concurrent-api", "api.concurrent.com/*", 100, Strategy::Block));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check(&CancellationToken::new(), "https://api.concurrent.com/v1/test")
                        .await
                })
            })
            .collect();

        let mut allowed = 0;
        let mut rejected = HashSet::new();
        for result in futures::future::join_all(tasks).await {
            match result.unwrap() {
                Ok(()) => allowed += 1,
                Err(LimiterError::LimitExceeded(e)) => assert!(rejected.insert(e.current)),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(allowed, 100);
        assert_eq!(rejected, (101..=200).collect::<HashSet<u64>>());
    }

    #[tokio::test]
    async fn test_bucket_rollover_through_clock() {
        let (now, clock) = manual_clock(Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap());
        let limiter = Limiter::new().with_clock(clock);
        limiter.register(resource("minute-api", "api.minute.com/*", 2, Strategy::Block));
        let cancel = CancellationToken::new();
        let url = "https://api.minute.com/x";

        limiter.check(&cancel, url).await.unwrap();
        limiter.check(&cancel, url).await.unwrap();
        assert!(limiter.check(&cancel, url).await.is_err());

        *now.lock() += TimeDelta::seconds(60);
        limiter.check(&cancel, url).await.unwrap();
        assert_eq!(limiter.get_usage(&cancel, "minute-api").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_usage() {
        let limiter = limiter();
        limiter.register(resource("usage-api", "api.usage.com/*", 100, Strategy::Block));
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            limiter.check(&cancel, "https://api.usage.com/test").await.unwrap();
        }

        assert_eq!(limiter.get_usage(&cancel, "usage-api").await.unwrap(), 5);
        assert!(matches!(
            limiter.get_usage(&cancel, "missing").await,
            Err(LimiterError::NotFound(name)) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_reset_usage() {
        let limiter = limiter();
        limiter.register(resource("reset-api", "api.reset.com/*", 3, Strategy::Block));
        let cancel = CancellationToken::new();
        let url = "https://api.reset.com/test";

        for _ in 0..3 {
            limiter.check(&cancel, url).await.unwrap();
        }
        assert!(limiter.check(&cancel, url).await.unwrap_err().is_limit_exceeded());

        limiter.reset_usage(&cancel, "reset-api").await.unwrap();
        assert_eq!(limiter.get_usage(&cancel, "reset-api").await.unwrap(), 0);
        assert!(limiter.check(&cancel, url).await.is_ok());

        // Unregistered names are still forwarded to the store.
        limiter.reset_usage(&cancel, "never-registered").await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_and_resources() {
        let limiter = limiter();
        limiter.register(resource("a", "a.example.com/*", 10, Strategy::Block));
        limiter.register(resource("b", "b.example.com/*", 10, Strategy::LogOnly));
        let cancel = CancellationToken::new();

        limiter.check(&cancel, "https://a.example.com/1").await.unwrap();
        limiter.check(&cancel, "https://a.example.com/2").await.unwrap();

        let status = limiter.snapshot(&cancel).await.unwrap();
        let counts: Vec<_> = status
            .iter()
            .map(|s| (s.resource.name.as_str(), s.current))
            .collect();
        assert_eq!(counts, vec![("a", 2), ("b", 0)]);

        let mut copy = limiter.resources();
        copy.clear();
        assert_eq!(limiter.resources().len(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_is_wrapped() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let limiter = Limiter::with_store(store);
        limiter.register(resource("db-api", "api.db.com/*", 3, Strategy::Block));
        limiter.close().await.unwrap();

        let err = limiter
            .check(&CancellationToken::new(), "https://api.db.com/q")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LimiterError::Store { op: "increment", ref resource, source: StoreError::Closed }
                if resource == "db-api"
        ));
    }

    #[tokio::test]
    async fn test_cancelled_check() {
        let limiter = limiter();
        limiter.register(resource("any", "*", 3, Strategy::Block));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = limiter.check(&cancel, "https://x.example.com").await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_limiter_over_tiered_store() {
        let durable: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let limiter =
            Limiter::with_store(Arc::new(TieredStore::new(durable.clone()))).with_clock(fixed_now);
        limiter.register(resource("tiered-api", "api.tiered.com/*", 2, Strategy::Block));
        let cancel = CancellationToken::new();

        limiter.check(&cancel, "https://api.tiered.com").await.unwrap();
        limiter.check(&cancel, "https://api.tiered.com").await.unwrap();
        assert!(limiter.check(&cancel, "https://api.tiered.com").await.is_err());

        // A second limiter over the same durable tier sees the same budget.
        let restarted =
            Limiter::with_store(Arc::new(TieredStore::new(durable))).with_clock(fixed_now);
        restarted.register(resource("tiered-api", "api.tiered.com/*", 2, Strategy::Block));
        assert_eq!(restarted.get_usage(&cancel, "tiered-api").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_after_reset() {
        let waiter = waiter_at(Utc::now() - TimeDelta::seconds(5));
        tokio::time::timeout(Duration::from_millis(100), waiter.wait(&CancellationToken::new()))
            .await
            .expect("wait should not block")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_reset() {
        let waiter = waiter_at(Utc::now() + TimeDelta::milliseconds(50));
        let started = std::time::Instant::now();
        waiter.wait(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let waiter = waiter_at(Utc::now() + TimeDelta::seconds(3600));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), waiter.wait(&cancel))
            .await
            .expect("cancellation should end the wait")
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}

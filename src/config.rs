//! Configuration management for the egress limiter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{Limiter, Resource};
use crate::store::{MemoryStore, SqliteStore, Store, TieredStore};

/// Prefix for environment variable overrides, e.g. `EGRESS_STORE__KIND`.
pub const ENV_PREFIX: &str = "EGRESS";

/// Main configuration: where counters live and which resources to track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Resources in match order
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Counter backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-local counters
    #[default]
    Memory,
    /// SQLite file at `path`
    Sqlite,
    /// Memory in front of Redis when `redis_url` is set, SQLite otherwise
    Tiered,
    /// Redis at `redis_url`
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use
    #[serde(default)]
    pub kind: StoreKind,

    /// SQLite database file
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// How long a SQLite writer waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Redis connection URL
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace for Redis keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_path() -> PathBuf {
    PathBuf::from("erl.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_key_prefix() -> String {
    "erl:".to_string()
}

impl LimiterConfig {
    /// Load configuration from a file, with `EGRESS_*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let config: LimiterConfig = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject resources that could never be enforced.
    pub fn validate(&self) -> Result<()> {
        for resource in &self.resources {
            if resource.name.is_empty() {
                return Err(LimiterError::Config("resource name must not be empty".into()));
            }
            if resource.pattern.is_empty() {
                return Err(LimiterError::Config(format!(
                    "resource {:?} has an empty pattern",
                    resource.name
                )));
            }
            if resource.limit == 0 {
                return Err(LimiterError::Config(format!(
                    "resource {:?} must have a limit greater than zero",
                    resource.name
                )));
            }
        }
        Ok(())
    }

    /// Open the configured store and register every resource on a new limiter.
    pub async fn build(&self) -> Result<Limiter> {
        let limiter = Limiter::with_store(self.store.open().await?);
        for resource in &self.resources {
            limiter.register(resource.clone());
        }
        info!(
            store = limiter.store().store_type(),
            resources = self.resources.len(),
            "Limiter ready"
        );
        Ok(limiter)
    }
}

impl StoreConfig {
    /// Open the configured counter store.
    pub async fn open(&self) -> Result<Arc<dyn Store>> {
        let store: Arc<dyn Store> = match self.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::Sqlite => self.open_sqlite()?,
            StoreKind::Tiered => {
                let durable = match self.redis_url {
                    Some(_) => self.open_redis().await?,
                    None => self.open_sqlite()?,
                };
                Arc::new(TieredStore::new(durable))
            }
            StoreKind::Redis => self.open_redis().await?,
        };
        Ok(store)
    }

    fn open_sqlite(&self) -> Result<Arc<dyn Store>> {
        let timeout = Duration::from_millis(self.busy_timeout_ms);
        let store = SqliteStore::open_with_timeout(&self.path, timeout)
            .map_err(|e| LimiterError::store("open", &self.path.display().to_string(), e))?;
        Ok(Arc::new(store))
    }

    #[cfg(feature = "redis")]
    async fn open_redis(&self) -> Result<Arc<dyn Store>> {
        let url = self
            .redis_url
            .as_deref()
            .ok_or_else(|| LimiterError::Config("redis store requires redis_url".into()))?;
        let store = crate::store::RedisStore::connect_with_prefix(url, &self.key_prefix)
            .await
            .map_err(|e| LimiterError::store("open", url, e))?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    async fn open_redis(&self) -> Result<Arc<dyn Store>> {
        Err(LimiterError::Config(
            "redis store requested but the `redis` feature is disabled".into(),
        ))
    }
}

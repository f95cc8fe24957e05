//! Key-value storage for sessions, email tokens and rate-limit counters.
//!
//! Every backend implements [`KeyValueStore`]. Logical stores are obtained
//! through [`StoreSet::open`], which either shares one physical backend
//! between them (each under its own [`Namespaced`] prefix) or opens a
//! dedicated backend per store.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;

/// Byte-oriented key-value storage with per-key expiry.
///
/// Expired keys must be invisible to every read, whether or not the backend
/// has purged them yet.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Get a value. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value. A zero `ttl` means the key never expires.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete a key. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Write `value` only if `key` currently holds `expected`, where `None`
    /// stands for absent or expired. The comparison and the write happen as
    /// one step. Returns whether the write took place.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Live keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn count(&self, prefix: &str) -> Result<usize> {
        Ok(self.list(prefix).await?.len())
    }
}

/// Prefixes every key with `<namespace>:` so several logical stores can
/// share one backend.
#[derive(Clone)]
pub struct Namespaced {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl Namespaced {
    pub fn new(inner: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        Self {
            inner,
            prefix: format!("{}:", namespace),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KeyValueStore for Namespaced {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(&self.key(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.inner.set(&self.key(key), value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.key(key)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        self.inner
            .compare_and_swap(&self.key(key), expected, value, ttl)
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(&self.key(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.inner.list(&self.key(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn count(&self, prefix: &str) -> Result<usize> {
        self.inner.count(&self.key(prefix)).await
    }
}

/// Which physical backend to open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    /// Embedded SQLite database, e.g. `sqlite:authgate.db`.
    Sqlite { url: String },
    /// External Redis cache, e.g. `redis://127.0.0.1:6379`.
    Redis { url: String },
}

/// Storage settings for one logical store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Key prefix used when sharing a backend.
    pub namespace: String,
    /// How often expired entries are purged, in seconds.
    pub cleanup_interval_secs: u64,
    /// Open a separate backend instead of sharing the default one.
    pub dedicated: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            namespace: String::new(),
            cleanup_interval_secs: 60,
            dedicated: false,
        }
    }
}

impl StoreConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Storage settings for the whole gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Shared backend used by every store that is not `dedicated`.
    pub default: StoreConfig,
    pub sessions: StoreConfig,
    pub tokens: StoreConfig,
    pub ratelimit: StoreConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let named = |namespace: &str| StoreConfig {
            namespace: namespace.to_string(),
            ..StoreConfig::default()
        };
        Self {
            default: StoreConfig::default(),
            sessions: named("session"),
            tokens: named("token"),
            ratelimit: named("ratelimit"),
        }
    }
}

/// Open the physical backend a config names.
pub async fn open_backend(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
    match &config.backend {
        Backend::Memory => Ok(Arc::new(MemoryStore::with_cleanup(config.cleanup_interval()))),
        #[cfg(feature = "sqlite")]
        Backend::Sqlite { url } => {
            let store = sqlite::SqliteStore::connect(url).await?;
            Ok(Arc::new(store.with_cleanup(config.cleanup_interval())))
        }
        #[cfg(feature = "redis")]
        Backend::Redis { url } => Ok(Arc::new(self::redis::RedisStore::connect(url).await?)),
        #[allow(unreachable_patterns)]
        other => Err(Error::Storage(format!(
            "backend {:?} is not compiled into this build",
            other
        ))),
    }
}

fn namespaced(inner: Arc<dyn KeyValueStore>, namespace: &str) -> Arc<dyn KeyValueStore> {
    if namespace.is_empty() {
        inner
    } else {
        Arc::new(Namespaced::new(inner, namespace))
    }
}

async fn open_logical(
    store: &StoreConfig,
    shared: &Arc<dyn KeyValueStore>,
) -> Result<Arc<dyn KeyValueStore>> {
    let backend = if store.dedicated {
        let backend = open_backend(store).await?;
        tracing::info!(
            backend = backend.name(),
            namespace = %store.namespace,
            "opened dedicated key-value backend"
        );
        backend
    } else {
        shared.clone()
    };
    Ok(namespaced(backend, &store.namespace))
}

/// The three logical stores the gateway uses.
#[derive(Clone)]
pub struct StoreSet {
    pub sessions: Arc<dyn KeyValueStore>,
    pub tokens: Arc<dyn KeyValueStore>,
    pub ratelimit: Arc<dyn KeyValueStore>,
}

impl StoreSet {
    /// Open the configured backends. Stores not marked `dedicated` share one
    /// instance of the default backend, separated by namespace.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let shared = open_backend(&config.default).await?;
        tracing::info!(backend = shared.name(), "opened shared key-value backend");

        Ok(Self {
            sessions: open_logical(&config.sessions, &shared).await?,
            tokens: open_logical(&config.tokens, &shared).await?,
            ratelimit: open_logical(&config.ratelimit, &shared).await?,
        })
    }

    /// One in-memory backend shared by all stores.
    pub fn in_memory() -> Self {
        let shared: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        Self {
            sessions: namespaced(shared.clone(), "session"),
            tokens: namespaced(shared.clone(), "token"),
            ratelimit: namespaced(shared, "ratelimit"),
        }
    }
}

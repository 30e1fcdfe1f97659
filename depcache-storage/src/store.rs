//! Cache store: values plus the dependency index.
//!
//! `put` stores the value first and links it second. If linking fails the
//! value is left in place, under-registered, until its TTL runs out; a
//! remote multi-key rollback would not be atomic either.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use depcache_core::{BackendError, CacheConfig, CacheError, CacheResult, DependencyId};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::Backend;
use crate::index::DependencyIndex;
use crate::keys::KeySpace;

/// Snapshot of cache usage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of `get` calls that found a value.
    pub hits: u64,
    /// Number of `get` calls that found nothing.
    pub misses: u64,
    /// Number of successful `put` calls.
    pub puts: u64,
    /// Number of keys removed by invalidation.
    pub invalidated: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    invalidated: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }
}

/// Dependency-tracked cache over a shared [`Backend`].
///
/// Cheap to clone; clones share the backend and the usage counters.
///
/// # Example
///
/// ```ignore
/// let cache = CacheStore::new(Arc::new(InMemoryBackend::new()), CacheConfig::default())?;
///
/// cache
///     .put("article:1:page", &page, [DependencyId::entity("article", 1)], None)
///     .await?;
///
/// // Later, when article 1 changes:
/// cache.invalidate([&DependencyId::entity("article", 1)]).await?;
/// ```
pub struct CacheStore<B: Backend + ?Sized> {
    index: DependencyIndex<B>,
    config: Arc<CacheConfig>,
    stats: Arc<StatsCounters>,
}

impl<B: Backend + ?Sized> Clone for CacheStore<B> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<B: Backend + ?Sized> std::fmt::Debug for CacheStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<B: Backend + ?Sized> CacheStore<B> {
    /// Create a cache store.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](depcache_core::ConfigError) if `config`
    /// fails validation.
    pub fn new(backend: Arc<B>, config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let index = DependencyIndex::new(backend, KeySpace::new(config.key_prefix.clone())?)
            .with_log_invalidations(config.log_invalidations);
        Ok(Self {
            index,
            config: Arc::new(config),
            stats: Arc::new(StatsCounters::default()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn index(&self) -> &DependencyIndex<B> {
        &self.index
    }

    pub fn backend(&self) -> &Arc<B> {
        self.index.backend()
    }

    fn data_key(&self, key: &str) -> String {
        self.index.keys().data(key)
    }

    /// Store `value` under `key`, depending on `deps`.
    ///
    /// Replaces any previous value and its dependencies. `expires_in`
    /// falls back to the configured default TTL; with neither the entry
    /// never expires.
    pub async fn put<V, I>(
        &self,
        key: &str,
        value: &V,
        deps: I,
        expires_in: Option<Duration>,
    ) -> CacheResult<()>
    where
        V: Serialize + ?Sized,
        I: IntoIterator<Item = DependencyId>,
    {
        let bytes = serde_json::to_vec(value).map_err(|e| BackendError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let ttl = expires_in.or_else(|| self.config.default_ttl());
        let deps: BTreeSet<DependencyId> = deps.into_iter().collect();

        self.backend()
            .store_value(&self.data_key(key), &bytes, ttl)
            .await?;
        self.index.link(key, &deps, ttl).await?;

        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Load the value under `key`.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotInCache`] if there is no live value; backend and
    /// deserialization failures otherwise.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> CacheResult<V> {
        let Some(bytes) = self.backend().load_value(&self.data_key(key)).await? else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::NotInCache {
                key: key.to_string(),
            });
        };
        self.stats.hits.fetch_add(1, Ordering::Relaxed);

        serde_json::from_slice(&bytes).map_err(|e| {
            BackendError::Deserialization {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// True if a live value exists under `key`.
    ///
    /// Never fails: backend errors are logged and read as `false`. Use
    /// [`try_has`](Self::try_has) to see them.
    pub async fn has(&self, key: &str) -> bool {
        match self.try_has(key).await {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!(key, error = %e, "Presence check failed, reporting miss");
                false
            }
        }
    }

    pub async fn try_has(&self, key: &str) -> CacheResult<bool> {
        Ok(self.backend().has_value(&self.data_key(key)).await?)
    }

    /// Remove every entry depending on any of `deps`. Returns the keys
    /// actually removed.
    pub async fn invalidate<'a, I>(&self, deps: I) -> CacheResult<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a DependencyId>,
    {
        let removed = self.index.invalidate(deps).await?;
        self.stats
            .invalidated
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        Ok(removed)
    }

    /// Remove `key` and its index records. Returns whether a live value
    /// existed.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.index.unregister(key).await?)
    }

    /// Read-through access.
    ///
    /// On a miss, runs `compute` for the value and its dependencies, stores
    /// both, and returns the value.
    pub async fn get_or_put_with<V, F, Fut>(
        &self,
        key: &str,
        expires_in: Option<Duration>,
        compute: F,
    ) -> CacheResult<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<(V, Vec<DependencyId>)>>,
    {
        match self.get(key).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_not_in_cache() => {}
            Err(e) => return Err(e),
        }

        let (value, deps) = compute().await?;
        self.put(key, &value, deps, expires_in).await?;
        Ok(value)
    }

    /// Dependencies `key` is currently registered under.
    pub async fn dependencies_of(&self, key: &str) -> CacheResult<BTreeSet<DependencyId>> {
        Ok(self.index.dependencies_of(key).await?)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}

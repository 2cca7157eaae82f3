//! Storage provider contract (C4): the uniform interface every backend —
//! in-memory, browser-local, or remote — implements.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheResult;
use crate::health::HealthStatus;
use crate::metadata::{CacheKey, Tag};

/// Per-write options a caller may supply; every field is optional and falls
/// back to the provider's own defaults when absent.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<Tag>,
    pub compression: bool,
    pub compression_threshold: Option<usize>,
}

/// Per-provider counters used to build the manager's aggregate rollup.
#[derive(Debug, Clone, Default)]
pub struct ProviderStats {
    pub hits: u64,
    pub misses: u64,
    pub key_count: u64,
    pub memory_usage: u64,
}

impl ProviderStats {
    /// `hits / (hits + misses)`, or `0.0` when there have been no requests.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The contract every storage backend implements. Value absence is a
/// first-class signal distinct from errors: `get` returns `Ok(None)` for a
/// clean miss and `Err` only for an actual provider failure.
#[async_trait]
pub trait StorageProvider<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Stable provider name, used for registration, events, and logging.
    fn name(&self) -> &str;

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<V>>;
    async fn set(&self, key: &CacheKey, value: V, opts: &WriteOptions) -> CacheResult<()>;
    async fn has(&self, key: &CacheKey) -> CacheResult<bool>;
    async fn delete(&self, key: &CacheKey) -> CacheResult<bool>;
    async fn clear(&self) -> CacheResult<()>;

    /// All keys, optionally filtered by a glob-like `pattern` (provider
    /// defined; the core never requires this beyond what `keys()` returns
    /// for stats and diagnostics).
    async fn keys(&self, pattern: Option<&str>) -> CacheResult<Vec<CacheKey>>;

    async fn get_many(&self, keys: &[CacheKey]) -> CacheResult<Vec<(CacheKey, Option<V>)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push((key.clone(), self.get(key).await?));
        }
        Ok(out)
    }

    async fn set_many(&self, entries: &[(CacheKey, V)], opts: &WriteOptions) -> CacheResult<()> {
        for (key, value) in entries {
            self.set(key, value.clone(), opts).await?;
        }
        Ok(())
    }

    async fn get_stats(&self) -> CacheResult<ProviderStats>;
    async fn health_check(&self) -> CacheResult<HealthStatus>;
}

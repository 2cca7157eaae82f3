//! Cache manager facade (C9): the public surface composing the metadata
//! index, provider manager, compute engine, and event spine, plus the
//! read/write validation funnel and the `throw_on_errors` policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::clock::{system_clock, SharedClock};
use crate::compute::{
    spawn_scheduler, ComputeEngine, ComputeEngineConfig, Fetcher, GetOrComputeOptions,
};
use crate::config::CacheManagerConfig;
use crate::error::CacheResult;
use crate::events::{CacheEvent, EventBus, EventKind};
use crate::metadata::{CacheKey, MetadataIndex, MetadataPatch, MetadataStats, Tag};
use crate::provider::manager::{AggregateStats, ProviderManager};
use crate::provider::traits::WriteOptions;

/// Periodically emit `EventKind::StatsUpdate` carrying the aggregate memory
/// usage and key count, at `interval`. Mirrors the scheduler's interval-tick
/// loop; dropping the returned handle does not stop the task.
fn spawn_stats_emitter<V>(
    providers: Arc<ProviderManager<V>>,
    metadata: Arc<MetadataIndex>,
    events: Arc<EventBus>,
    clock: SharedClock,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let provider_stats = providers.stats().await.unwrap_or_default();
            let meta_stats = metadata.stats();
            events.emit(
                CacheEvent::new(EventKind::StatsUpdate, clock.now_millis())
                    .with_size(provider_stats.aggregate.memory_usage)
                    .with_entries_removed(meta_stats.entry_count as u64),
            );
        }
    })
}

/// Composite view across the provider manager and metadata index.
#[derive(Debug, Clone, Default)]
pub struct FacadeStats {
    pub providers: AggregateStats,
    pub metadata: MetadataStats,
}

/// The public cache manager. Construct via [`CacheManager::new`] from a
/// [`CacheManagerConfig`]; every field is internally `Arc`-shared so cloning
/// the handle is cheap.
pub struct CacheManager<V> {
    metadata: Arc<MetadataIndex>,
    providers: Arc<ProviderManager<V>>,
    compute: Arc<ComputeEngine<V>>,
    events: Arc<EventBus>,
    clock: SharedClock,
    throw_on_errors: bool,
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Build a manager using the system wall clock.
    #[must_use]
    pub fn new(config: CacheManagerConfig<V>) -> Arc<Self> {
        Self::with_clock(config, system_clock())
    }

    /// Build a manager using an explicit clock (virtual clocks in tests).
    #[must_use]
    pub fn with_clock(config: CacheManagerConfig<V>, clock: SharedClock) -> Arc<Self> {
        let events = EventBus::new();
        let mut providers = ProviderManager::new(clock.clone()).with_events(events.clone());
        for spec in config.providers {
            providers.register(spec.instance, spec.priority);
        }
        let providers = Arc::new(providers);
        let metadata = Arc::new(MetadataIndex::new(clock.clone()));
        let compute_config = ComputeEngineConfig {
            default_ttl: config.default_ttl,
            refresh_threshold: config.refresh_threshold,
            background_refresh: config.background_refresh,
            deduplicate_requests: config.deduplicate_requests,
            ..ComputeEngineConfig::default()
        };
        let compute = ComputeEngine::new(
            providers.clone(),
            metadata.clone(),
            clock.clone(),
            compute_config,
            Some(events.clone()),
        );
        if config.background_refresh {
            let _ = spawn_scheduler(compute.clone(), crate::compute::DEFAULT_TICK);
        }
        if let Some(interval) = config.stats_interval {
            spawn_stats_emitter(providers.clone(), metadata.clone(), events.clone(), clock.clone(), interval);
        }
        Arc::new(Self { metadata, providers, compute, events, clock, throw_on_errors: config.throw_on_errors })
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn emit(&self, kind: EventKind, key: CacheKey) {
        self.events.emit(CacheEvent::new(kind, self.now()).with_key(key));
    }

    /// Subscribe to the manager's event stream.
    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Read-safe-default funnel: on error, emit `error` and either rethrow
    /// or return `default` depending on `throw_on_errors`.
    fn normalize<T>(&self, result: CacheResult<T>, default: T) -> CacheResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.events.emit(CacheEvent::new(EventKind::Error, self.now()).with_error(err.to_string()));
                if self.throw_on_errors {
                    Err(err)
                } else {
                    Ok(default)
                }
            }
        }
    }

    /// Write funnel: errors are always recorded and always propagate
    /// (`throw_on_errors=false` only changes read behavior).
    fn propagate<T>(&self, result: CacheResult<T>) -> CacheResult<T> {
        if let Err(err) = &result {
            self.events.emit(CacheEvent::new(EventKind::Error, self.now()).with_error(err.to_string()));
        }
        result
    }

    async fn get_internal(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        let Some(value) = self.providers.get(key).await? else {
            self.emit(EventKind::GetMiss, key.clone());
            return Ok(None);
        };
        let meta = self.metadata.get(key);
        let stale = meta.as_ref().is_some_and(|m| self.compute.is_stale(m));
        self.metadata.record_access(key);
        if stale {
            self.emit(EventKind::GetStale, key.clone());
            self.compute.trigger_background_refresh_if_idle(key.clone());
        } else {
            self.emit(EventKind::GetHit, key.clone());
        }
        Ok(Some(value))
    }

    /// Read a value. Never errors for a clean miss; returns `Ok(None)`.
    pub async fn get(self: &Arc<Self>, key: &str) -> CacheResult<Option<V>> {
        let key = CacheKey::new(key)?;
        let result = self.get_internal(&key).await;
        self.normalize(result, None)
    }

    async fn set_internal(&self, key: &CacheKey, value: V, opts: &WriteOptions) -> CacheResult<()> {
        self.providers.set(key, value, opts).await?;
        self.emit(EventKind::Set, key.clone());
        let tags: HashSet<Tag> = opts.tags.iter().cloned().collect();
        let patch = MetadataPatch {
            tags: Some(tags),
            ttl_seconds: Some(opts.ttl.map(|t| t.as_secs())),
            refreshed_at: Some(self.now()),
            ..Default::default()
        };
        self.metadata.set(key.clone(), patch)
    }

    /// Write a value. Always propagates errors, even with `throw_on_errors`
    /// disabled — writes never substitute a silent default.
    pub async fn set(self: &Arc<Self>, key: &str, value: V, opts: WriteOptions) -> CacheResult<()> {
        let key = CacheKey::new(key)?;
        let result = self.set_internal(&key, value, &opts).await;
        self.propagate(result)
    }

    async fn has_internal(&self, key: &CacheKey) -> CacheResult<bool> {
        self.providers.has(key).await
    }

    pub async fn has(self: &Arc<Self>, key: &str) -> CacheResult<bool> {
        let key = CacheKey::new(key)?;
        let result = self.has_internal(&key).await;
        self.normalize(result, false)
    }

    async fn delete_internal(&self, key: &CacheKey) -> CacheResult<bool> {
        let deleted = self.providers.delete(key).await?;
        if deleted {
            self.metadata.delete(key);
            self.emit(EventKind::Delete, key.clone());
        }
        Ok(deleted)
    }

    pub async fn delete(self: &Arc<Self>, key: &str) -> CacheResult<bool> {
        let key = CacheKey::new(key)?;
        let result = self.delete_internal(&key).await;
        self.normalize(result, false)
    }

    pub async fn clear(self: &Arc<Self>) -> CacheResult<()> {
        let result = async {
            self.providers.clear().await?;
            self.metadata.clear();
            self.events.emit(CacheEvent::new(EventKind::Clear, self.now()));
            Ok(())
        }
        .await;
        self.propagate(result)
    }

    /// Batched read. Prefers the primary provider's native `get_many` when
    /// wired (handled inside the provider manager); the facade itself fans
    /// out per key through the same validated path as [`Self::get`].
    pub async fn get_many(self: &Arc<Self>, keys: &[String]) -> CacheResult<Vec<(CacheKey, Option<V>)>> {
        let mut validated = Vec::with_capacity(keys.len());
        for raw in keys {
            validated.push(CacheKey::new(raw.as_str())?);
        }
        let mut out = Vec::with_capacity(validated.len());
        for key in validated {
            let result = self.get_internal(&key).await;
            match self.normalize(result, None) {
                Ok(value) => out.push((key, value)),
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Batched write; every entry goes through the same funnel as
    /// [`Self::set`], so a single failure propagates immediately.
    pub async fn set_many(self: &Arc<Self>, entries: Vec<(String, V)>, opts: WriteOptions) -> CacheResult<()> {
        for (raw, value) in entries {
            let key = CacheKey::new(raw)?;
            let result = self.set_internal(&key, value, &opts).await;
            self.propagate(result)?;
        }
        Ok(())
    }

    /// Compute-on-miss with dedup, retry, and stale-while-revalidate,
    /// delegated to the compute engine (C8).
    pub async fn get_or_compute(
        self: &Arc<Self>,
        key: &str,
        fetcher: Fetcher<V>,
        opts: GetOrComputeOptions,
    ) -> CacheResult<V> {
        let key = CacheKey::new(key)?;
        self.compute.get_or_compute(key, fetcher, opts).await
    }

    /// Build a memoizing callable: `wrap(f, keygen, opts)(args)` is
    /// equivalent to `getOrCompute(keygen(args), || f(args), opts)`.
    pub fn wrap<A, K, F>(
        self: &Arc<Self>,
        keygen: K,
        compute_fn: F,
        opts: GetOrComputeOptions,
    ) -> Box<dyn Fn(A) -> BoxFuture<'static, CacheResult<V>> + Send + Sync>
    where
        A: Clone + Send + Sync + 'static,
        K: Fn(&A) -> CacheKey + Send + Sync + 'static,
        F: Fn(A) -> BoxFuture<'static, CacheResult<V>> + Send + Sync + 'static,
    {
        let manager = self.clone();
        let keygen = Arc::new(keygen);
        let compute_fn = Arc::new(compute_fn);
        Box::new(move |args: A| {
            let manager = manager.clone();
            let keygen = keygen.clone();
            let compute_fn = compute_fn.clone();
            let opts = opts.clone();
            Box::pin(async move {
                let key = keygen(&args);
                let fetcher: Fetcher<V> = {
                    let compute_fn = compute_fn.clone();
                    let args = args.clone();
                    Arc::new(move || {
                        let compute_fn = compute_fn.clone();
                        let args = args.clone();
                        Box::pin(async move { compute_fn(args).await }) as BoxFuture<'static, CacheResult<V>>
                    })
                };
                manager.compute.get_or_compute(key, fetcher, opts).await
            })
        })
    }

    async fn invalidate_keys(&self, keys: Vec<CacheKey>) -> CacheResult<u64> {
        let mut removed = 0u64;
        for key in &keys {
            if self.providers.delete(key).await? {
                removed += 1;
            }
            self.metadata.delete(key);
        }
        Ok(removed)
    }

    /// Delete every key carrying `tag`. Returns the count removed.
    pub async fn invalidate_by_tag(self: &Arc<Self>, tag: &str) -> CacheResult<u64> {
        let keys = self.metadata.find_by_tag(tag);
        let result = self.invalidate_keys(keys).await;
        let result = result.map(|count| {
            self.events.emit(
                CacheEvent::new(EventKind::Invalidate, self.now())
                    .with_tag(tag.to_string())
                    .with_entries_removed(count),
            );
            count
        });
        self.normalize(result, 0)
    }

    /// Delete every key starting with `prefix`. Resolved through the
    /// metadata index, so it always reflects the live key set rather than
    /// a fabricated or stale pattern match.
    pub async fn invalidate_by_prefix(self: &Arc<Self>, prefix: &str) -> CacheResult<u64> {
        let keys = self.metadata.find_by_prefix(prefix);
        let result = self.invalidate_keys(keys).await;
        let result = result.map(|count| {
            self.events.emit(
                CacheEvent::new(EventKind::Invalidate, self.now())
                    .with_reason("prefix")
                    .with_entries_removed(count),
            );
            count
        });
        self.normalize(result, 0)
    }

    /// Composite stats across the provider manager and metadata index.
    pub async fn get_stats(self: &Arc<Self>) -> CacheResult<FacadeStats> {
        let providers = self.providers.stats().await?;
        let metadata = self.metadata.stats();
        Ok(FacadeStats { providers, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::config::CacheManagerConfigBuilder;
    use crate::provider::memory::{MemoryProvider, MemoryProviderConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager(clock: VirtualClock) -> Arc<CacheManager<String>> {
        let clock: SharedClock = Arc::new(clock);
        let memory = Arc::new(MemoryProvider::new("memory", MemoryProviderConfig::default(), clock.clone()));
        let config = CacheManagerConfigBuilder::new().provider(memory, 0).build();
        CacheManager::with_clock(config, clock)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = manager(VirtualClock::new(0));
        cache.set("k", "v".to_string(), WriteOptions::default()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn delete_then_has_is_false_and_metadata_is_gone() {
        let cache = manager(VirtualClock::new(0));
        cache.set("k", "v".to_string(), WriteOptions::default()).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.has("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn read_through_compute_emits_the_expected_sequence() {
        let cache = manager(VirtualClock::new(0));
        let fetcher: Fetcher<String> = Arc::new(|| Box::pin(async { Ok("alice".to_string()) }));
        let opts = GetOrComputeOptions { ttl: Some(Duration::from_secs(60)), ..Default::default() };
        let value = cache.get_or_compute("u:42", fetcher, opts).await.unwrap();
        assert_eq!(value, "alice");
        assert_eq!(cache.get("u:42").await.unwrap(), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn invalidate_by_tag_removes_only_tagged_keys() {
        let cache = manager(VirtualClock::new(0));
        let tagged = WriteOptions { tags: vec![Arc::from("products")], ..Default::default() };
        cache.set("p1", "a".to_string(), tagged.clone()).await.unwrap();
        cache.set("p2", "b".to_string(), tagged.clone()).await.unwrap();
        cache.set("p3", "c".to_string(), tagged).await.unwrap();
        cache.set("u1", "d".to_string(), WriteOptions::default()).await.unwrap();

        let removed = cache.invalidate_by_tag("products").await.unwrap();
        assert_eq!(removed, 3);
        assert!(!cache.has("p1").await.unwrap());
        assert!(!cache.has("p2").await.unwrap());
        assert!(!cache.has("p3").await.unwrap());
        assert!(cache.has("u1").await.unwrap());
    }

    #[tokio::test]
    async fn throw_on_errors_false_returns_safe_defaults_on_read() {
        let clock: SharedClock = Arc::new(VirtualClock::new(0));
        let config = CacheManagerConfigBuilder::<String>::new().throw_on_errors(false).build();
        let cache = CacheManager::with_clock(config, clock);
        assert_eq!(cache.get("missing").await.unwrap(), None);
        assert!(!cache.has("missing").await.unwrap());
    }

    #[tokio::test]
    async fn stats_interval_periodically_emits_stats_update() {
        let clock: SharedClock = Arc::new(VirtualClock::new(0));
        let memory = Arc::new(MemoryProvider::new("memory", MemoryProviderConfig::default(), clock.clone()));
        let config = CacheManagerConfigBuilder::new()
            .provider(memory, 0)
            .stats_interval(Duration::from_millis(5))
            .build();
        let cache = CacheManager::with_clock(config, clock);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        cache.events().subscribe(EventKind::StatsUpdate, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        cache.set("k", "v".to_string(), WriteOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn wrap_builds_a_memoizing_callable() {
        let cache = manager(VirtualClock::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let callable = cache.wrap(
            |user_id: &u64| CacheKey::new(format!("user:{user_id}")).unwrap(),
            move |user_id: u64| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("user-{user_id}"))
                }) as BoxFuture<'static, CacheResult<String>>
            },
            GetOrComputeOptions::default(),
        );

        assert_eq!(callable(42).await.unwrap(), "user-42");
        assert_eq!(callable(42).await.unwrap(), "user-42");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

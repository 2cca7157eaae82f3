//! Provider manager (C7): priority-ordered provider stack, health/error
//! tracking, and read/write/delete fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventBus, EventKind};
use crate::health::HealthStatus;
use crate::metadata::CacheKey;
use crate::provider::traits::{ProviderStats, StorageProvider, WriteOptions};

/// The error count past which a provider is demoted to the lowest priority
/// on its next observed failure.
const DEMOTION_THRESHOLD: u32 = 5;

struct Registration<V> {
    provider: Arc<dyn StorageProvider<V>>,
    priority: AtomicI64,
    original_priority: i64,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Aggregate stats across all registered providers.
#[derive(Debug, Clone, Default)]
pub struct AggregateStats {
    pub per_provider: HashMap<String, ProviderStats>,
    pub aggregate: ProviderStats,
}

/// Owns the provider stack, keeps a priority-sorted name snapshot, and
/// implements read/write/delete/clear fan-out across it.
pub struct ProviderManager<V> {
    providers: DashMap<String, Registration<V>>,
    order: ArcSwap<Vec<String>>,
    clock: SharedClock,
    events: Option<Arc<EventBus>>,
}

impl<V> ProviderManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            providers: DashMap::new(),
            order: ArcSwap::from_pointee(Vec::new()),
            clock,
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    /// Register a provider at the given priority (lower = consulted
    /// earlier). Re-registering an existing name replaces it.
    pub fn register(&self, provider: Arc<dyn StorageProvider<V>>, priority: i64) {
        let name = provider.name().to_string();
        self.providers.insert(
            name.clone(),
            Registration {
                provider,
                priority: AtomicI64::new(priority),
                original_priority: priority,
                error_count: AtomicU64::new(0),
                last_error: Mutex::new(None),
            },
        );
        self.rebuild_order();
        self.emit(CacheEvent::new(EventKind::ProviderInitialized, self.now()).with_provider(name));
    }

    /// Remove a provider by name.
    pub fn remove(&self, name: &str) {
        if self.providers.remove(name).is_some() {
            self.rebuild_order();
            self.emit(CacheEvent::new(EventKind::ProviderRemoved, self.now()).with_provider(name.to_string()));
        }
    }

    fn rebuild_order(&self) {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort_by_key(|name| {
            self.providers
                .get(name)
                .map(|r| r.priority.load(Ordering::SeqCst))
                .unwrap_or(i64::MAX)
        });
        self.order.store(Arc::new(names));
    }

    fn record_error(&self, name: &str, error: &CacheError) {
        let Some(reg) = self.providers.get(name) else { return };
        let count = reg.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        *reg.last_error.lock() = Some(error.message.clone());
        self.emit(
            CacheEvent::new(EventKind::ProviderError, self.now())
                .with_provider(name.to_string())
                .with_error(error.to_string()),
        );
        if count > u64::from(DEMOTION_THRESHOLD) {
            let max_priority = self
                .providers
                .iter()
                .map(|e| e.priority.load(Ordering::SeqCst))
                .max()
                .unwrap_or(0);
            reg.priority.store(max_priority + 1, Ordering::SeqCst);
            drop(reg);
            self.rebuild_order();
        }
    }

    /// Reset every provider's error count, restore each provider to its
    /// originally-registered priority (undoing any demotion), and re-sort.
    pub fn reset_error_counts(&self) {
        for entry in self.providers.iter() {
            entry.error_count.store(0, Ordering::SeqCst);
            *entry.last_error.lock() = None;
            entry.priority.store(entry.original_priority, Ordering::SeqCst);
        }
        self.rebuild_order();
    }

    /// Restore a provider's priority (e.g. after an operator fixes the
    /// underlying issue behind a demotion) and re-sort.
    pub fn set_priority(&self, name: &str, priority: i64) {
        if let Some(reg) = self.providers.get(name) {
            reg.priority.store(priority, Ordering::SeqCst);
        }
        self.rebuild_order();
    }

    fn ordered_names(&self) -> Arc<Vec<String>> {
        self.order.load_full()
    }

    /// Iterate providers by priority, returning the first non-absent
    /// value. A provider error is swallowed and recorded unless it is the
    /// last provider in the chain (or the only one), in which case it
    /// propagates.
    pub async fn get(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        let order = self.ordered_names();
        if order.is_empty() {
            return Err(CacheError::no_provider());
        }
        let last_index = order.len() - 1;
        for (i, name) in order.iter().enumerate() {
            let Some(reg) = self.providers.get(name) else { continue };
            match reg.provider.get(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => continue,
                Err(err) => {
                    drop(reg);
                    self.record_error(name, &err);
                    if i == last_index {
                        return Err(err);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Iterate providers by priority, returning the first positive `has`.
    /// Follows the same swallow-unless-last error discipline as [`Self::get`].
    pub async fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        let order = self.ordered_names();
        if order.is_empty() {
            return Err(CacheError::no_provider());
        }
        let last_index = order.len() - 1;
        for (i, name) in order.iter().enumerate() {
            let Some(reg) = self.providers.get(name) else { continue };
            match reg.provider.has(key).await {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(err) => {
                    drop(reg);
                    self.record_error(name, &err);
                    if i == last_index {
                        return Err(err);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Fan out to every provider concurrently (settle-all). A failure on
    /// the top-priority provider propagates; failures on secondaries are
    /// recorded but never fail the operation.
    pub async fn set(&self, key: &CacheKey, value: V, opts: &WriteOptions) -> CacheResult<()> {
        let order = self.ordered_names();
        if order.is_empty() {
            return Err(CacheError::no_provider());
        }
        let futures = order.iter().filter_map(|name| {
            let reg = self.providers.get(name)?;
            let provider = reg.provider.clone();
            let value = value.clone();
            let name = name.clone();
            Some(async move { (name, provider.set(&key.clone(), value, opts).await) })
        });
        let results = futures::future::join_all(futures).await;

        let mut top_error = None;
        for (i, (name, result)) in results.into_iter().enumerate() {
            if let Err(err) = result {
                self.record_error(&name, &err);
                if i == 0 {
                    top_error = Some(err);
                }
            }
        }
        match top_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fan out to every provider; the result is the logical OR of
    /// per-provider `deleted` booleans. Errors never fail the delete.
    pub async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        let order = self.ordered_names();
        let futures = order.iter().filter_map(|name| {
            let reg = self.providers.get(name)?;
            let provider = reg.provider.clone();
            let name = name.clone();
            Some(async move { (name, provider.delete(&key.clone()).await) })
        });
        let results = futures::future::join_all(futures).await;

        let mut any_deleted = false;
        for (name, result) in results {
            match result {
                Ok(deleted) => any_deleted |= deleted,
                Err(err) => self.record_error(&name, &err),
            }
        }
        Ok(any_deleted)
    }

    /// Fan out a clear to every provider; errors are recorded, not fatal.
    pub async fn clear(&self) -> CacheResult<()> {
        let order = self.ordered_names();
        let futures = order.iter().filter_map(|name| {
            let reg = self.providers.get(name)?;
            let provider = reg.provider.clone();
            let name = name.clone();
            Some(async move { (name, provider.clear().await) })
        });
        let results = futures::future::join_all(futures).await;
        for (name, result) in results {
            if let Err(err) = result {
                self.record_error(&name, &err);
            }
        }
        Ok(())
    }

    /// Per-provider stats plus an aggregate rollup (sum of hits/misses/
    /// key_count/memory_usage; hit ratio computed over the sums).
    pub async fn stats(&self) -> CacheResult<AggregateStats> {
        let order = self.ordered_names();
        let mut out = AggregateStats::default();
        for name in order.iter() {
            let Some(reg) = self.providers.get(name) else { continue };
            if let Ok(stats) = reg.provider.get_stats().await {
                out.aggregate.hits += stats.hits;
                out.aggregate.misses += stats.misses;
                out.aggregate.key_count += stats.key_count;
                out.aggregate.memory_usage += stats.memory_usage;
                out.per_provider.insert(name.clone(), stats);
            }
        }
        Ok(out)
    }

    /// Current health classification for a provider, rebuilt from its
    /// tracked error count.
    pub fn health(&self, name: &str) -> Option<HealthStatus> {
        let reg = self.providers.get(name)?;
        let error_count = reg.error_count.load(Ordering::SeqCst) as u32;
        let last_error = reg.last_error.lock().clone();
        Some(HealthStatus::from_error_count(error_count, last_error, self.now()))
    }

    /// True if no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Current priority-ordered provider names, for diagnostics/tests.
    #[must_use]
    pub fn ordered_provider_names(&self) -> Vec<String> {
        (*self.ordered_names()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::error::ErrorKind;
    use crate::provider::memory::{MemoryProvider, MemoryProviderConfig};
    use std::sync::Arc;

    fn manager() -> ProviderManager<i32> {
        ProviderManager::new(Arc::new(VirtualClock::new(0)))
    }

    fn memory(name: &str) -> Arc<MemoryProvider<i32>> {
        Arc::new(MemoryProvider::new(name, MemoryProviderConfig::default(), Arc::new(VirtualClock::new(0))))
    }

    #[tokio::test]
    async fn read_returns_first_hit_in_priority_order() {
        let mgr = manager();
        let fast = memory("fast");
        let slow = memory("slow");
        let key = CacheKey::new("k").unwrap();
        slow.set(&key, 99, &WriteOptions::default()).await.unwrap();

        mgr.register(fast, 0);
        mgr.register(slow, 1);

        assert_eq!(mgr.get(&key).await.unwrap(), Some(99));
    }

    #[tokio::test]
    async fn write_fans_out_to_all_providers() {
        let mgr = manager();
        let a = memory("a");
        let b = memory("b");
        mgr.register(a.clone(), 0);
        mgr.register(b.clone(), 1);

        let key = CacheKey::new("k").unwrap();
        mgr.set(&key, 1, &WriteOptions::default()).await.unwrap();

        assert_eq!(a.get(&key).await.unwrap(), Some(1));
        assert_eq!(b.get(&key).await.unwrap(), Some(1));
    }

    #[derive(Clone)]
    struct AlwaysFails {
        name: String,
    }

    #[async_trait::async_trait]
    impl StorageProvider<i32> for AlwaysFails {
        fn name(&self) -> &str {
            &self.name
        }
        async fn get(&self, _key: &CacheKey) -> CacheResult<Option<i32>> {
            Err(CacheError::new(ErrorKind::ProviderError, "boom"))
        }
        async fn set(&self, _key: &CacheKey, _value: i32, _opts: &WriteOptions) -> CacheResult<()> {
            Err(CacheError::new(ErrorKind::ProviderError, "boom"))
        }
        async fn has(&self, _key: &CacheKey) -> CacheResult<bool> {
            Ok(false)
        }
        async fn delete(&self, _key: &CacheKey) -> CacheResult<bool> {
            Ok(false)
        }
        async fn clear(&self) -> CacheResult<()> {
            Ok(())
        }
        async fn keys(&self, _pattern: Option<&str>) -> CacheResult<Vec<CacheKey>> {
            Ok(Vec::new())
        }
        async fn get_stats(&self) -> CacheResult<ProviderStats> {
            Ok(ProviderStats::default())
        }
        async fn health_check(&self) -> CacheResult<HealthStatus> {
            Ok(HealthStatus::from_error_count(0, None, 0))
        }
    }

    #[tokio::test]
    async fn provider_demotion_after_six_consecutive_failures() {
        let mgr = manager();
        let fast = Arc::new(AlwaysFails { name: "fast".to_string() });
        let slow = memory("slow");
        let key = CacheKey::new("k").unwrap();
        slow.set(&key, 7, &WriteOptions::default()).await.unwrap();

        mgr.register(fast, 0);
        mgr.register(slow, 1);
        assert_eq!(mgr.ordered_provider_names(), vec!["fast", "slow"]);

        for _ in 0..6 {
            let _ = mgr.get(&key).await;
        }

        assert_eq!(mgr.ordered_provider_names(), vec!["slow", "fast"]);
        assert_eq!(mgr.get(&key).await.unwrap(), Some(7));

        mgr.reset_error_counts();
        assert_eq!(mgr.ordered_provider_names(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn delete_is_logical_or_across_providers() {
        let mgr = manager();
        let a = memory("a");
        let b = memory("b");
        let key = CacheKey::new("k").unwrap();
        b.set(&key, 1, &WriteOptions::default()).await.unwrap();
        mgr.register(a, 0);
        mgr.register(b, 1);

        assert!(mgr.delete(&key).await.unwrap());
        assert!(!mgr.delete(&key).await.unwrap());
    }
}

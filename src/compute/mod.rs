//! Compute engine (C8): at-most-one-compute-per-key dedup, retry/backoff,
//! staleness detection, and the background refresh task registry.
//!
//! Dedup is realized with [`tokio::sync::broadcast`] fanned out to waiters
//! rather than a hand-rolled mutex/condvar, since the runtime already
//! supplies a shared-future-like primitive for exactly this fan-out.

mod scheduler;

pub use scheduler::{spawn_scheduler, DEFAULT_TICK};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::clock::SharedClock;
use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::events::{CacheEvent, EventBus, EventKind};
use crate::metadata::{CacheKey, EntryMetadata, MetadataIndex, MetadataPatch, Tag};
use crate::provider::manager::ProviderManager;
use crate::provider::traits::WriteOptions;

/// Default fraction of TTL after which an entry is considered stale.
pub const DEFAULT_REFRESH_THRESHOLD: f64 = 0.75;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
const BROADCAST_CAPACITY: usize = 32;

/// A caller-supplied value fetcher, invoked under dedup/retry discipline.
pub type Fetcher<V> = Arc<dyn Fn() -> BoxFuture<'static, CacheResult<V>> + Send + Sync>;

/// The result of a single compute/refresh attempt, fanned out to dedup
/// waiters.
pub type ComputeOutcome<V> = CacheResult<V>;

/// Per-call options for [`ComputeEngine::get_or_compute`].
#[derive(Clone)]
pub struct GetOrComputeOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<Tag>,
    pub max_retries: Option<u32>,
    pub base_delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub stale_if_error: bool,
    pub background_refresh: Option<bool>,
}

impl Default for GetOrComputeOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            tags: Vec::new(),
            max_retries: None,
            base_delay: None,
            timeout: None,
            stale_if_error: false,
            background_refresh: None,
        }
    }
}

/// Engine-wide defaults, set once at construction from
/// [`crate::config::CacheManagerConfig`].
#[derive(Clone)]
pub struct ComputeEngineConfig {
    pub default_ttl: Option<Duration>,
    pub refresh_threshold: f64,
    pub background_refresh: bool,
    pub deduplicate_requests: bool,
    pub default_max_retries: u32,
    pub default_base_delay: Duration,
}

impl Default for ComputeEngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(3600)),
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            background_refresh: false,
            deduplicate_requests: true,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

struct RefreshTask<V> {
    fetcher: Fetcher<V>,
    opts: GetOrComputeOptions,
    next_refresh_at: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Compute,
    Refresh,
}

impl Trigger {
    fn start(self) -> EventKind {
        match self {
            Trigger::Compute => EventKind::ComputeStart,
            Trigger::Refresh => EventKind::RefreshStart,
        }
    }
    fn success(self) -> EventKind {
        match self {
            Trigger::Compute => EventKind::ComputeSuccess,
            Trigger::Refresh => EventKind::RefreshSuccess,
        }
    }
    fn error(self) -> EventKind {
        match self {
            Trigger::Compute => EventKind::ComputeError,
            Trigger::Refresh => EventKind::RefreshError,
        }
    }
}

/// Dedup + retry + staleness + background-refresh engine, shared via `Arc`
/// so its background scheduler task can hold a handle back to it.
pub struct ComputeEngine<V> {
    providers: Arc<ProviderManager<V>>,
    metadata: Arc<MetadataIndex>,
    events: Option<Arc<EventBus>>,
    clock: SharedClock,
    config: ComputeEngineConfig,
    in_flight: DashMap<CacheKey, broadcast::Sender<ComputeOutcome<V>>>,
    refresh_tasks: DashMap<CacheKey, RefreshTask<V>>,
}

impl<V> ComputeEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(
        providers: Arc<ProviderManager<V>>,
        metadata: Arc<MetadataIndex>,
        clock: SharedClock,
        config: ComputeEngineConfig,
        events: Option<Arc<EventBus>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            providers,
            metadata,
            events,
            clock,
            config,
            in_flight: DashMap::new(),
            refresh_tasks: DashMap::new(),
        })
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    /// True iff `meta`'s age since `refreshed_at` exceeds `ttl * threshold`.
    /// An entry with no TTL or no recorded refresh time is never stale.
    #[must_use]
    pub fn is_stale(&self, meta: &EntryMetadata) -> bool {
        let (Some(ttl), Some(refreshed_at)) = (meta.ttl_seconds, meta.refreshed_at) else {
            return false;
        };
        if ttl == 0 {
            return false;
        }
        let threshold_millis = (ttl as f64 * self.config.refresh_threshold * 1000.0) as u64;
        self.now().saturating_sub(refreshed_at) > threshold_millis
    }

    /// The dedup + retry + compute-on-miss entry point. Blocks (cooperatively)
    /// until a result is available; concurrent callers for the same key
    /// collapse onto a single fetcher invocation.
    pub async fn get_or_compute(
        self: &Arc<Self>,
        key: CacheKey,
        fetcher: Fetcher<V>,
        opts: GetOrComputeOptions,
    ) -> CacheResult<V> {
        let timeout = opts.timeout;
        let engine = self.clone();
        let body = async move { engine.execute(key, fetcher, opts, Trigger::Compute).await };
        match timeout {
            Some(duration) => tokio::time::timeout(duration, body)
                .await
                .unwrap_or_else(|_| Err(CacheError::timeout("get_or_compute"))),
            None => body.await,
        }
    }

    /// Remove any registered background-refresh task for `key`.
    pub fn cancel_refresh(&self, key: &CacheKey) {
        self.refresh_tasks.remove(key);
    }

    /// True iff a refresh (or compute) is currently running for `key`.
    #[must_use]
    pub fn has_pending_operation(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Invoked by [`crate::facade::CacheManager::get`] on a stale hit: if
    /// background refresh is enabled engine-wide and a fetcher was
    /// previously registered for `key` (via a prior `get_or_compute`), and
    /// no refresh/compute is already in flight, spawns one. No-op otherwise.
    pub fn trigger_background_refresh_if_idle(self: &Arc<Self>, key: CacheKey) {
        if !self.config.background_refresh || self.in_flight.contains_key(&key) {
            return;
        }
        let Some(task) = self.refresh_tasks.get(&key) else {
            return;
        };
        let fetcher = task.fetcher.clone();
        let opts = task.opts.clone();
        drop(task);
        let engine = self.clone();
        tokio::spawn(async move {
            let _ = engine.execute(key, fetcher, opts, Trigger::Refresh).await;
        });
    }

    /// Scan registered refresh tasks and fire every one whose
    /// `next_refresh_at` is due, skipping keys with an in-flight operation
    /// already running. Called by the background scheduler on each tick and
    /// directly by tests that want deterministic control over refresh timing.
    pub async fn run_due_refreshes(self: &Arc<Self>) {
        let now = self.now();
        let due: Vec<CacheKey> = self
            .refresh_tasks
            .iter()
            .filter(|e| e.next_refresh_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in due {
            if self.in_flight.contains_key(&key) {
                continue;
            }
            let Some(task) = self.refresh_tasks.get(&key) else { continue };
            let fetcher = task.fetcher.clone();
            let opts = task.opts.clone();
            drop(task);
            let engine = self.clone();
            let _ = engine.execute(key, fetcher, opts, Trigger::Refresh).await;
        }
    }

    async fn execute(
        self: Arc<Self>,
        key: CacheKey,
        fetcher: Fetcher<V>,
        opts: GetOrComputeOptions,
        trigger: Trigger,
    ) -> CacheResult<V> {
        let cached = self.providers.get(&key).await?;
        let meta = self.metadata.get(&key);
        let stale = meta.as_ref().is_some_and(|m| self.is_stale(m));

        if trigger == Trigger::Compute {
            match (&cached, stale) {
                (Some(value), false) => {
                    self.metadata.record_access(&key);
                    self.emit(CacheEvent::new(EventKind::GetHit, self.now()).with_key(key));
                    return Ok(value.clone());
                }
                (Some(_), true) => {
                    self.emit(CacheEvent::new(EventKind::GetStale, self.now()).with_key(key.clone()));
                }
                (None, _) => {
                    self.emit(CacheEvent::new(EventKind::GetMiss, self.now()).with_key(key.clone()));
                }
            }
        }

        // Dedup: become the sole driver of the fetch, or subscribe to
        // whichever driver is already running.
        let mut receiver = None;
        let deduplicate = self.config.deduplicate_requests;
        if deduplicate {
            match self.in_flight.entry(key.clone()) {
                Entry::Occupied(entry) => receiver = Some(entry.get().subscribe()),
                Entry::Vacant(entry) => {
                    let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
                    entry.insert(tx);
                }
            }
        }

        if let Some(mut rx) = receiver {
            return match rx.recv().await {
                Ok(outcome) => outcome,
                Err(_) => Err(CacheError::new(
                    ErrorKind::OperationAborted,
                    "in-flight compute was dropped before completing",
                )),
            };
        }

        self.emit(CacheEvent::new(trigger.start(), self.now()).with_key(key.clone()));
        let max_retries = opts.max_retries.unwrap_or(self.config.default_max_retries);
        let base_delay = opts.base_delay.unwrap_or(self.config.default_base_delay);
        let result = Self::fetch_with_retry(&fetcher, max_retries, base_delay).await;

        let outcome = match &result {
            Ok(value) => {
                if let Err(err) = self.publish(&key, value.clone(), &opts).await {
                    Err(err)
                } else {
                    self.emit(CacheEvent::new(trigger.success(), self.now()).with_key(key.clone()));
                    if opts.background_refresh.unwrap_or(self.config.background_refresh) {
                        self.schedule_refresh(&key, fetcher.clone(), opts.clone());
                    }
                    Ok(value.clone())
                }
            }
            Err(err) => {
                self.emit(
                    CacheEvent::new(trigger.error(), self.now())
                        .with_key(key.clone())
                        .with_error(err.to_string()),
                );
                Err(err.clone())
            }
        };

        if deduplicate {
            if let Some((_, tx)) = self.in_flight.remove(&key) {
                let _ = tx.send(outcome.clone());
            }
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(err) if trigger == Trigger::Compute && opts.stale_if_error => {
                cached.ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_with_retry(fetcher: &Fetcher<V>, max_retries: u32, base_delay: Duration) -> CacheResult<V> {
        let attempts = max_retries.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = base_delay * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
            match fetcher().await {
                Ok(value) => return Ok(value),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| CacheError::new(ErrorKind::OperationError, "fetcher never ran")))
    }

    async fn publish(&self, key: &CacheKey, value: V, opts: &GetOrComputeOptions) -> CacheResult<()> {
        let ttl = opts.ttl.or(self.config.default_ttl);
        let write_opts = WriteOptions {
            ttl,
            tags: opts.tags.clone(),
            compression: false,
            compression_threshold: None,
        };
        self.providers.set(key, value, &write_opts).await?;
        self.emit(CacheEvent::new(EventKind::Set, self.now()).with_key(key.clone()));

        let now = self.now();
        let tags: HashSet<Tag> = opts.tags.iter().cloned().collect();
        let patch = MetadataPatch {
            tags: Some(tags),
            ttl_seconds: Some(ttl.map(|t| t.as_secs())),
            refreshed_at: Some(now),
            ..Default::default()
        };
        self.metadata.set(key.clone(), patch)
    }

    fn schedule_refresh(&self, key: &CacheKey, fetcher: Fetcher<V>, opts: GetOrComputeOptions) {
        let ttl_secs = opts
            .ttl
            .or(self.config.default_ttl)
            .map(|t| t.as_secs())
            .unwrap_or(0);
        if ttl_secs == 0 {
            self.refresh_tasks.remove(key);
            return;
        }
        let next_refresh_at = self.now() + (ttl_secs as f64 * self.config.refresh_threshold * 1000.0) as u64;
        self.refresh_tasks.insert(
            key.clone(),
            RefreshTask { fetcher, opts, next_refresh_at },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::provider::memory::{MemoryProvider, MemoryProviderConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(clock: VirtualClock, config: ComputeEngineConfig) -> (Arc<ComputeEngine<i32>>, Arc<ProviderManager<i32>>) {
        let clock: SharedClock = Arc::new(clock);
        let providers = Arc::new(ProviderManager::new(clock.clone()));
        providers.register(
            Arc::new(MemoryProvider::new("memory", MemoryProviderConfig::default(), clock.clone())),
            0,
        );
        let metadata = Arc::new(MetadataIndex::new(clock.clone()));
        (ComputeEngine::new(providers.clone(), metadata, clock, config, None), providers)
    }

    fn fetcher_returning(value: i32, calls: Arc<AtomicUsize>) -> Fetcher<i32> {
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(value) })
        })
    }

    #[tokio::test]
    async fn read_through_compute_populates_and_hits() {
        let (engine, _providers) = engine(VirtualClock::new(0), ComputeEngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = fetcher_returning(7, calls.clone());

        let v1 = engine.get_or_compute(CacheKey::new("k").unwrap(), fetcher.clone(), GetOrComputeOptions::default()).await.unwrap();
        assert_eq!(v1, 7);
        let v2 = engine.get_or_compute(CacheKey::new("k").unwrap(), fetcher, GetOrComputeOptions::default()).await.unwrap();
        assert_eq!(v2, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_dedup_to_one_fetch() {
        let (engine, _providers) = engine(VirtualClock::new(0), ComputeEngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let fetcher: Fetcher<i32> = Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(1)
            })
        });

        let mut handles = Vec::new();
        for _ in 0..50 {
            let engine = engine.clone();
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move {
                engine.get_or_compute(CacheKey::new("k").unwrap(), fetcher, GetOrComputeOptions::default()).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_exhaust_then_propagate() {
        let (engine, _providers) = engine(VirtualClock::new(0), ComputeEngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let fetcher: Fetcher<i32> = Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Err(CacheError::new(ErrorKind::ProviderError, "boom")) })
        });
        let opts = GetOrComputeOptions {
            max_retries: Some(3),
            base_delay: Some(Duration::from_millis(1)),
            ..Default::default()
        };

        let err = engine.get_or_compute(CacheKey::new("k").unwrap(), fetcher, opts).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderError);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stale_if_error_falls_back_to_cached_value() {
        let clock = VirtualClock::new(0);
        let (engine, _providers) = engine(clock.clone(), ComputeEngineConfig {
            refresh_threshold: 0.5,
            ..Default::default()
        });
        let ok_calls = Arc::new(AtomicUsize::new(0));
        let ok_fetcher = fetcher_returning(1, ok_calls);
        engine
            .get_or_compute(
                CacheKey::new("k").unwrap(),
                ok_fetcher,
                GetOrComputeOptions { ttl: Some(Duration::from_secs(10)), ..Default::default() },
            )
            .await
            .unwrap();

        clock.advance(6_000);
        let failing: Fetcher<i32> = Arc::new(|| Box::pin(async { Err(CacheError::new(ErrorKind::ProviderError, "down")) }));
        let opts = GetOrComputeOptions {
            stale_if_error: true,
            max_retries: Some(1),
            ..Default::default()
        };
        let value = engine.get_or_compute(CacheKey::new("k").unwrap(), failing, opts).await.unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn timeout_bounds_the_whole_retry_loop() {
        let (engine, _providers) = engine(VirtualClock::new(0), ComputeEngineConfig::default());
        let fetcher: Fetcher<i32> = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(CacheError::new(ErrorKind::ProviderError, "slow failure"))
            })
        });
        let opts = GetOrComputeOptions {
            max_retries: Some(5),
            base_delay: Some(Duration::from_millis(50)),
            timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        let err = engine.get_or_compute(CacheKey::new("k").unwrap(), fetcher, opts).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}

//! Memory storage engine (C5): LRU-bounded, TTL-aware, optionally
//! compressed in-process storage. The sole unbounded-growth risk in the
//! crate; capped by `max_size` and `max_items`.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::{Clock, SharedClock};
use crate::compression::{Compressor, IdentityCompressor};
use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::events::{CacheEvent, EventBus, EventKind};
use crate::health::HealthStatus;
use crate::metadata::CacheKey;
use crate::provider::traits::{ProviderStats, StorageProvider, WriteOptions};

const DEFAULT_MAX_SIZE: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_ITEMS: usize = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const OVERSIZE_FALLBACK: u64 = 1024;

/// Configuration for a [`MemoryProvider`].
#[derive(Clone)]
pub struct MemoryProviderConfig {
    pub max_size: u64,
    pub max_items: usize,
    pub default_ttl: Option<Duration>,
    pub update_age_on_get: bool,
    pub compressor: Arc<dyn Compressor>,
    pub compression_enabled: bool,
    pub compression_threshold: usize,
}

impl Default for MemoryProviderConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_items: DEFAULT_MAX_ITEMS,
            default_ttl: Some(DEFAULT_TTL),
            update_age_on_get: true,
            compressor: Arc::new(IdentityCompressor),
            compression_enabled: false,
            compression_threshold: 1024,
        }
    }
}

enum Payload<V> {
    Raw(V),
    Compressed { data: Vec<u8>, algorithm: &'static str },
}

struct StoredEntry<V> {
    payload: Payload<V>,
    compressed: bool,
    size: u64,
    last_accessed: u64,
    expires_at: Option<u64>,
}

/// LRU-bounded in-memory provider. Entries are evicted (smallest
/// `last_accessed` first) whenever an insert would push the store past
/// `max_items` or `max_size`.
pub struct MemoryProvider<V> {
    name: String,
    store: Mutex<LruCache<CacheKey, StoredEntry<V>>>,
    total_size: Mutex<u64>,
    config: MemoryProviderConfig,
    clock: SharedClock,
    events: Option<Arc<EventBus>>,
}

impl<V> MemoryProvider<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Build a provider named `name` with the given config and clock.
    #[must_use]
    pub fn new(name: impl Into<String>, config: MemoryProviderConfig, clock: SharedClock) -> Self {
        // lru::LruCache requires a capacity hint; the real cap is enforced
        // by `evict_if_needed` against `config.max_items`, so this is just
        // an allocation hint, not the authoritative bound.
        let capacity = NonZeroUsize::new(config.max_items.max(1)).unwrap();
        Self {
            name: name.into(),
            store: Mutex::new(LruCache::new(capacity)),
            total_size: Mutex::new(0),
            config,
            clock,
            events: None,
        }
    }

    /// Attach an event bus so eviction/expiry emit `EventKind::Expire`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn estimate_size(value: &V) -> u64 {
        serde_json::to_vec(value).map(|v| v.len() as u64).unwrap_or(OVERSIZE_FALLBACK)
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    /// Evict in LRU order until both the item-count and byte-size bounds
    /// hold for one additional `incoming_size` bytes. Caller must hold
    /// `store`'s lock.
    fn evict_if_needed(
        &self,
        store: &mut LruCache<CacheKey, StoredEntry<V>>,
        total_size: &mut u64,
        incoming_size: u64,
    ) {
        while store.len() >= self.config.max_items
            || *total_size + incoming_size > self.config.max_size
        {
            let Some((key, entry)) = store.pop_lru() else { break };
            *total_size = total_size.saturating_sub(entry.size);
            self.emit(
                CacheEvent::new(EventKind::Expire, self.now())
                    .with_key(key)
                    .with_reason("lru"),
            );
        }
    }

    fn is_expired(entry: &StoredEntry<V>, now: u64) -> bool {
        entry.expires_at.is_some_and(|exp| exp <= now)
    }

    fn decode(&self, entry: &StoredEntry<V>) -> CacheResult<V> {
        match &entry.payload {
            Payload::Raw(v) => Ok(v.clone()),
            Payload::Compressed { data, algorithm } => {
                match self.config.compressor.decompress(data, algorithm) {
                    Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                        CacheError::new(ErrorKind::DeserializationError, e.to_string())
                    }),
                    Err(_) => {
                        self.emit(CacheEvent::new(EventKind::Error, self.now()).with_reason(
                            "data_integrity_error",
                        ));
                        // Surfacing the raw bytes isn't meaningful for a
                        // typed `V`, so report the integrity failure
                        // directly rather than silently returning wrong
                        // data.
                        Err(CacheError::new(
                            ErrorKind::DataIntegrityError,
                            "failed to decompress entry",
                        ))
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<V> StorageProvider<V> for MemoryProvider<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        let now = self.now();
        let mut store = self.store.lock();
        let Some(entry) = store.peek(key) else {
            return Ok(None);
        };
        if Self::is_expired(entry, now) {
            if let Some(entry) = store.pop(key) {
                let mut total = self.total_size.lock();
                *total = total.saturating_sub(entry.size);
            }
            return Ok(None);
        }
        let value = self.decode(entry)?;
        if self.config.update_age_on_get {
            if let Some(entry) = store.get_mut(key) {
                entry.last_accessed = now;
            }
        }
        Ok(Some(value))
    }

    async fn set(&self, key: &CacheKey, value: V, opts: &WriteOptions) -> CacheResult<()> {
        let now = self.now();
        let ttl = opts.ttl.or(self.config.default_ttl);
        let expires_at = ttl.filter(|t| !t.is_zero()).map(|t| now + t.as_millis() as u64);

        let raw_size = Self::estimate_size(&value);
        let threshold = opts.compression_threshold.unwrap_or(self.config.compression_threshold);
        let want_compression = opts.compression || self.config.compression_enabled;

        let (payload, size, compressed) = if want_compression && raw_size as usize > threshold {
            let bytes = serde_json::to_vec(&value)
                .map_err(|e| CacheError::new(ErrorKind::SerializationError, e.to_string()))?;
            match self.config.compressor.compress(&bytes) {
                Ok(blob) => {
                    let len = blob.data.len() as u64;
                    (
                        Payload::Compressed { data: blob.data, algorithm: blob.algorithm },
                        len,
                        true,
                    )
                }
                Err(_) => (Payload::Raw(value), raw_size, false),
            }
        } else {
            (Payload::Raw(value), raw_size, false)
        };

        if size > self.config.max_size {
            return Err(CacheError::new(
                ErrorKind::InvalidValue,
                format!("entry size {size} exceeds max_size {}", self.config.max_size),
            ));
        }

        let mut store = self.store.lock();
        let mut total = self.total_size.lock();
        if let Some(old) = store.peek(key) {
            *total = total.saturating_sub(old.size);
        }
        self.evict_if_needed(&mut store, &mut total, size);
        store.put(
            key.clone(),
            StoredEntry { payload, compressed, size, last_accessed: now, expires_at },
        );
        *total += size;
        Ok(())
    }

    async fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        let now = self.now();
        let mut store = self.store.lock();
        match store.peek(key) {
            Some(entry) if Self::is_expired(entry, now) => {
                if let Some(entry) = store.pop(key) {
                    let mut total = self.total_size.lock();
                    *total = total.saturating_sub(entry.size);
                }
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        let mut store = self.store.lock();
        match store.pop(key) {
            Some(entry) => {
                let mut total = self.total_size.lock();
                *total = total.saturating_sub(entry.size);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> CacheResult<()> {
        self.store.lock().clear();
        *self.total_size.lock() = 0;
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> CacheResult<Vec<CacheKey>> {
        let store = self.store.lock();
        Ok(store
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| pattern.map_or(true, |p| k.as_str().starts_with(p)))
            .collect())
    }

    async fn get_stats(&self) -> CacheResult<ProviderStats> {
        let store = self.store.lock();
        Ok(ProviderStats {
            hits: 0,
            misses: 0,
            key_count: store.len() as u64,
            memory_usage: *self.total_size.lock(),
        })
    }

    async fn health_check(&self) -> CacheResult<HealthStatus> {
        Ok(HealthStatus::from_error_count(0, None, self.now()))
    }
}

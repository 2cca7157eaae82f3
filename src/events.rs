//! Event spine (C1): a typed, synchronous fan-out to subscribers.
//!
//! Modeled as a registry owned by the [`CacheManager`](crate::facade::CacheManager)
//! instance rather than a mutable global — a process-wide default is easy
//! to build on top (just construct one `EventBus` and share the `Arc`) but
//! nothing in this crate reaches for global mutable state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::metadata::CacheKey;

/// The fixed enumeration of event kinds the spine can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    GetHit,
    GetMiss,
    GetStale,
    Set,
    Delete,
    Clear,
    Invalidate,
    Expire,
    ComputeStart,
    ComputeSuccess,
    ComputeError,
    RefreshStart,
    RefreshSuccess,
    RefreshError,
    ProviderInitialized,
    ProviderRemoved,
    ProviderError,
    MetadataUpdate,
    MetadataDelete,
    MetadataClear,
    StatsUpdate,
    Error,
}

/// Payload carried by every emitted event. Fields not relevant to a given
/// `kind` are left `None`/default.
#[derive(Debug, Clone, Default)]
pub struct CacheEvent {
    pub kind: Option<EventKind>,
    pub timestamp_millis: u64,
    pub key: Option<CacheKey>,
    pub provider: Option<String>,
    pub error: Option<String>,
    pub size: Option<u64>,
    pub duration_millis: Option<u64>,
    pub batch_size: Option<usize>,
    pub entries_removed: Option<u64>,
    pub tag: Option<String>,
    pub reason: Option<&'static str>,
}

impl CacheEvent {
    /// A bare event carrying only its kind and timestamp.
    #[must_use]
    pub fn new(kind: EventKind, timestamp_millis: u64) -> Self {
        Self {
            kind: Some(kind),
            timestamp_millis,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: CacheKey) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_entries_removed(mut self, count: u64) -> Self {
        self.entries_removed = Some(count);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

type Subscriber = Box<dyn Fn(&CacheEvent) + Send + Sync>;

/// A callback registry keyed by event kind plus a wildcard list.
///
/// Emission is synchronous and never panics outward: a subscriber that
/// unwinds is caught and logged via `tracing`, never propagated to the
/// emitter.
#[derive(Default)]
pub struct EventBus {
    by_kind: RwLock<std::collections::HashMap<EventKind, Vec<Subscriber>>>,
    wildcard: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    /// Construct an empty event bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to a single event kind.
    pub fn subscribe(&self, kind: EventKind, callback: impl Fn(&CacheEvent) + Send + Sync + 'static) {
        self.by_kind.write().entry(kind).or_default().push(Box::new(callback));
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all(&self, callback: impl Fn(&CacheEvent) + Send + Sync + 'static) {
        self.wildcard.write().push(Box::new(callback));
    }

    /// Fan the event out to matching-kind subscribers and wildcard
    /// subscribers. Never panics: a subscriber panic is caught and logged.
    pub fn emit(&self, event: CacheEvent) {
        let Some(kind) = event.kind else { return };

        if let Some(subs) = self.by_kind.read().get(&kind) {
            for sub in subs {
                Self::call_guarded(sub, &event);
            }
        }
        for sub in self.wildcard.read().iter() {
            Self::call_guarded(sub, &event);
        }
    }

    fn call_guarded(sub: &Subscriber, event: &CacheEvent) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| sub(event))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::warn!(kind = ?event.kind, %message, "event subscriber panicked");
        }
    }
}

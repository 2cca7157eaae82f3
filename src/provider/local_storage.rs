//! Local (browser-shaped) storage adapter (C6): bridges a synchronous
//! string-keyed byte store — the shape `window.localStorage` exposes — into
//! the async [`StorageProvider`] contract. The concrete browser primitive is
//! out of scope for this crate; this module supplies the adapter plus a
//! `Mutex`-guarded in-memory fake for tests.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::health::HealthStatus;
use crate::metadata::CacheKey;
use crate::provider::traits::{ProviderStats, StorageProvider, WriteOptions};

/// A synchronous string-keyed byte store. Implementations are expected to
/// be cheap and non-blocking in practice (an in-process map or a thin FFI
/// call), matching what `localStorage` actually is.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>);
    fn remove(&self, key: &str) -> bool;
    fn contains(&self, key: &str) -> bool;
    fn clear(&self);
    fn keys(&self) -> Vec<String>;
}

/// An in-memory [`KeyValueStore`], standing in for the real browser
/// primitive in tests and non-browser embeddings.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).cloned()
    }
    fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().unwrap().insert(key.to_string(), value);
    }
    fn remove(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }
    fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }
    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
    fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

/// Adapts a [`KeyValueStore`] into a [`StorageProvider<V>`].
pub struct LocalStorageProvider<S> {
    name: String,
    store: S,
}

impl<S: KeyValueStore> LocalStorageProvider<S> {
    pub fn new(name: impl Into<String>, store: S) -> Self {
        Self { name: name.into(), store }
    }
}

#[async_trait]
impl<S, V> StorageProvider<V> for LocalStorageProvider<S>
where
    S: KeyValueStore,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        let Some(bytes) = self.store.get(key.as_str()) else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::new(ErrorKind::DeserializationError, e.to_string()))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &CacheKey, value: V, _opts: &WriteOptions) -> CacheResult<()> {
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| CacheError::new(ErrorKind::SerializationError, e.to_string()))?;
        self.store.set(key.as_str(), bytes);
        Ok(())
    }

    async fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.store.contains(key.as_str()))
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.store.remove(key.as_str()))
    }

    async fn clear(&self) -> CacheResult<()> {
        self.store.clear();
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> CacheResult<Vec<CacheKey>> {
        self.store
            .keys()
            .into_iter()
            .filter(|k| pattern.map_or(true, |p| k.starts_with(p)))
            .map(CacheKey::new)
            .collect()
    }

    async fn get_stats(&self) -> CacheResult<ProviderStats> {
        Ok(ProviderStats { key_count: self.store.keys().len() as u64, ..Default::default() })
    }

    async fn health_check(&self) -> CacheResult<HealthStatus> {
        Ok(HealthStatus::from_error_count(0, None, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let provider = LocalStorageProvider::new("local", InMemoryKeyValueStore::default());
        let key = CacheKey::new("k").unwrap();
        provider.set(&key, "value".to_string(), &WriteOptions::default()).await.unwrap();
        assert_eq!(provider.get(&key).await.unwrap(), Some("value".to_string()));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let provider = LocalStorageProvider::new("local", InMemoryKeyValueStore::default());
        let key = CacheKey::new("k").unwrap();
        provider.set(&key, 1i32, &WriteOptions::default()).await.unwrap();
        assert!(StorageProvider::<i32>::delete(&provider, &key).await.unwrap());
        assert!(!StorageProvider::<i32>::delete(&provider, &key).await.unwrap());
    }
}

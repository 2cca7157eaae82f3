//! Remote-store adapter (C6): bridges an application-supplied async
//! key/value client into the [`StorageProvider`] contract. The concrete
//! client (Redis, a managed KV service, ...) is deliberately out of scope
//! here — this module only supplies the adapter and a `serde`-based byte
//! boundary.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::health::HealthStatus;
use crate::metadata::CacheKey;
use crate::provider::traits::{ProviderStats, StorageProvider, WriteOptions};

/// The byte-level contract an application's real remote-store client must
/// satisfy to be wrapped by [`RemoteProvider`]. Implementations own
/// connection pooling, retries at the transport level, and serialization
/// of errors into [`CacheError`].
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl_seconds: Option<u64>) -> CacheResult<()>;
    async fn delete(&self, key: &str) -> CacheResult<bool>;
    async fn exists(&self, key: &str) -> CacheResult<bool>;
    async fn clear(&self) -> CacheResult<()>;
    async fn keys(&self, pattern: Option<&str>) -> CacheResult<Vec<String>>;
    async fn stats(&self) -> CacheResult<ProviderStats>;
    async fn ping(&self) -> CacheResult<HealthStatus>;
}

/// Adapts a [`RemoteClient`] into a [`StorageProvider<V>`] by serializing
/// values to/from JSON at the boundary; the rest of the core never touches
/// bytes directly.
pub struct RemoteProvider<C> {
    name: String,
    client: C,
}

impl<C: RemoteClient> RemoteProvider<C> {
    pub fn new(name: impl Into<String>, client: C) -> Self {
        Self { name: name.into(), client }
    }
}

#[async_trait]
impl<C, V> StorageProvider<V> for RemoteProvider<C>
where
    C: RemoteClient,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        let Some(bytes) = self.client.get_bytes(key.as_str()).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::new(ErrorKind::DeserializationError, e.to_string()))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &CacheKey, value: V, opts: &WriteOptions) -> CacheResult<()> {
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| CacheError::new(ErrorKind::SerializationError, e.to_string()))?;
        self.client
            .set_bytes(key.as_str(), bytes, opts.ttl.map(|t| t.as_secs()))
            .await
    }

    async fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        self.client.exists(key.as_str()).await
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        self.client.delete(key.as_str()).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.client.clear().await
    }

    async fn keys(&self, pattern: Option<&str>) -> CacheResult<Vec<CacheKey>> {
        let raw = self.client.keys(pattern).await?;
        raw.into_iter().map(CacheKey::new).collect()
    }

    async fn get_stats(&self) -> CacheResult<ProviderStats> {
        self.client.stats().await
    }

    async fn health_check(&self) -> CacheResult<HealthStatus> {
        self.client.ping().await
    }
}

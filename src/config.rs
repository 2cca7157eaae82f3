//! Public configuration surface for a [`crate::facade::CacheManager`],
//! assembled with a builder in the style of a resource crate's
//! pool/resource configs.

use std::sync::Arc;
use std::time::Duration;

use crate::provider::traits::StorageProvider;

/// A provider registration supplied at configuration time.
pub struct ProviderSpec<V> {
    pub instance: Arc<dyn StorageProvider<V>>,
    pub priority: i64,
}

impl<V> ProviderSpec<V> {
    #[must_use]
    pub fn new(instance: Arc<dyn StorageProvider<V>>, priority: i64) -> Self {
        Self { instance, priority }
    }
}

/// Top-level configuration for a [`crate::facade::CacheManager`].
///
/// Per-provider concerns like capacity bounds and compression belong to the
/// provider's own config (e.g. [`crate::provider::memory::MemoryProviderConfig`])
/// since the manager never constructs providers itself — callers register
/// already-built instances via [`CacheManagerConfigBuilder::provider`].
pub struct CacheManagerConfig<V> {
    pub default_ttl: Option<Duration>,
    pub refresh_threshold: f64,
    pub background_refresh: bool,
    pub deduplicate_requests: bool,
    pub throw_on_errors: bool,
    pub stats_interval: Option<Duration>,
    pub providers: Vec<ProviderSpec<V>>,
}

impl<V> Default for CacheManagerConfig<V> {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(3600)),
            refresh_threshold: crate::compute::DEFAULT_REFRESH_THRESHOLD,
            background_refresh: false,
            deduplicate_requests: true,
            throw_on_errors: true,
            stats_interval: None,
            providers: Vec::new(),
        }
    }
}

/// Builder for [`CacheManagerConfig`].
pub struct CacheManagerConfigBuilder<V> {
    config: CacheManagerConfig<V>,
}

impl<V> CacheManagerConfigBuilder<V> {
    #[must_use]
    pub fn new() -> Self {
        Self { config: CacheManagerConfig::default() }
    }

    #[must_use]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn refresh_threshold(mut self, threshold: f64) -> Self {
        self.config.refresh_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn background_refresh(mut self, enabled: bool) -> Self {
        self.config.background_refresh = enabled;
        self
    }

    #[must_use]
    pub fn deduplicate_requests(mut self, enabled: bool) -> Self {
        self.config.deduplicate_requests = enabled;
        self
    }

    #[must_use]
    pub fn throw_on_errors(mut self, enabled: bool) -> Self {
        self.config.throw_on_errors = enabled;
        self
    }

    #[must_use]
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn provider(mut self, instance: Arc<dyn StorageProvider<V>>, priority: i64) -> Self {
        self.config.providers.push(ProviderSpec::new(instance, priority));
        self
    }

    #[must_use]
    pub fn build(self) -> CacheManagerConfig<V> {
        self.config
    }
}

impl<V> Default for CacheManagerConfigBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_threshold_is_clamped() {
        let config: CacheManagerConfig<i32> = CacheManagerConfigBuilder::new().refresh_threshold(5.0).build();
        assert_eq!(config.refresh_threshold, 1.0);
    }

    #[test]
    fn defaults_are_conservative() {
        let config: CacheManagerConfig<i32> = CacheManagerConfig::default();
        assert!(config.throw_on_errors);
        assert!(!config.background_refresh);
        assert!(config.deduplicate_requests);
    }
}

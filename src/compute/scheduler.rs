//! Background refresh scheduler: a single `tokio::time::interval` task that
//! ticks roughly once a second over [`ComputeEngine`]'s refresh-task map.
//! Per-key timers or a delay-queue worker would serve equally well; the
//! only contract is firing within one tick of due time and never letting
//! an individual task's error halt the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::ComputeEngine;

/// Default interval between scheduler ticks.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Spawn the background refresh loop. Dropping the returned handle does not
/// stop the task; abort it explicitly (e.g. via `handle.abort()`) to stop.
pub fn spawn_scheduler<V>(engine: Arc<ComputeEngine<V>>, tick: Duration) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            engine.run_due_refreshes().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SharedClock, VirtualClock};
    use crate::compute::{ComputeEngineConfig, Fetcher, GetOrComputeOptions};
    use crate::metadata::{CacheKey, MetadataIndex};
    use crate::provider::manager::ProviderManager;
    use crate::provider::memory::{MemoryProvider, MemoryProviderConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn scheduler_eventually_refreshes_a_due_task() {
        let clock: SharedClock = Arc::new(VirtualClock::new(0));
        let providers = Arc::new(ProviderManager::new(clock.clone()));
        providers.register(
            Arc::new(MemoryProvider::<i32>::new("memory", MemoryProviderConfig::default(), clock.clone())),
            0,
        );
        let metadata = Arc::new(MetadataIndex::new(clock.clone()));
        let engine = ComputeEngine::new(
            providers,
            metadata,
            clock,
            ComputeEngineConfig { refresh_threshold: 0.0, background_refresh: true, ..Default::default() },
            None,
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let fetcher: Fetcher<i32> = Arc::new(move || {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(n as i32) })
        });
        engine
            .get_or_compute(
                CacheKey::new("k").unwrap(),
                fetcher,
                GetOrComputeOptions { ttl: Some(Duration::from_secs(1)), background_refresh: Some(true), ..Default::default() },
            )
            .await
            .unwrap();

        let handle = spawn_scheduler(engine.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}

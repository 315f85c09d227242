//! In-process window store.
//!
//! Used when no shared store is configured, and as the degraded-mode target
//! while the shared store is unreachable. Limits enforced here are per
//! process only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::Clock;
use super::key::LimitKey;
use super::store::WindowStore;
use super::window::{Window, WindowSample};
use crate::error::Result;

/// Window store held in process memory.
///
/// Each operation runs while holding the map's write guard for the key's
/// shard, which serializes every call on the same key.
#[derive(Debug, Default)]
pub struct LocalWindowStore {
    windows: DashMap<LimitKey, Window>,
}

impl LocalWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_window<R>(&self, key: &LimitKey, f: impl FnOnce(&mut Window) -> R) -> R {
        let mut window = self.windows.entry(key.clone()).or_default();
        f(window.value_mut())
    }

    /// Drop windows whose idle expiry has passed or that hold no entries.
    ///
    /// Returns the number of keys removed.
    pub fn sweep_idle(&self, now: f64) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, window| !window.is_empty() && !window.is_expired(now));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.windows.len(), "Swept idle windows");
        }
        removed
    }

    /// Run `sweep_idle` every `interval` on the current tokio runtime.
    ///
    /// The sweep only reclaims memory; correctness of the counts never
    /// depends on it. Abort the returned handle to stop it.
    pub fn spawn_sweeper(self: &Arc<Self>, clock: Arc<dyn Clock>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep_idle(clock.now());
            }
        })
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Forget every window.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

#[async_trait]
impl WindowStore for LocalWindowStore {
    async fn record_and_count(&self, key: &LimitKey, now: f64, period: Duration) -> Result<WindowSample> {
        let sample = self.with_window(key, |w| w.record_and_count(now, period));
        trace!(key = %key, count = sample.count, "Recorded attempt in local window");
        Ok(sample)
    }

    async fn record_if_below(
        &self,
        key: &LimitKey,
        now: f64,
        period: Duration,
        limit: u64,
    ) -> Result<WindowSample> {
        let sample = self.with_window(key, |w| w.record_if_below(now, period, limit));
        trace!(
            key = %key,
            count = sample.count,
            recorded = sample.recorded,
            "Conditionally recorded attempt in local window"
        );
        Ok(sample)
    }

    async fn drop_key(&self, key: &LimitKey) -> Result<()> {
        self.windows.remove(key);
        Ok(())
    }

    async fn size(&self, key: &LimitKey) -> Result<u64> {
        Ok(self.windows.get(key).map(|w| w.len() as u64).unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::IdentifierResolver;

    const MINUTE: Duration = Duration::from_secs(60);

    fn key(subject: &str) -> LimitKey {
        IdentifierResolver::new().resolve("test", subject)
    }

    #[tokio::test]
    async fn test_record_and_count() {
        let store = LocalWindowStore::new();
        let k = key("a");

        for expected in 1..=3 {
            let sample = store.record_and_count(&k, 100.0, MINUTE).await.unwrap();
            assert_eq!(sample.count, expected);
        }
        assert_eq!(store.size(&k).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = LocalWindowStore::new();
        for _ in 0..5 {
            store.record_and_count(&key("a"), 100.0, MINUTE).await.unwrap();
        }
        let sample = store.record_and_count(&key("b"), 100.0, MINUTE).await.unwrap();
        assert_eq!(sample.count, 1);
        assert_eq!(store.key_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_key() {
        let store = LocalWindowStore::new();
        let k = key("a");
        store.record_and_count(&k, 100.0, MINUTE).await.unwrap();
        store.drop_key(&k).await.unwrap();
        assert_eq!(store.size(&k).await.unwrap(), 0);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_independent_instances() {
        let first = LocalWindowStore::new();
        let second = LocalWindowStore::new();
        first.record_and_count(&key("a"), 100.0, MINUTE).await.unwrap();
        assert_eq!(second.size(&key("a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_idle_removes_expired_windows() {
        let store = LocalWindowStore::new();
        store.record_and_count(&key("old"), 100.0, MINUTE).await.unwrap();
        store.record_and_count(&key("fresh"), 150.0, MINUTE).await.unwrap();

        assert_eq!(store.sweep_idle(159.0), 0);
        assert_eq!(store.sweep_idle(160.0), 1);
        assert_eq!(store.size(&key("fresh")).await.unwrap(), 1);
        assert_eq!(store.size(&key("old")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = LocalWindowStore::new();
        store.record_and_count(&key("a"), 100.0, MINUTE).await.unwrap();
        store.clear();
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_reclaims_idle_keys() {
        let store = Arc::new(LocalWindowStore::new());
        let clock = ManualClock::new(100.0);
        store.record_and_count(&key("a"), 100.0, MINUTE).await.unwrap();

        let handle = store.spawn_sweeper(Arc::new(clock.clone()), Duration::from_secs(1));
        clock.advance(Duration::from_secs(120));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(store.key_count(), 0);
        handle.abort();
    }
}

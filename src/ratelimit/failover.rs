//! Degraded-mode handling for an unreachable shared store.
//!
//! `FailoverStore` sends every call to the primary (shared) store. When the
//! primary reports a store failure, the call is answered by the in-process
//! fallback store instead, or the error is passed up for fail-closed
//! deployments. Transitions between healthy and degraded are logged once
//! each, never per call.
//!
//! After a failure the primary is left alone for a recovery interval, so a
//! degraded deployment does not pay the primary's timeout on every call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::key::LimitKey;
use super::local::LocalWindowStore;
use super::store::WindowStore;
use super::window::WindowSample;
use crate::error::{Result, WindowGateError};

/// What to do with a call while the shared store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Keep serving with per-process limits from the local store
    #[default]
    Local,
    /// Reject guarded calls until the shared store returns
    Deny,
}

/// A primary store with an in-process fallback.
pub struct FailoverStore {
    primary: Arc<dyn WindowStore>,
    fallback: Arc<LocalWindowStore>,
    mode: FallbackMode,
    degraded: AtomicBool,
    recovery_interval: Duration,
    /// Earliest instant the primary is tried again while degraded
    retry_at: Mutex<Option<Instant>>,
}

impl FailoverStore {
    /// Default pause before a degraded primary is tried again.
    pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(primary: Arc<dyn WindowStore>, fallback: Arc<LocalWindowStore>, mode: FallbackMode) -> Self {
        Self {
            primary,
            fallback,
            mode,
            degraded: AtomicBool::new(false),
            recovery_interval: Self::DEFAULT_RECOVERY_INTERVAL,
            retry_at: Mutex::new(None),
        }
    }

    /// Set how long the primary is skipped after a failure. Zero retries it
    /// on every call.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Whether the last primary call failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> FallbackMode {
        self.mode
    }

    /// The local store used while degraded.
    pub fn fallback(&self) -> &Arc<LocalWindowStore> {
        &self.fallback
    }

    /// Whether the primary is inside its post-failure pause.
    fn backing_off(&self) -> bool {
        matches!(*self.retry_at.lock(), Some(at) if Instant::now() < at)
    }

    fn mark_healthy(&self) {
        *self.retry_at.lock() = None;
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!(store = self.primary.name(), "Shared window store recovered");
        }
    }

    fn mark_degraded(&self, error: &WindowGateError) {
        *self.retry_at.lock() = Some(Instant::now() + self.recovery_interval);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                store = self.primary.name(),
                error = %error,
                fallback = ?self.mode,
                "Shared window store unavailable, degrading"
            );
        }
    }

    /// Run `op` against the primary, falling back on store failures.
    async fn route<T, P, L>(&self, primary: P, local: L) -> Result<T>
    where
        P: std::future::Future<Output = Result<T>>,
        L: std::future::Future<Output = Result<T>>,
    {
        if self.backing_off() {
            debug!(store = self.primary.name(), "Skipping degraded primary");
            return match self.mode {
                FallbackMode::Local => local.await,
                FallbackMode::Deny => Err(WindowGateError::StoreUnavailable(format!(
                    "{} store degraded, retry pending",
                    self.primary.name()
                ))),
            };
        }

        match primary.await {
            Ok(value) => {
                self.mark_healthy();
                Ok(value)
            }
            Err(e) if e.is_store_failure() => {
                self.mark_degraded(&e);
                match self.mode {
                    FallbackMode::Local => local.await,
                    FallbackMode::Deny => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl WindowStore for FailoverStore {
    async fn record_and_count(&self, key: &LimitKey, now: f64, period: Duration) -> Result<WindowSample> {
        self.route(
            self.primary.record_and_count(key, now, period),
            self.fallback.record_and_count(key, now, period),
        )
        .await
    }

    async fn record_if_below(
        &self,
        key: &LimitKey,
        now: f64,
        period: Duration,
        limit: u64,
    ) -> Result<WindowSample> {
        self.route(
            self.primary.record_if_below(key, now, period, limit),
            self.fallback.record_if_below(key, now, period, limit),
        )
        .await
    }

    async fn drop_key(&self, key: &LimitKey) -> Result<()> {
        // Both copies go, so a later outage does not resurrect stale attempts
        self.fallback.drop_key(key).await?;
        self.route(self.primary.drop_key(key), async { Ok(()) }).await
    }

    async fn size(&self, key: &LimitKey) -> Result<u64> {
        self.route(self.primary.size(key), self.fallback.size(key)).await
    }

    fn name(&self) -> &'static str {
        "failover"
    }
}

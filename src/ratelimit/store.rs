//! Window store trait for abstracting local and shared implementations.

use std::time::Duration;

use async_trait::async_trait;

use super::key::LimitKey;
use super::window::WindowSample;
use crate::error::Result;

/// Trait for window store implementations.
///
/// This trait abstracts over the in-process `LocalWindowStore`, the Redis
/// backed `SharedWindowStore` and the `FailoverStore` combining the two, so
/// the limiter works with any of them.
///
/// Each mutating call is one atomic unit per key: no concurrent call on the
/// same key observes a prune without its matching add, or a count taken
/// before the add lands.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Record an attempt at `now`, drop entries older than `now - period`,
    /// count what remains, and refresh the key's idle expiry.
    async fn record_and_count(&self, key: &LimitKey, now: f64, period: Duration)
        -> Result<WindowSample>;

    /// Like `record_and_count`, but the attempt is only recorded when fewer
    /// than `limit` entries remain after pruning.
    async fn record_if_below(
        &self,
        key: &LimitKey,
        now: f64,
        period: Duration,
        limit: u64,
    ) -> Result<WindowSample>;

    /// Delete the window for `key`.
    async fn drop_key(&self, key: &LimitKey) -> Result<()>;

    /// Number of entries held for `key`, without pruning.
    async fn size(&self, key: &LimitKey) -> Result<u64>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

//! Wall-clock sources for window accounting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

/// Supplies the current time as fractional seconds since the Unix epoch.
///
/// Shared stores compare timestamps written by different processes, so this
/// must be wall-clock time rather than a process-local `Instant`.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// System clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock frozen at `start` epoch seconds.
    pub fn new(start: f64) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by.as_secs_f64();
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: f64) {
        *self.current.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.current.lock()
    }
}

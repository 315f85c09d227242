//! Sliding-window log implementation.
//!
//! A [`Window`] is the list of attempt timestamps recorded for one limit key.
//! Every access first records (or conditionally records) the new attempt and
//! prunes entries older than the trailing period, so a count read from a
//! window never includes stale attempts. Physical deletion of idle windows is
//! left to the owning store through the per-window expiry deadline.

use std::collections::VecDeque;
use std::time::Duration;

/// Result of a single atomic window operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    /// Entries inside the trailing period after the operation
    pub count: u64,
    /// Timestamp of the oldest live entry, when the store can report it
    pub oldest: Option<f64>,
    /// Whether this operation added an entry
    pub recorded: bool,
}

impl WindowSample {
    /// Seconds until the oldest live entry leaves the window.
    ///
    /// Pruning keeps entries exactly one period old, so at `now +
    /// retry_after` the oldest entry still counts; it is gone at any later
    /// instant. Falls back to the full period when the oldest entry is
    /// unknown.
    pub fn retry_after(&self, now: f64, period: Duration) -> f64 {
        let period = period.as_secs_f64();
        match self.oldest {
            Some(oldest) => (oldest + period - now).clamp(0.0, period),
            None => period,
        }
    }
}

/// Idle-expiry applied to a key on every write, in whole seconds.
pub fn ttl_seconds(period: Duration) -> u64 {
    period.as_secs_f64().ceil().max(1.0) as u64
}

/// Timestamps recorded for one key, kept in ascending order.
#[derive(Debug, Clone, Default)]
pub struct Window {
    entries: VecDeque<f64>,
    expires_at: f64,
}

impl Window {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt at `now`, prune, and count.
    pub fn record_and_count(&mut self, now: f64, period: Duration) -> WindowSample {
        self.insert(now);
        self.prune(now - period.as_secs_f64());
        self.touch(now, period);
        self.sample(true)
    }

    /// Prune, then record an attempt at `now` only if the window holds fewer
    /// than `limit` entries.
    pub fn record_if_below(&mut self, now: f64, period: Duration, limit: u64) -> WindowSample {
        self.prune(now - period.as_secs_f64());
        let recorded = (self.entries.len() as u64) < limit;
        if recorded {
            self.insert(now);
        }
        self.touch(now, period);
        self.sample(recorded)
    }

    /// Remove every entry strictly older than `cutoff`.
    pub fn prune(&mut self, cutoff: f64) {
        while self.entries.front().is_some_and(|&t| t < cutoff) {
            self.entries.pop_front();
        }
    }

    /// Number of entries currently held, without pruning.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the idle-expiry deadline has passed.
    pub fn is_expired(&self, now: f64) -> bool {
        now >= self.expires_at
    }

    pub fn oldest(&self) -> Option<f64> {
        self.entries.front().copied()
    }

    // A clock stepping backwards must not break the ordering prune relies on.
    fn insert(&mut self, at: f64) {
        let idx = self.entries.partition_point(|&t| t <= at);
        self.entries.insert(idx, at);
    }

    fn touch(&mut self, now: f64, period: Duration) {
        let deadline = now + ttl_seconds(period) as f64;
        if deadline > self.expires_at {
            self.expires_at = deadline;
        }
    }

    fn sample(&self, recorded: bool) -> WindowSample {
        WindowSample {
            count: self.entries.len() as u64,
            oldest: self.oldest(),
            recorded,
        }
    }
}

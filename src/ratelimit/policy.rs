//! Admission policies attached to guarded operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WindowGateError};

/// Whether a policy limits each caller or all callers together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// One window per resolved subject
    #[default]
    Subject,
    /// One window shared by every caller
    Global,
}

/// How an attempt is accounted against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counting {
    /// Record first, then compare the count with the limit.
    ///
    /// Denied attempts keep a slot in the window, so sustained traffic over
    /// the limit can hold the lockout slightly past one period.
    #[default]
    WriteThenCheck,
    /// Compare first and record only admitted attempts.
    Strict,
}

/// An immutable limit: at most `max_requests` per trailing `period`.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionPolicy {
    scope: String,
    max_requests: u64,
    period: Duration,
    kind: ScopeKind,
    counting: Counting,
}

impl AdmissionPolicy {
    /// Create a per-subject policy.
    ///
    /// Fails with `InvalidPolicy` when `max_requests` or `period` is zero.
    pub fn new(scope: impl Into<String>, max_requests: u64, period: Duration) -> Result<Self> {
        let scope = scope.into();
        if max_requests == 0 {
            return Err(WindowGateError::InvalidPolicy(format!(
                "max_requests must be positive for scope '{}'",
                scope
            )));
        }
        if period.is_zero() {
            return Err(WindowGateError::InvalidPolicy(format!(
                "period must be positive for scope '{}'",
                scope
            )));
        }

        Ok(Self {
            scope,
            max_requests,
            period,
            kind: ScopeKind::Subject,
            counting: Counting::WriteThenCheck,
        })
    }

    /// Create a policy shared by all callers.
    pub fn global(scope: impl Into<String>, max_requests: u64, period: Duration) -> Result<Self> {
        Ok(Self::new(scope, max_requests, period)?.with_kind(ScopeKind::Global))
    }

    /// Build a policy from a period given in (possibly fractional) seconds.
    pub fn from_secs_f64(scope: impl Into<String>, max_requests: u64, period_seconds: f64) -> Result<Self> {
        let scope = scope.into();
        if !period_seconds.is_finite() || period_seconds <= 0.0 {
            return Err(WindowGateError::InvalidPolicy(format!(
                "period_seconds must be positive for scope '{}', got {}",
                scope, period_seconds
            )));
        }
        let period = Duration::try_from_secs_f64(period_seconds).map_err(|e| {
            WindowGateError::InvalidPolicy(format!(
                "period_seconds out of range for scope '{}': {}",
                scope, e
            ))
        })?;
        Self::new(scope, max_requests, period)
    }

    pub fn with_kind(mut self, kind: ScopeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_counting(mut self, counting: Counting) -> Self {
        self.counting = counting;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Name of the window this policy counts in.
    ///
    /// The scope is qualified by the limit itself, so a route stacking
    /// several limits keeps one independent window per limit.
    pub fn window_scope(&self) -> String {
        format!("{}#{}/{}us", self.scope, self.max_requests, self.period.as_micros())
    }

    /// Whether two policies would count in the same window.
    pub fn same_window(&self, other: &AdmissionPolicy) -> bool {
        self.kind == other.kind
            && self.max_requests == other.max_requests
            && self.period == other.period
            && self.scope == other.scope
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn period_secs(&self) -> f64 {
        self.period.as_secs_f64()
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn is_global(&self) -> bool {
        self.kind == ScopeKind::Global
    }

    pub fn counting(&self) -> Counting {
        self.counting
    }
}

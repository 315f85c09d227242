//! Per-route admission guard.
//!
//! A [`RouteGuard`] is built once per route with that route's policies and
//! is called explicitly at the top of the handler. There is no global
//! registration: the policies a handler runs under are whatever its guard
//! was given.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use super::key::Subject;
use super::limiter::{Decision, RateLimiter};
use super::policy::AdmissionPolicy;
use super::rules::RouteTable;
use crate::error::{Result, WindowGateError};

/// A refused call, ready for the API layer to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub route: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
}

impl Rejection {
    /// HTTP status the API layer should answer with.
    pub const STATUS: u16 = 429;

    fn from_decision(route: &str, decision: &Decision) -> Self {
        let global = decision
            .verdicts
            .iter()
            .any(|v| v.global && !v.verdict.allowed);
        let message = if global {
            "Global rate limit exceeded. Try again later."
        } else {
            "Rate limit exceeded. Try again later."
        };
        Self {
            route: route.to_string(),
            message: message.to_string(),
            retry_after_seconds: decision.retry_after_seconds,
        }
    }

    /// Value for a `Retry-After` header: the first whole second at which
    /// the oldest blocking attempt has left the window.
    pub fn retry_after_header(&self) -> Option<String> {
        self.retry_after_seconds
            .map(|secs| format!("{}", secs.max(0.0).floor() as u64 + 1))
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.route)
    }
}

impl std::error::Error for Rejection {}

/// Guards one route with a fixed set of policies.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    route: String,
    policies: Arc<[AdmissionPolicy]>,
    limiter: RateLimiter,
}

impl RouteGuard {
    pub fn new(route: impl Into<String>, policies: Vec<AdmissionPolicy>, limiter: RateLimiter) -> Self {
        Self {
            route: route.into(),
            policies: policies.into(),
            limiter,
        }
    }

    /// Build the guard for `route` from a loaded route table.
    pub fn from_table(table: &RouteTable, route: &str, limiter: RateLimiter) -> Result<Self> {
        let policies = table
            .policies(route)
            .ok_or_else(|| WindowGateError::Config(format!("no rules for route '{}'", route)))?;
        Ok(Self::new(route, policies.to_vec(), limiter))
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn policies(&self) -> &[AdmissionPolicy] {
        &self.policies
    }

    /// Evaluate every policy of the route for `subject`.
    #[instrument(skip(self, subject), fields(route = %self.route))]
    pub async fn admit(&self, subject: &Subject) -> Decision {
        let decision = self.limiter.check_all(&self.policies, &subject.render()).await;
        if !decision.allowed {
            debug!(route = %self.route, "Call rejected");
        }
        decision
    }

    /// Run `op` only if `subject` is admitted.
    pub async fn call<F, Fut, T>(&self, subject: &Subject, op: F) -> std::result::Result<T, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let decision = self.admit(subject).await;
        if decision.allowed {
            Ok(op().await)
        } else {
            Err(Rejection::from_decision(&self.route, &decision))
        }
    }
}

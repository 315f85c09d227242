//! Route rules configuration.
//!
//! This module loads the table of guarded routes and the limits attached to
//! each of them. Every limit is turned into an [`AdmissionPolicy`] when the
//! table is loaded, so a bad limit stops startup instead of surfacing on a
//! live call.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::policy::{AdmissionPolicy, Counting, ScopeKind};
use crate::error::{Result, WindowGateError};

/// Raw route table as written in YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Limits for a single guarded route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route name; also the scope of every limit on the route
    pub route: String,
    #[serde(default)]
    pub limits: Vec<LimitRule>,
}

/// One limit as written in configuration.
///
/// Exactly one of `period_seconds` and `unit` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Admissions allowed per period
    pub max_requests: u64,
    /// Period length in seconds (fractions allowed)
    #[serde(default)]
    pub period_seconds: Option<f64>,
    /// Period as a whole time unit
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub scope: ScopeKind,
    #[serde(default)]
    pub counting: Counting,
}

/// Time unit for limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

impl LimitRule {
    /// Convert to a validated policy scoped to `route`.
    pub fn to_policy(&self, route: &str) -> Result<AdmissionPolicy> {
        let policy = match (self.period_seconds, self.unit) {
            (Some(secs), None) => AdmissionPolicy::from_secs_f64(route, self.max_requests, secs)?,
            (None, Some(unit)) => AdmissionPolicy::new(route, self.max_requests, unit.duration())?,
            (Some(_), Some(_)) => {
                return Err(WindowGateError::InvalidPolicy(format!(
                    "route '{}': give either period_seconds or unit, not both",
                    route
                )))
            }
            (None, None) => {
                return Err(WindowGateError::InvalidPolicy(format!(
                    "route '{}': a limit needs period_seconds or unit",
                    route
                )))
            }
        };
        Ok(policy.with_kind(self.scope).with_counting(self.counting))
    }
}

/// Validated route table: route name to its policies.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Vec<AdmissionPolicy>>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RulesConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WindowGateError::Config(format!("Failed to parse route rules: {}", e)))?;
        Self::from_config(&config)
    }

    /// Validate a parsed route table.
    pub fn from_config(config: &RulesConfig) -> Result<Self> {
        let mut table = Self::new();
        for route in &config.routes {
            if route.route.is_empty() {
                return Err(WindowGateError::Config("route name must not be empty".to_string()));
            }
            if route.limits.is_empty() {
                return Err(WindowGateError::Config(format!(
                    "route '{}' has no limits",
                    route.route
                )));
            }

            let policies = route
                .limits
                .iter()
                .map(|rule| rule.to_policy(&route.route))
                .collect::<Result<Vec<_>>>()?;
            for (i, policy) in policies.iter().enumerate() {
                if policies[..i].iter().any(|earlier| earlier.same_window(policy)) {
                    return Err(WindowGateError::Config(format!(
                        "route '{}' repeats the limit {} per {}s",
                        route.route,
                        policy.max_requests(),
                        policy.period_secs()
                    )));
                }
            }
            table.insert(&route.route, policies)?;
        }
        Ok(table)
    }

    /// Add a route. Fails if the route already exists.
    pub fn insert(&mut self, route: &str, policies: Vec<AdmissionPolicy>) -> Result<()> {
        if self.routes.contains_key(route) {
            return Err(WindowGateError::Config(format!("duplicate route '{}'", route)));
        }
        self.routes.insert(route.to_string(), policies);
        Ok(())
    }

    /// Policies for `route`.
    pub fn policies(&self, route: &str) -> Option<&[AdmissionPolicy]> {
        self.routes.get(route).map(Vec::as_slice)
    }

    /// Route names, sorted.
    pub fn routes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

//! Configuration management for windowgate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WindowGateError};
use crate::ratelimit::{
    Clock, FailoverStore, FallbackMode, IdentifierResolver, LocalWindowStore, RateLimiter,
    RouteTable, SharedStoreConfig, SharedWindowStore, SystemClock, WindowStore,
};

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "WINDOWGATE";

/// Main configuration for windowgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiting: LimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which store backs the windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Per-process windows only
    #[default]
    Local,
    /// Windows shared through Redis
    Redis,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for keys written to the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for a single shared store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Behaviour while the shared store is unavailable
    #[serde(default)]
    pub fallback: FallbackMode,

    /// Pause before a failed shared store is tried again, in milliseconds
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            fallback: FallbackMode::default(),
            recovery_interval_ms: default_recovery_interval_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "windowgate:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_recovery_interval_ms() -> u64 {
    1000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitingConfig {
    /// Path to the route rules file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Hash limit keys before they reach the store
    #[serde(default = "default_hash_keys")]
    pub hash_keys: bool,

    /// Interval of the idle-key sweep over the local store, in seconds
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

impl Default for LimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            hash_keys: default_hash_keys(),
            sweep_interval_secs: None,
        }
    }
}

fn default_hash_keys() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The assembled limiter plus the pieces callers may need to manage.
pub struct Runtime {
    pub limiter: RateLimiter,
    pub routes: RouteTable,
    /// Local store, either the primary or the fallback
    pub local: Arc<LocalWindowStore>,
}

impl AppConfig {
    /// Load configuration from an optional file, then environment overrides
    /// such as `WINDOWGATE__STORE__BACKEND=redis`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let config: AppConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WindowGateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work, before anything is built.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(WindowGateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(WindowGateError::Config("store.timeout_ms must be positive".to_string()));
        }
        if self.limiting.sweep_interval_secs == Some(0) {
            return Err(WindowGateError::Config(
                "limiting.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// Load the route table named by `limiting.rules_path`, if any.
    pub fn load_routes(&self) -> Result<RouteTable> {
        match &self.limiting.rules_path {
            Some(path) => RouteTable::from_file(path),
            None => Ok(RouteTable::new()),
        }
    }

    /// Build the store stack selected by this configuration.
    pub fn build_store(&self, local: Arc<LocalWindowStore>) -> Result<Arc<dyn WindowStore>> {
        match self.store.backend {
            StoreBackend::Local => Ok(local),
            StoreBackend::Redis => {
                let url = self.store.redis_url.clone().ok_or_else(|| {
                    WindowGateError::Config("store.redis_url is required".to_string())
                })?;
                let shared = SharedWindowStore::new(SharedStoreConfig {
                    url,
                    key_prefix: self.store.key_prefix.clone(),
                    timeout: self.store_timeout(),
                })?;
                Ok(Arc::new(
                    FailoverStore::new(Arc::new(shared), local, self.store.fallback)
                        .with_recovery_interval(Duration::from_millis(self.store.recovery_interval_ms)),
                ))
            }
        }
    }

    /// Build the limiter, route table and (when configured) the sweeper.
    ///
    /// Must be called inside a tokio runtime when a sweep interval is set.
    pub fn build(&self) -> Result<Runtime> {
        let routes = self.load_routes()?;
        let local = Arc::new(LocalWindowStore::new());
        let store = self.build_store(local.clone())?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        if let Some(secs) = self.limiting.sweep_interval_secs {
            local.spawn_sweeper(clock.clone(), Duration::from_secs(secs));
        }

        let limiter = RateLimiter::new(store)
            .with_resolver(IdentifierResolver::with_hashing(self.limiting.hash_keys))
            .with_clock(clock);

        info!(
            backend = ?self.store.backend,
            fallback = ?self.store.fallback,
            routes = routes.len(),
            "Rate limiter initialized"
        );

        Ok(Runtime {
            limiter,
            routes,
            local,
        })
    }
}

//! Error types for windowgate.

use thiserror::Error;

/// Main error type for windowgate operations.
#[derive(Error, Debug)]
pub enum WindowGateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy with a non-positive limit or period
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// The shared window store failed or timed out
    #[error("Window store unavailable: {0}")]
    StoreUnavailable(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WindowGateError {
    /// Whether this error should trigger the store fallback path.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Redis(_))
    }
}

impl From<::config::ConfigError> for WindowGateError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for windowgate operations.
pub type Result<T> = std::result::Result<T, WindowGateError>;

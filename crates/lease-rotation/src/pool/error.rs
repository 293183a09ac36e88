//! Error types for the reference pool
use thiserror::Error;

/// Errors reported by [`Pool`](super::Pool).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was shut down
    #[error("Pool is closed")]
    Closed,

    /// No connection became available in time
    #[error("Timed out after {timeout_ms}ms waiting for a connection ({max_size} in use)")]
    Timeout {
        /// The acquire timeout in milliseconds
        timeout_ms: u64,
        /// Maximum pool size
        max_size: usize,
    },

    /// No credentials have been applied yet
    #[error("Pool has no credentials configured")]
    NoCredentials,

    /// The connector failed to open a connection
    #[error("Connection failed: {message}")]
    Connect {
        /// The error message
        message: String,
    },

    /// Pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },
}

impl PoolError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connect { .. })
    }
}

//! Pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::PoolError;

/// Configuration for the reference connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections (idle + checked out)
    pub max_size: usize,
    /// Timeout for acquiring a connection from the pool
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Time after which idle connections are closed
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Maximum lifetime of a connection
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::configuration("max_size must be greater than 0"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::configuration(
                "acquire_timeout must be greater than zero",
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(PoolError::configuration(
                "idle_timeout must be greater than zero",
            ));
        }
        if self.max_lifetime.is_zero() {
            return Err(PoolError::configuration(
                "max_lifetime must be greater than zero",
            ));
        }
        Ok(())
    }
}

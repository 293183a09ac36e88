//! Error types for credential rotation
use thiserror::Error;

/// Result type for rotation operations
pub type Result<T> = std::result::Result<T, RotationError>;

/// Errors reported while handling a lease event.
///
/// None of these are fatal to the coordinator: each one is logged, emitted on
/// the event bus and returned to the caller, and the event loop keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    /// The credential source had no value (or an empty one) for a key
    #[error("Missing credential '{key}' for datasource '{datasource}'")]
    MissingCredential {
        /// The datasource being rotated
        datasource: String,
        /// The configuration key that was empty or unset
        key: String,
    },

    /// No live pool handle is registered for the datasource
    #[error("No pool registered for datasource '{datasource}'")]
    PoolNotFound {
        /// The datasource name
        datasource: String,
    },

    /// The registered pool handle is not of the type the adapter expects
    #[error("Pool for datasource '{datasource}' is not a {expected}")]
    PoolTypeMismatch {
        /// The datasource name
        datasource: String,
        /// Type name the adapter tried to downcast to
        expected: &'static str,
    },

    /// The pool rejected the new credentials
    #[error("Failed to apply credentials to datasource '{datasource}': {reason}")]
    ApplyCredentialsFailed {
        /// The datasource name
        datasource: String,
        /// Why the pool rejected the write
        reason: String,
    },

    /// The pool rejected the soft eviction request
    #[error("Soft eviction failed for datasource '{datasource}': {reason}")]
    SoftEvictFailed {
        /// The datasource name
        datasource: String,
        /// Why the eviction was rejected
        reason: String,
    },

    /// Rotation was requested by name for a datasource that was never bound
    #[error("Unknown datasource '{datasource}'")]
    UnknownDatasource {
        /// The datasource name
        datasource: String,
    },

    /// Coordinator configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },
}

impl RotationError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Check if re-delivering the same event may succeed.
    ///
    /// Missing credentials usually mean the configuration refresh has not
    /// landed yet; pool-side rejections may clear once the pool recovers.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MissingCredential { .. }
            | Self::ApplyCredentialsFailed { .. }
            | Self::SoftEvictFailed { .. } => true,
            Self::PoolNotFound { .. }
            | Self::PoolTypeMismatch { .. }
            | Self::UnknownDatasource { .. }
            | Self::Configuration { .. } => false,
        }
    }

    /// Get the datasource associated with this error (if any)
    #[must_use]
    pub fn datasource(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => None,
            Self::MissingCredential { datasource, .. }
            | Self::PoolNotFound { datasource }
            | Self::PoolTypeMismatch { datasource, .. }
            | Self::ApplyCredentialsFailed { datasource, .. }
            | Self::SoftEvictFailed { datasource, .. }
            | Self::UnknownDatasource { datasource } => Some(datasource),
        }
    }

    /// Short machine-friendly label, used as a metrics/log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential { .. } => "missing_credential",
            Self::PoolNotFound { .. } => "pool_not_found",
            Self::PoolTypeMismatch { .. } => "pool_type_mismatch",
            Self::ApplyCredentialsFailed { .. } => "apply_credentials_failed",
            Self::SoftEvictFailed { .. } => "soft_evict_failed",
            Self::UnknownDatasource { .. } => "unknown_datasource",
            Self::Configuration { .. } => "configuration",
        }
    }
}

//! Lease lifecycle notifications.
//!
//! The secret manager emits a [`LeaseEvent`] whenever a lease on a secret
//! path is issued, renewed, expires or fails. The event only signals that
//! something changed; the credential values themselves are read separately
//! from the configuration layer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Location of a credential in the secret manager (e.g. `database/creds/customer`).
///
/// Compared by exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretPath(String);

impl SecretPath {
    /// Create a new secret path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SecretPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for SecretPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// What happened to the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeaseEventKind {
    /// A new lease (and therefore a new secret value) was issued.
    Created,
    /// An existing lease was extended; the secret value is unchanged.
    Renewed,
    /// The lease ran out.
    Expired,
    /// The secret manager failed to obtain or renew the lease.
    Error {
        /// Failure description from the secret manager, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl LeaseEventKind {
    /// Short label used in log fields and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Renewed => "renewed",
            Self::Expired => "expired",
            Self::Error { .. } => "error",
        }
    }
}

impl fmt::Display for LeaseEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lease lifecycle notification for one secret path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseEvent {
    /// What happened.
    #[serde(flatten)]
    pub kind: LeaseEventKind,
    /// The secret path the lease belongs to.
    pub path: SecretPath,
    /// When the secret manager produced the event.
    pub timestamp: DateTime<Utc>,
}

impl LeaseEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: LeaseEventKind, path: impl Into<SecretPath>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for a `Created` event.
    pub fn created(path: impl Into<SecretPath>) -> Self {
        Self::new(LeaseEventKind::Created, path)
    }

    /// Shorthand for a `Renewed` event.
    pub fn renewed(path: impl Into<SecretPath>) -> Self {
        Self::new(LeaseEventKind::Renewed, path)
    }

    /// Shorthand for an `Expired` event.
    pub fn expired(path: impl Into<SecretPath>) -> Self {
        Self::new(LeaseEventKind::Expired, path)
    }

    /// Shorthand for an `Error` event.
    pub fn error(path: impl Into<SecretPath>, message: impl Into<String>) -> Self {
        Self::new(
            LeaseEventKind::Error {
                message: Some(message.into()),
            },
            path,
        )
    }
}

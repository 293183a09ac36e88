//! Testing utilities for rotation
//!
//! Gated behind the `test-util` feature.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapter::PoolAdapter;
use crate::credentials::Credentials;
use crate::error::{Result, RotationError};
use crate::registry::PoolHandle;

/// Record of adapter calls for verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    /// `apply_credentials` was entered.
    Apply {
        /// The datasource name.
        datasource: String,
        /// The credentials passed in.
        creds: Credentials,
    },
    /// `soft_evict` was entered.
    Evict {
        /// The datasource name.
        datasource: String,
    },
}

impl AdapterCall {
    /// The datasource the call targeted.
    #[must_use]
    pub fn datasource(&self) -> &str {
        match self {
            Self::Apply { datasource, .. } | Self::Evict { datasource } => datasource,
        }
    }
}

/// Pool adapter that records every call instead of touching a pool.
///
/// Optionally sleeps inside each call (to widen race windows) and fails
/// calls for chosen datasources.
#[derive(Debug, Default)]
pub struct RecordingAdapter {
    calls: Mutex<Vec<AdapterCall>>,
    delay: Option<Duration>,
    fail_apply: Mutex<HashSet<String>>,
    fail_evict: Mutex<HashSet<String>>,
}

impl RecordingAdapter {
    /// Adapter that records calls and returns immediately.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adapter that sleeps for `delay` inside each call.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// Make `apply_credentials` fail for `datasource`.
    pub fn fail_apply_for(&self, datasource: &str) {
        self.fail_apply.lock().insert(datasource.to_owned());
    }

    /// Make `soft_evict` fail for `datasource`.
    pub fn fail_evict_for(&self, datasource: &str) {
        self.fail_evict.lock().insert(datasource.to_owned());
    }

    /// All calls so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    /// Calls that targeted `datasource`, in order.
    #[must_use]
    pub fn calls_for(&self, datasource: &str) -> Vec<AdapterCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.datasource() == datasource)
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PoolAdapter for RecordingAdapter {
    async fn apply_credentials(
        &self,
        datasource: &str,
        _pool: &PoolHandle,
        creds: &Credentials,
    ) -> Result<()> {
        self.calls.lock().push(AdapterCall::Apply {
            datasource: datasource.to_owned(),
            creds: creds.clone(),
        });
        self.pause().await;

        if self.fail_apply.lock().contains(datasource) {
            return Err(RotationError::ApplyCredentialsFailed {
                datasource: datasource.to_owned(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    async fn soft_evict(&self, datasource: &str, _pool: &PoolHandle) -> Result<()> {
        self.calls.lock().push(AdapterCall::Evict {
            datasource: datasource.to_owned(),
        });
        self.pause().await;

        if self.fail_evict.lock().contains(datasource) {
            return Err(RotationError::SoftEvictFailed {
                datasource: datasource.to_owned(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

//! Pool adapter, the only surface the coordinator uses to touch a pool.
//!
//! [`PoolAdapter`] works on type-erased [`PoolHandle`]s so the coordinator has
//! no dependency on the pooling library. Pools that implement
//! [`RotatablePool`] get an adapter for free through [`TypedPoolAdapter`].

use std::any::{Any, type_name};
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::{Result, RotationError};
use crate::registry::PoolHandle;

/// Capability surface for rotating a pool's credentials.
///
/// Both operations must be fast and must not wait for connections to drain.
#[async_trait]
pub trait PoolAdapter: Send + Sync {
    /// Set the credentials used for every connection created from now on.
    ///
    /// Connections that are already open (idle or checked out) keep the
    /// credentials they were opened with.
    async fn apply_credentials(
        &self,
        datasource: &str,
        pool: &PoolHandle,
        creds: &Credentials,
    ) -> Result<()>;

    /// Retire existing connections: close idle ones now, close checked-out
    /// ones when they are returned. An empty pool is not an error.
    async fn soft_evict(&self, datasource: &str, pool: &PoolHandle) -> Result<()>;
}

/// A pool whose credentials can be swapped at runtime.
pub trait RotatablePool: Any + Send + Sync {
    /// Error reported by the pool.
    type Error: Display;

    /// Store new credentials for future connections.
    fn set_credentials(&self, creds: &Credentials) -> std::result::Result<(), Self::Error>;

    /// Mark existing connections for retirement. Returns how many idle
    /// connections were closed immediately.
    fn soft_evict(&self) -> std::result::Result<usize, Self::Error>;
}

/// [`PoolAdapter`] for handles wrapping a concrete [`RotatablePool`] `P`.
pub struct TypedPoolAdapter<P> {
    _pool: PhantomData<fn() -> P>,
}

impl<P: RotatablePool> TypedPoolAdapter<P> {
    /// Create the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self { _pool: PhantomData }
    }

    fn resolve(datasource: &str, pool: &PoolHandle) -> Result<Arc<P>> {
        pool.downcast::<P>()
            .ok_or_else(|| RotationError::PoolTypeMismatch {
                datasource: datasource.to_owned(),
                expected: type_name::<P>(),
            })
    }
}

impl<P: RotatablePool> Default for TypedPoolAdapter<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> std::fmt::Debug for TypedPoolAdapter<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedPoolAdapter")
            .field("pool", &type_name::<P>())
            .finish()
    }
}

#[async_trait]
impl<P: RotatablePool> PoolAdapter for TypedPoolAdapter<P> {
    async fn apply_credentials(
        &self,
        datasource: &str,
        pool: &PoolHandle,
        creds: &Credentials,
    ) -> Result<()> {
        let pool = Self::resolve(datasource, pool)?;
        pool.set_credentials(creds)
            .map_err(|e| RotationError::ApplyCredentialsFailed {
                datasource: datasource.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn soft_evict(&self, datasource: &str, pool: &PoolHandle) -> Result<()> {
        let pool = Self::resolve(datasource, pool)?;
        let closed = pool.soft_evict().map_err(|e| RotationError::SoftEvictFailed {
            datasource: datasource.to_owned(),
            reason: e.to_string(),
        })?;
        tracing::debug!(datasource, idle_closed = closed, "soft eviction requested");
        Ok(())
    }
}

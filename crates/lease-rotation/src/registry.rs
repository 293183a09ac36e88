//! Pool registry: maps datasource names to live pool handles.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::lease::SecretPath;

/// Type-erased reference to a connection pool.
///
/// The pool subsystem owns the pool; the handle only lets an adapter reach
/// the pool's credential and eviction surface. Cloning is cheap.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl PoolHandle {
    /// Wrap a shared pool.
    pub fn new<P: Any + Send + Sync>(pool: Arc<P>) -> Self {
        Self {
            inner: pool,
            type_name: type_name::<P>(),
        }
    }

    /// Recover the concrete pool, or `None` if it is not a `P`.
    #[must_use]
    pub fn downcast<P: Any + Send + Sync>(&self) -> Option<Arc<P>> {
        Arc::clone(&self.inner).downcast::<P>().ok()
    }

    /// Name of the concrete pool type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("type", &self.type_name)
            .finish()
    }
}

/// A datasource managed by the coordinator.
///
/// Built once at startup by the surrounding application.
#[derive(Debug, Clone)]
pub struct DatasourceBinding {
    /// Logical datasource name; also the credential key stem.
    pub name: String,
    /// Secret path whose leases carry this datasource's credentials.
    pub path: SecretPath,
    /// The pool to rotate.
    pub pool: PoolHandle,
}

impl DatasourceBinding {
    /// Create a binding.
    pub fn new(name: impl Into<String>, path: impl Into<SecretPath>, pool: PoolHandle) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            pool,
        }
    }
}

/// Datasource name → pool handle.
///
/// Concurrent reads for different datasources never contend on a global lock.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: DashMap<String, PoolHandle>,
}

impl PoolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool, returning the handle it replaced (if any).
    pub fn insert(&self, name: impl Into<String>, pool: PoolHandle) -> Option<PoolHandle> {
        self.pools.insert(name.into(), pool)
    }

    /// Handle registered for `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<PoolHandle> {
        self.pools.get(name).map(|entry| entry.value().clone())
    }

    /// Drop the handle for `name`, e.g. after the pool was shut down.
    pub fn remove(&self, name: &str) -> Option<PoolHandle> {
        self.pools.remove(name).map(|(_, handle)| handle)
    }

    /// Number of registered pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Registered datasource names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

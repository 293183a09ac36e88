//! # Lease Rotation
//!
//! Zero-downtime rotation of database credentials issued as short-lived
//! leases by a secret manager.
//!
//! The [`Coordinator`] consumes [`LeaseEvent`]s, matches them to registered
//! datasources by secret path, reads the fresh credentials from a
//! [`CredentialSource`], applies them to the datasource's pool through a
//! [`PoolAdapter`] and requests soft eviction of the connections opened under
//! the previous credentials.
//!
//! ```rust,ignore
//! let config = CoordinatorConfig::from_toml_str(&std::fs::read_to_string("rotation.toml")?)?;
//! let pool = Arc::new(Pool::new(MyConnector::default(), PoolConfig::default())?);
//! let coordinator = Arc::new(Coordinator::new(
//!     &config,
//!     Arc::new(EnvSource),
//!     Arc::new(TypedPoolAdapter::<Pool<MyConnector>>::new()),
//! )?);
//!
//! let binding = config.datasource("customer").unwrap().bind(PoolHandle::new(pool));
//! let (tx, rx) = tokio::sync::mpsc::channel(64);
//! let subscription = coordinator.subscribe([binding], rx);
//! ```
#![forbid(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod events;
pub mod lease;
pub mod pool;
pub mod registry;

#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(feature = "test-util")]
pub mod testing;

pub use adapter::{PoolAdapter, RotatablePool, TypedPoolAdapter};
pub use config::{CoordinatorConfig, DatasourceConfig};
pub use coordinator::{Coordinator, Outcome, RotationReport, Subscription};
pub use credentials::{
    CredentialKeys, CredentialSource, CredentialStore, Credentials, EnvSource, MemorySource,
};
pub use error::{Result, RotationError};
pub use events::{EventBus, RotationEvent};
pub use lease::{LeaseEvent, LeaseEventKind, SecretPath};
pub use pool::{Connector, Pool, PoolConfig, PoolError, PoolStats, PooledConnection};
pub use registry::{DatasourceBinding, PoolHandle, PoolRegistry};

//! Coordinator configuration.
//!
//! ```toml
//! key_prefix = "datasource."
//! rotate_on_renewed = false
//!
//! [[datasources]]
//! name = "customer"
//! path = "database/creds/customer"
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::credentials::CredentialKeys;
use crate::error::{Result, RotationError};
use crate::lease::SecretPath;
use crate::registry::{DatasourceBinding, PoolHandle};

/// Static name → secret path mapping for one datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Logical datasource name.
    pub name: String,
    /// Secret path whose leases carry its credentials.
    pub path: SecretPath,
}

impl DatasourceConfig {
    /// Attach the live pool, producing the binding handed to the coordinator.
    #[must_use]
    pub fn bind(&self, pool: PoolHandle) -> DatasourceBinding {
        DatasourceBinding::new(self.name.clone(), self.path.clone(), pool)
    }
}

/// Configuration for the rotation coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Prefix of the credential keys, e.g. `datasource.` for
    /// `datasource.customer.username`.
    pub key_prefix: String,
    /// Also rotate on `Renewed` lease events, not only on `Created`.
    pub rotate_on_renewed: bool,
    /// Capacity of the rotation event bus.
    pub event_buffer: usize,
    /// Lease events handled concurrently by [`Coordinator::run`]. Further
    /// events stay in the inbound channel until a handler finishes.
    ///
    /// [`Coordinator::run`]: crate::Coordinator::run
    pub max_in_flight: usize,
    /// Datasources managed by this process.
    pub datasources: Vec<DatasourceConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            rotate_on_renewed: false,
            event_buffer: 256,
            max_in_flight: 64,
            datasources: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| RotationError::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(RotationError::configuration(
                "event_buffer must be greater than 0",
            ));
        }
        if self.max_in_flight == 0 {
            return Err(RotationError::configuration(
                "max_in_flight must be greater than 0",
            ));
        }
        let mut names = HashSet::new();
        for ds in &self.datasources {
            if ds.name.trim().is_empty() {
                return Err(RotationError::configuration("datasource name cannot be empty"));
            }
            if ds.path.as_str().trim().is_empty() {
                return Err(RotationError::configuration(format!(
                    "secret path for datasource '{}' cannot be empty",
                    ds.name
                )));
            }
            if !names.insert(ds.name.as_str()) {
                return Err(RotationError::configuration(format!(
                    "datasource '{}' is declared more than once",
                    ds.name
                )));
            }
        }
        Ok(())
    }

    /// Credential key layout derived from `key_prefix`.
    #[must_use]
    pub fn credential_keys(&self) -> CredentialKeys {
        CredentialKeys::with_prefix(self.key_prefix.clone())
    }

    /// Look up a datasource entry by name.
    #[must_use]
    pub fn datasource(&self, name: &str) -> Option<&DatasourceConfig> {
        self.datasources.iter().find(|ds| ds.name == name)
    }
}

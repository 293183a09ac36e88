//! Credentials, the sources they are read from, and the store of the latest
//! pair known for each datasource.
//!
//! The secret manager refreshes the configuration layer before it announces a
//! new lease; [`CredentialStore::load`] reads that layer at rotation time.
//! If the refresh and the event delivery are not causally ordered by the
//! secret manager, the read may observe the previous secret. That ordering is
//! an external invariant of the system and is not compensated for here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Result, RotationError};

/// A database username/password pair.
///
/// The password is redacted in `Debug` and is zeroized when dropped.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Create a new credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// The database user name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Access the password in cleartext.
    ///
    /// Only pool adapters should call this, when opening a connection.
    #[must_use]
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Key/value configuration reader supplying freshly rotated credentials.
pub trait CredentialSource: Send + Sync {
    /// Current value for `key`, or `None` if unset.
    fn get(&self, key: &str) -> Option<String>;
}

/// In-process configuration map.
///
/// The secret-manager integration writes the new secret here before emitting
/// the lease event.
#[derive(Debug, Default)]
pub struct MemorySource {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    /// Remove a value.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.write().remove(key)
    }

    /// Write both credential keys for a datasource in one step.
    pub fn set_credentials(&self, keys: &CredentialKeys, datasource: &str, creds: &Credentials) {
        let mut values = self.values.write();
        values.insert(keys.username_key(datasource), creds.username().to_owned());
        values.insert(
            keys.password_key(datasource),
            creds.expose_password().to_owned(),
        );
    }
}

impl CredentialSource for MemorySource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

/// Reads credentials from the process environment.
///
/// Keys are mapped with relaxed binding: `.` and `-` become `_` and the
/// result is upper-cased, so `datasource.customer.username` is read from
/// `DATASOURCE_CUSTOMER_USERNAME`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl EnvSource {
    /// Environment variable name for a configuration key.
    #[must_use]
    pub fn var_name(key: &str) -> String {
        key.chars()
            .map(|c| match c {
                '.' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }
}

impl CredentialSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::var_name(key)).ok()
    }
}

/// Derives the configuration keys for a datasource's credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialKeys {
    prefix: String,
}

impl CredentialKeys {
    /// Keys of the form `<prefix><name>.username`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key holding the username.
    #[must_use]
    pub fn username_key(&self, datasource: &str) -> String {
        format!("{}{datasource}.username", self.prefix)
    }

    /// Key holding the password.
    #[must_use]
    pub fn password_key(&self, datasource: &str) -> String {
        format!("{}{datasource}.password", self.prefix)
    }
}

/// Latest applied credentials per datasource.
///
/// Reads are lock-free across datasources. Only the rotation path writes,
/// through [`commit`](Self::commit) once a pool has accepted the pair.
pub struct CredentialStore {
    source: Arc<dyn CredentialSource>,
    keys: CredentialKeys,
    latest: DashMap<String, Credentials>,
}

impl CredentialStore {
    /// Create a store reading from `source` with the given key layout.
    pub fn new(source: Arc<dyn CredentialSource>, keys: CredentialKeys) -> Self {
        Self {
            source,
            keys,
            latest: DashMap::new(),
        }
    }

    /// The key layout used to read the source.
    #[must_use]
    pub fn keys(&self) -> &CredentialKeys {
        &self.keys
    }

    /// Latest credentials recorded for `datasource`.
    ///
    /// The coordinator records a pair only once its pool has accepted it, so
    /// this is the pair new connections of that pool are opened with.
    #[must_use]
    pub fn read(&self, datasource: &str) -> Option<Credentials> {
        self.latest.get(datasource).map(|entry| entry.value().clone())
    }

    /// Read the current credentials for `datasource` from the source without
    /// recording them.
    ///
    /// Fails with [`RotationError::MissingCredential`] if either value is
    /// unset or empty.
    pub fn load(&self, datasource: &str) -> Result<Credentials> {
        let username = self.fetch(datasource, self.keys.username_key(datasource))?;
        let password = self.fetch(datasource, self.keys.password_key(datasource))?;
        Ok(Credentials::new(username, password))
    }

    /// Record `creds` as the latest pair for `datasource`.
    pub fn commit(&self, datasource: &str, creds: Credentials) {
        self.latest.insert(datasource.to_owned(), creds);
    }

    /// [`load`](Self::load) and [`commit`](Self::commit) in one step.
    ///
    /// On failure the recorded pair is left unchanged.
    pub fn refresh(&self, datasource: &str) -> Result<Credentials> {
        let creds = self.load(datasource)?;
        self.commit(datasource, creds.clone());
        Ok(creds)
    }

    fn fetch(&self, datasource: &str, key: String) -> Result<String> {
        match self.source.get(&key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(RotationError::MissingCredential {
                datasource: datasource.to_owned(),
                key,
            }),
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("keys", &self.keys)
            .field("datasources", &self.latest.len())
            .finish()
    }
}

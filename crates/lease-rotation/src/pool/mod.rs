//! Reference connection pool with soft eviction.
//!
//! `Pool<C>` opens connections through a [`Connector`] using whatever
//! credentials were last applied. Every connection remembers the eviction
//! generation current when it was opened; [`Pool::soft_evict`] bumps the
//! generation, closes idle connections right away and lets checked-out ones
//! finish their work. A stale connection is closed when it is returned
//! instead of going back to the idle queue.

mod config;
mod error;

pub use config::PoolConfig;
pub use error::PoolError;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::adapter::RotatablePool;
use crate::credentials::Credentials;

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens and closes connections for a [`Pool`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connection type.
    type Connection: Send + 'static;

    /// Open a new connection authenticated with `creds`.
    async fn connect(&self, creds: &Credentials) -> Result<Self::Connection, PoolError>;

    /// Close a connection permanently.
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

// ---------------------------------------------------------------------------
// Pool internals
// ---------------------------------------------------------------------------

/// A pooled connection plus the bookkeeping needed to retire it.
struct Entry<T> {
    conn: T,
    generation: u64,
    username: String,
    created_at: Instant,
    last_used: Instant,
}

impl<T> Entry<T> {
    fn is_expired(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() > config.max_lifetime
            || self.last_used.elapsed() > config.idle_timeout
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total successful acquisitions.
    pub total_acquisitions: u64,
    /// Current number of connections checked out.
    pub active: usize,
    /// Current number of idle connections.
    pub idle: usize,
    /// Total connections ever opened.
    pub created: u64,
    /// Total connections ever closed, for any reason.
    pub closed: u64,
    /// Connections closed because a soft eviction retired them.
    pub evicted: u64,
    /// Current eviction generation.
    pub generation: u64,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    credentials: ArcSwapOption<Credentials>,
    generation: AtomicU64,
    idle: Mutex<VecDeque<Entry<C::Connection>>>,
    stats: Mutex<PoolStats>,
    /// Limits total connections (idle + active).
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
}

// ---------------------------------------------------------------------------
// Pool<C>
// ---------------------------------------------------------------------------

/// Connection pool whose credentials can be rotated while in use.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Create a pool with no credentials yet.
    ///
    /// # Errors
    /// Returns error if `config` is invalid (e.g. max_size == 0).
    pub fn new(connector: C, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let max = config.max_size;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                credentials: ArcSwapOption::empty(),
                generation: AtomicU64::new(0),
                idle: Mutex::new(VecDeque::with_capacity(max)),
                stats: Mutex::new(PoolStats::default()),
                semaphore: Arc::new(Semaphore::new(max)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Create a pool that opens connections with `creds`.
    pub fn with_credentials(
        connector: C,
        config: PoolConfig,
        creds: Credentials,
    ) -> Result<Self, PoolError> {
        let pool = Self::new(connector, config)?;
        pool.inner.credentials.store(Some(Arc::new(creds)));
        Ok(pool)
    }

    /// Username new connections will be opened with.
    #[must_use]
    pub fn current_username(&self) -> Option<String> {
        self.inner
            .credentials
            .load_full()
            .map(|c| c.username().to_owned())
    }

    /// Replace the credentials used for connections opened from now on.
    pub fn set_credentials(&self, creds: &Credentials) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        self.inner.credentials.store(Some(Arc::new(creds.clone())));
        Ok(())
    }

    /// Retire every open connection.
    ///
    /// Idle connections are closed now (on background tasks); checked-out
    /// connections are closed when returned. Returns the number of idle
    /// connections closed. Never waits for connections to drain.
    pub fn soft_evict(&self) -> Result<usize, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let stale: VecDeque<_> = {
            let mut idle = inner.idle.lock();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                idle.drain(..).partition(|e| e.generation < generation);
            *idle = fresh;
            stale
        };

        let evicted = stale.len();
        {
            let mut stats = inner.stats.lock();
            stats.evicted += evicted as u64;
            stats.generation = generation;
        }
        for entry in stale {
            self.close_in_background(entry.conn);
        }
        self.sync_idle();
        Ok(evicted)
    }

    /// Acquire a connection from the pool.
    ///
    /// Returns an RAII guard that returns the connection on drop.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let inner = &self.inner;

        let permit = tokio::time::timeout(
            inner.config.acquire_timeout,
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::Timeout {
            timeout_ms: inner.config.acquire_timeout.as_millis() as u64,
            max_size: inner.config.max_size,
        })?
        .map_err(|_| PoolError::Closed)?;

        let entry = loop {
            let candidate = { inner.idle.lock().pop_front() };
            match candidate {
                Some(entry) if entry.generation < inner.generation.load(Ordering::Acquire) => {
                    // Returned after an eviction raced past it.
                    inner.stats.lock().evicted += 1;
                    self.close_now(entry.conn).await;
                }
                Some(entry) if entry.is_expired(&inner.config) => {
                    self.close_now(entry.conn).await;
                }
                Some(entry) => break entry,
                None => break self.open().await?,
            }
        };

        {
            let mut stats = inner.stats.lock();
            stats.total_acquisitions += 1;
            stats.active += 1;
        }
        self.sync_idle();

        Ok(PooledConnection {
            entry: Some(entry),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.lock().clone()
    }

    /// Current eviction generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut down the pool, closing all idle connections.
    ///
    /// Checked-out connections are closed when returned.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);
        inner.semaphore.close();

        let entries: Vec<_> = { inner.idle.lock().drain(..).collect() };
        for entry in entries {
            self.close_now(entry.conn).await;
        }
        self.sync_idle();
    }

    async fn open(&self) -> Result<Entry<C::Connection>, PoolError> {
        let inner = &self.inner;
        // Generation first: a connection opened with pre-rotation credentials
        // must never carry the post-eviction generation.
        let generation = inner.generation.load(Ordering::Acquire);
        let creds = inner
            .credentials
            .load_full()
            .ok_or(PoolError::NoCredentials)?;

        let conn = inner.connector.connect(&creds).await?;
        inner.stats.lock().created += 1;

        let now = Instant::now();
        Ok(Entry {
            conn,
            generation,
            username: creds.username().to_owned(),
            created_at: now,
            last_used: now,
        })
    }

    fn release(&self, mut entry: Entry<C::Connection>) {
        let inner = &self.inner;
        inner.stats.lock().active -= 1;

        if self.is_closed() {
            self.close_in_background(entry.conn);
        } else if entry.generation < self.generation() {
            inner.stats.lock().evicted += 1;
            self.close_in_background(entry.conn);
        } else {
            entry.last_used = Instant::now();
            inner.idle.lock().push_back(entry);
        }
        self.sync_idle();
    }

    async fn close_now(&self, conn: C::Connection) {
        self.inner.connector.close(conn).await;
        self.inner.stats.lock().closed += 1;
    }

    fn close_in_background(&self, conn: C::Connection) {
        self.inner.stats.lock().closed += 1;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                drop(handle.spawn(async move {
                    pool.inner.connector.close(conn).await;
                }));
            }
            // No runtime to run the async close on; dropping still releases it.
            Err(_) => drop(conn),
        }
    }

    fn sync_idle(&self) {
        let idle = self.inner.idle.lock().len();
        self.inner.stats.lock().idle = idle;
    }
}

impl<C: Connector> RotatablePool for Pool<C> {
    type Error = PoolError;

    fn set_credentials(&self, creds: &Credentials) -> Result<(), PoolError> {
        Pool::set_credentials(self, creds)
    }

    fn soft_evict(&self) -> Result<usize, PoolError> {
        Pool::soft_evict(self)
    }
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A checked-out connection. Returned to the pool (or closed, if evicted)
/// when dropped.
pub struct PooledConnection<C: Connector> {
    entry: Option<Entry<C::Connection>>,
    pool: Pool<C>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    /// Eviction generation the connection was opened under.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.entry().generation
    }

    /// User the connection authenticated as.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.entry().username
    }

    /// Whether a soft eviction has retired this connection.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.generation() < self.pool.generation()
    }

    /// How long ago the connection was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.entry().created_at.elapsed()
    }

    fn entry(&self) -> &Entry<C::Connection> {
        self.entry.as_ref().expect("connection used after release")
    }
}

impl<C: Connector> std::ops::Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &C::Connection {
        &self.entry().conn
    }
}

impl<C: Connector> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C::Connection {
        &mut self
            .entry
            .as_mut()
            .expect("connection used after release")
            .conn
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry);
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("username", &self.username())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Connections are just "<user>#<n>" strings.
    #[derive(Default)]
    struct TestConnector {
        opened: AtomicU32,
    }

    #[async_trait]
    impl Connector for TestConnector {
        type Connection = String;

        async fn connect(&self, creds: &Credentials) -> Result<String, PoolError> {
            if creds.expose_password().is_empty() {
                return Err(PoolError::connect("authentication failed"));
            }
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}#{n}", creds.username()))
        }
    }

    fn pool() -> Pool<TestConnector> {
        Pool::with_credentials(
            TestConnector::default(),
            PoolConfig {
                max_size: 2,
                acquire_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            Credentials::new("v1", "p1"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn acquire_without_credentials_fails() {
        let pool = Pool::new(TestConnector::default(), PoolConfig::default()).unwrap();
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::NoCredentials);
    }

    #[tokio::test]
    async fn returned_connection_is_reused() {
        let pool = pool();
        drop(pool.acquire().await.unwrap());
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, "v1#0");
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn respects_max_size() {
        let pool = pool();
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            PoolError::Timeout { max_size: 2, .. }
        ));
    }

    #[tokio::test]
    async fn soft_evict_on_empty_pool_is_ok() {
        let pool = pool();
        assert_eq!(pool.soft_evict().unwrap(), 0);
        assert_eq!(pool.generation(), 1);
    }

    #[tokio::test]
    async fn connect_errors_propagate() {
        let pool = pool();
        pool.set_credentials(&Credentials::new("v2", "")).unwrap();
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            PoolError::Connect { .. }
        ));
    }

    #[tokio::test]
    async fn shutdown_rejects_rotation() {
        let pool = pool();
        drop(pool.acquire().await.unwrap());
        pool.shutdown().await;

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
        assert_eq!(
            pool.set_credentials(&Credentials::new("v2", "p2")),
            Err(PoolError::Closed)
        );
        assert_eq!(pool.soft_evict(), Err(PoolError::Closed));
    }
}

//! End-to-end rotation against the reference [`Pool`].
//!
//! Checks the connection-level outcome of a rotation: idle connections are
//! retired at once, in-use connections finish their work and are closed when
//! returned, and every connection opened afterwards uses the new user.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lease_rotation::{
    Connector, Coordinator, CoordinatorConfig, CredentialKeys, Credentials, DatasourceBinding,
    LeaseEvent, MemorySource, Outcome, Pool, PoolConfig, PoolError, PoolHandle, RotationError,
    TypedPoolAdapter,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

/// A "connection" is the user it logged in as plus a serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    user: String,
    serial: u32,
}

#[derive(Default)]
struct FakeDatabase {
    serial: AtomicU32,
    closed: Mutex<Vec<Session>>,
}

#[derive(Clone, Default)]
struct FakeConnector {
    db: Arc<FakeDatabase>,
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = Session;

    async fn connect(&self, creds: &Credentials) -> Result<Session, PoolError> {
        if creds.expose_password().is_empty() {
            return Err(PoolError::connect("password authentication failed"));
        }
        Ok(Session {
            user: creds.username().to_owned(),
            serial: self.db.serial.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn close(&self, conn: Session) {
        self.db.closed.lock().push(conn);
    }
}

type TestPool = Pool<FakeConnector>;

struct Fixture {
    coordinator: Coordinator,
    pool: Arc<TestPool>,
    db: Arc<FakeDatabase>,
    source: Arc<MemorySource>,
}

fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let keys = CredentialKeys::default();
    let source = Arc::new(MemorySource::new());
    source.set_credentials(&keys, "customer", &Credentials::new("v-token-1", "p1"));

    let connector = FakeConnector::default();
    let db = Arc::clone(&connector.db);
    let pool = Arc::new(
        Pool::new(
            connector,
            PoolConfig {
                max_size: 4,
                acquire_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .unwrap(),
    );

    let coordinator = Coordinator::new(
        &CoordinatorConfig::default(),
        source.clone(),
        Arc::new(TypedPoolAdapter::<TestPool>::new()),
    )
    .unwrap();
    coordinator.register(DatasourceBinding::new(
        "customer",
        "secret/customer-db",
        PoolHandle::new(Arc::clone(&pool)),
    ));

    Fixture {
        coordinator,
        pool,
        db,
        source,
    }
}

/// Let background close tasks run.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn startup_priming_enables_connections() {
    let f = fixture();
    assert_eq!(f.pool.acquire().await.unwrap_err(), PoolError::NoCredentials);

    let reports = f.coordinator.prime().await;

    assert_eq!(reports[0].outcome, Ok(Outcome::Primed));
    assert_eq!(f.pool.current_username().as_deref(), Some("v-token-1"));
    assert_eq!(f.pool.acquire().await.unwrap().user, "v-token-1");
    assert_eq!(f.pool.generation(), 0);
}

#[tokio::test]
async fn rotation_retires_idle_and_in_use_connections() {
    let f = fixture();
    f.coordinator.prime().await;

    // Two connections opened under the old user: one returned, one in use.
    let idle = f.pool.acquire().await.unwrap();
    let in_use = f.pool.acquire().await.unwrap();
    drop(idle);
    assert_eq!(f.pool.stats().idle, 1);

    f.source.set_credentials(
        &CredentialKeys::default(),
        "customer",
        &Credentials::new("v-token-2", "p2"),
    );
    let reports = f
        .coordinator
        .handle(&LeaseEvent::created("secret/customer-db"))
        .await;
    assert_eq!(reports[0].outcome, Ok(Outcome::Rotated));
    settle().await;

    // The idle connection is closed immediately.
    assert_eq!(f.pool.stats().idle, 0);
    assert_eq!(f.db.closed.lock().len(), 1);
    assert_eq!(f.db.closed.lock()[0].user, "v-token-1");

    // The checked-out connection keeps working until returned.
    assert!(in_use.is_stale());
    assert_eq!(in_use.user, "v-token-1");
    drop(in_use);
    settle().await;
    assert_eq!(f.db.closed.lock().len(), 2);
    assert_eq!(f.pool.stats().idle, 0);

    // New connections use the new user.
    let fresh = f.pool.acquire().await.unwrap();
    assert_eq!(fresh.user, "v-token-2");
    assert_eq!(fresh.serial, 2);
    assert!(!fresh.is_stale());

    let stats = f.pool.stats();
    assert_eq!(stats.evicted, 2);
    assert_eq!(stats.generation, 1);
}

#[tokio::test]
async fn failed_rotation_leaves_pool_untouched() {
    let f = fixture();
    f.coordinator.prime().await;
    let conn = f.pool.acquire().await.unwrap();
    drop(conn);

    f.source.set("customer.password", "");
    let reports = f
        .coordinator
        .handle(&LeaseEvent::created("secret/customer-db"))
        .await;

    assert!(matches!(
        reports[0].outcome,
        Err(RotationError::MissingCredential { .. })
    ));
    assert_eq!(f.pool.current_username().as_deref(), Some("v-token-1"));
    assert_eq!(f.pool.generation(), 0);
    assert_eq!(f.pool.stats().idle, 1);
}

#[tokio::test]
async fn closed_pool_reports_apply_failure() {
    let f = fixture();
    f.pool.shutdown().await;

    let reports = f
        .coordinator
        .handle(&LeaseEvent::created("secret/customer-db"))
        .await;

    assert!(matches!(
        reports[0].outcome,
        Err(RotationError::ApplyCredentialsFailed { .. })
    ));
    assert_eq!(f.pool.generation(), 0);
}

#[tokio::test]
async fn wrong_pool_type_is_a_mismatch() {
    let f = fixture();
    f.coordinator
        .registry()
        .insert("customer", PoolHandle::new(Arc::new(42_u32)));

    let err = f.coordinator.rotate("customer").await.unwrap_err();

    assert!(matches!(
        err,
        RotationError::PoolTypeMismatch { ref datasource, .. } if datasource == "customer"
    ));
}

#[tokio::test]
async fn rotating_twice_retires_twice() {
    let f = fixture();
    f.coordinator.prime().await;
    let event = LeaseEvent::created("secret/customer-db");

    f.coordinator.handle(&event).await;
    f.coordinator.handle(&event).await;

    assert_eq!(f.pool.generation(), 2);
    let conn = f.pool.acquire().await.unwrap();
    assert_eq!(conn.generation(), 2);
    assert_eq!(conn.user, "v-token-1");
}

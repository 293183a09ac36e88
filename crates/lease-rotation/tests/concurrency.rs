//! Concurrency guarantees of the coordinator.
//!
//! Uses a paused clock so adapter delays are deterministic: rotations that
//! run in parallel finish in one delay window, serialized ones take two.

use std::sync::Arc;
use std::time::Duration;

use lease_rotation::testing::{AdapterCall, RecordingAdapter};
use lease_rotation::{
    Coordinator, CoordinatorConfig, DatasourceBinding, LeaseEvent, MemorySource, Outcome,
    PoolHandle,
};
use pretty_assertions::assert_eq;
use tokio::time::Instant;

const DELAY: Duration = Duration::from_millis(50);

fn coordinator(adapter: Arc<RecordingAdapter>) -> Arc<Coordinator> {
    let source = Arc::new(MemorySource::new());
    for name in ["customer", "orders"] {
        source.set(format!("{name}.username"), format!("{name}-user"));
        source.set(format!("{name}.password"), format!("{name}-pass"));
    }

    let coordinator =
        Coordinator::new(&CoordinatorConfig::default(), source, adapter).unwrap();
    coordinator.register(DatasourceBinding::new(
        "customer",
        "secret/customer-db",
        PoolHandle::new(Arc::new(())),
    ));
    coordinator.register(DatasourceBinding::new(
        "orders",
        "secret/orders-db",
        PoolHandle::new(Arc::new(())),
    ));
    Arc::new(coordinator)
}

fn kinds(calls: &[AdapterCall]) -> Vec<&'static str> {
    calls
        .iter()
        .map(|call| match call {
            AdapterCall::Apply { .. } => "apply",
            AdapterCall::Evict { .. } => "evict",
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn different_datasources_rotate_in_parallel() {
    let adapter = RecordingAdapter::with_delay(DELAY);
    let coordinator = coordinator(adapter.clone());
    let start = Instant::now();

    let customer = LeaseEvent::created("secret/customer-db");
    let orders = LeaseEvent::created("secret/orders-db");
    let (a, b) = tokio::join!(coordinator.handle(&customer), coordinator.handle(&orders));

    assert_eq!(a[0].outcome, Ok(Outcome::Rotated));
    assert_eq!(b[0].outcome, Ok(Outcome::Rotated));
    // apply + evict for both pools in the time of one pool.
    let elapsed = start.elapsed();
    assert!(elapsed >= DELAY * 2 && elapsed < DELAY * 3, "{elapsed:?}");
    // Both applies were entered before either eviction.
    assert_eq!(
        kinds(&adapter.calls()),
        vec!["apply", "apply", "evict", "evict"]
    );
}

#[tokio::test(start_paused = true)]
async fn same_datasource_rotations_never_interleave() {
    let adapter = RecordingAdapter::with_delay(DELAY);
    let coordinator = coordinator(adapter.clone());
    let event = LeaseEvent::created("secret/customer-db");

    let start = Instant::now();
    let (a, b) = tokio::join!(coordinator.handle(&event), coordinator.handle(&event));

    assert_eq!(a[0].outcome, Ok(Outcome::Rotated));
    assert_eq!(b[0].outcome, Ok(Outcome::Rotated));
    assert!(start.elapsed() >= DELAY * 4);
    assert_eq!(
        kinds(&adapter.calls_for("customer")),
        vec!["apply", "evict", "apply", "evict"]
    );
}

#[tokio::test(start_paused = true)]
async fn a_slow_failure_does_not_block_other_datasources() {
    let adapter = RecordingAdapter::with_delay(DELAY);
    adapter.fail_apply_for("customer");
    let coordinator = coordinator(adapter.clone());

    let customer = LeaseEvent::created("secret/customer-db");
    let orders = LeaseEvent::created("secret/orders-db");
    let (a, b) = tokio::join!(coordinator.handle(&customer), coordinator.handle(&orders));

    assert!(a[0].outcome.is_err());
    assert_eq!(b[0].outcome, Ok(Outcome::Rotated));
    assert_eq!(kinds(&adapter.calls_for("customer")), vec!["apply"]);
    assert_eq!(kinds(&adapter.calls_for("orders")), vec!["apply", "evict"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_of_events_from_many_threads_stays_ordered_per_datasource() {
    let adapter = RecordingAdapter::with_delay(Duration::from_millis(1));
    let coordinator = coordinator(adapter.clone());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let coordinator = Arc::clone(&coordinator);
        let path = if i % 2 == 0 {
            "secret/customer-db"
        } else {
            "secret/orders-db"
        };
        tasks.push(tokio::spawn(async move {
            coordinator.handle(&LeaseEvent::created(path)).await
        }));
    }
    for task in tasks {
        let reports = task.await.unwrap();
        assert_eq!(reports[0].outcome, Ok(Outcome::Rotated));
    }

    for datasource in ["customer", "orders"] {
        let calls = kinds(&adapter.calls_for(datasource));
        assert_eq!(calls.len(), 16);
        for pair in calls.chunks(2) {
            assert_eq!(pair, ["apply", "evict"]);
        }
    }
}

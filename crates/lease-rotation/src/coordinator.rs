//! Credential rotation coordinator.
//!
//! Consumes lease lifecycle events, matches each one to the registered
//! datasources by exact secret path, and for rotating events runs:
//!
//! 1. read the current credentials from the [`CredentialStore`];
//! 2. abort with `MissingCredential` if either value is empty;
//! 3. apply them to the pool through the [`PoolAdapter`];
//! 4. request soft eviction of existing connections.
//!
//! Steps 1–4 run under a per-datasource lock, so two rotations of the same
//! pool never interleave, while different datasources rotate in parallel.
//! A failure in step 3 means step 4 never runs.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::adapter::PoolAdapter;
use crate::config::CoordinatorConfig;
use crate::credentials::{CredentialSource, CredentialStore, Credentials};
use crate::error::{Result, RotationError};
use crate::events::{EventBus, RotationEvent};
use crate::lease::{LeaseEvent, LeaseEventKind, SecretPath};
use crate::registry::{DatasourceBinding, PoolRegistry};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What the coordinator did for one datasource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Credentials applied and soft eviction requested.
    Rotated,
    /// The event was logged; pool state was not touched.
    Observed(LeaseEventKind),
    /// Startup credentials applied without eviction.
    Primed,
}

/// Result of handling an event for one matching datasource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    /// The datasource name.
    pub datasource: String,
    /// What happened.
    pub outcome: Result<Outcome>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Per-datasource state: its secret path and the lock serializing rotations.
struct Slot {
    path: SecretPath,
    lock: Arc<Mutex<()>>,
}

/// Applies rotated credentials to registered pools.
///
/// Share it behind an `Arc`; every method takes `&self` and may be called
/// concurrently from several notification threads.
pub struct Coordinator {
    adapter: Arc<dyn PoolAdapter>,
    store: CredentialStore,
    registry: Arc<PoolRegistry>,
    slots: DashMap<String, Slot>,
    rotate_on_renewed: bool,
    max_in_flight: usize,
    events: EventBus,
}

impl Coordinator {
    /// Create a coordinator reading credentials from `source` and mutating
    /// pools through `adapter`.
    pub fn new(
        config: &CoordinatorConfig,
        source: Arc<dyn CredentialSource>,
        adapter: Arc<dyn PoolAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            adapter,
            store: CredentialStore::new(source, config.credential_keys()),
            registry: Arc::new(PoolRegistry::new()),
            slots: DashMap::new(),
            rotate_on_renewed: config.rotate_on_renewed,
            max_in_flight: config.max_in_flight,
            events: EventBus::new(config.event_buffer),
        })
    }

    /// Use a registry shared with the surrounding application.
    ///
    /// Must be called before any binding is registered.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<PoolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// The pool registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// The credential store.
    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Subscribe to rotation events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RotationEvent> {
        self.events.subscribe()
    }

    /// Names of all registered datasources, sorted.
    #[must_use]
    pub fn datasources(&self) -> Vec<String> {
        let mut names: Vec<_> = self.slots.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Register a datasource.
    ///
    /// Registering a name twice replaces the earlier binding (last one wins)
    /// and logs a warning. The rotation lock is kept across replacement so an
    /// in-flight rotation still serializes with the new binding.
    pub fn register(&self, binding: DatasourceBinding) {
        let DatasourceBinding { name, path, pool } = binding;

        let previous = match self.slots.entry(name.clone()) {
            Entry::Occupied(mut slot) => {
                Some(std::mem::replace(&mut slot.get_mut().path, path.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot {
                    path: path.clone(),
                    lock: Arc::new(Mutex::new(())),
                });
                None
            }
        };
        self.registry.insert(name.clone(), pool);

        match previous {
            Some(previous_path) => {
                tracing::warn!(
                    datasource = %name,
                    previous_path = %previous_path,
                    path = %path,
                    "datasource registered twice, replacing earlier binding"
                );
                self.events.emit(RotationEvent::BindingReplaced {
                    datasource: name,
                    previous_path,
                    path,
                });
            }
            None => tracing::debug!(datasource = %name, path = %path, "datasource registered"),
        }
    }

    /// Register `bindings` and start consuming `events` on a background task.
    ///
    /// The task ends when the sender side is dropped (after draining every
    /// queued event) or when the returned [`Subscription`] is shut down.
    pub fn subscribe(
        self: &Arc<Self>,
        bindings: impl IntoIterator<Item = DatasourceBinding>,
        events: mpsc::Receiver<LeaseEvent>,
    ) -> Subscription {
        for binding in bindings {
            self.register(binding);
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            Arc::clone(self).run(ReceiverStream::new(events), shutdown.clone()),
        );
        Subscription { task, shutdown }
    }

    /// Consume `events` until the stream ends or `shutdown` fires.
    ///
    /// Each event is handled on its own task, so rotations for different
    /// datasources proceed in parallel. At most `max_in_flight` handlers run
    /// at once; while at the limit the stream is not polled, so a bounded
    /// channel feeding it applies backpressure to the sender. Rotations
    /// already started are always awaited before returning.
    pub async fn run<S>(self: Arc<Self>, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = LeaseEvent> + Send + Unpin + 'static,
    {
        let mut events = events;
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::debug!("rotation coordinator shutdown requested");
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_error(joined);
                }
                next = events.next(), if in_flight.len() < self.max_in_flight => match next {
                    Some(event) => {
                        let this = Arc::clone(&self);
                        in_flight.spawn(async move {
                            this.handle(&event).await;
                        });
                    }
                    None => break,
                },
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            log_join_error(joined);
        }
        tracing::debug!("rotation coordinator stopped");
    }

    /// Handle one lease event for every datasource bound to its path.
    ///
    /// Returns one report per matching datasource; an empty vector means the
    /// event concerned a path nobody here manages.
    pub async fn handle(&self, event: &LeaseEvent) -> Vec<RotationReport> {
        let targets = self.bound_to(&event.path);
        if targets.is_empty() {
            tracing::debug!(path = %event.path, kind = %event.kind, "lease event for unmanaged path");
            self.events.emit(RotationEvent::Ignored {
                path: event.path.clone(),
                kind: event.kind.clone(),
            });
            return Vec::new();
        }

        if !self.triggers_rotation(&event.kind) {
            return targets
                .into_iter()
                .map(|datasource| self.observe(datasource, event))
                .collect();
        }

        join_all(targets.into_iter().map(|datasource| async move {
            let outcome = self.rotate(&datasource).await.map(|()| Outcome::Rotated);
            RotationReport {
                datasource,
                outcome,
            }
        }))
        .await
    }

    /// Rotate one datasource's pool to the credentials currently in the source.
    ///
    /// Safe to call again for the same datasource after a failure.
    pub async fn rotate(&self, datasource: &str) -> Result<()> {
        let (path, lock) = self.slot(datasource)?;
        let _guard = lock.lock().await;

        match self.apply(datasource, true).await {
            Ok(creds) => {
                tracing::info!(
                    datasource,
                    path = %path,
                    username = creds.username(),
                    "database credentials rotated"
                );
                self.events.emit(RotationEvent::Rotated {
                    datasource: datasource.to_owned(),
                    path,
                    username: creds.username().to_owned(),
                });
                Ok(())
            }
            Err(error) => {
                self.report_failure(datasource, &error);
                Err(error)
            }
        }
    }

    /// Apply the configured credentials to every registered pool without
    /// evicting, as done once at startup before any lease event arrives.
    pub async fn prime(&self) -> Vec<RotationReport> {
        let names = self.datasources();
        join_all(names.into_iter().map(|datasource| async move {
            let outcome = self.prime_one(&datasource).await.map(|()| Outcome::Primed);
            RotationReport {
                datasource,
                outcome,
            }
        }))
        .await
    }

    async fn prime_one(&self, datasource: &str) -> Result<()> {
        let (_, lock) = self.slot(datasource)?;
        let _guard = lock.lock().await;

        match self.apply(datasource, false).await {
            Ok(creds) => {
                tracing::info!(
                    datasource,
                    username = creds.username(),
                    "datasource credentials primed"
                );
                Ok(())
            }
            Err(error) => {
                self.report_failure(datasource, &error);
                Err(error)
            }
        }
    }

    /// Steps 1–4 (step 4 only when `evict`). Caller holds the datasource lock.
    ///
    /// The store records the pair only once the pool has accepted it.
    async fn apply(&self, datasource: &str, evict: bool) -> Result<Credentials> {
        let creds = self.store.load(datasource)?;
        let pool = self.pool_for(datasource)?;

        self.adapter
            .apply_credentials(datasource, &pool, &creds)
            .await?;
        self.store.commit(datasource, creds.clone());
        if evict {
            self.adapter.soft_evict(datasource, &pool).await?;
        }
        Ok(creds)
    }

    fn observe(&self, datasource: String, event: &LeaseEvent) -> RotationReport {
        match &event.kind {
            LeaseEventKind::Error { message } => tracing::warn!(
                datasource = %datasource,
                path = %event.path,
                message = message.as_deref().unwrap_or(""),
                "secret manager reported a lease error"
            ),
            kind => tracing::info!(
                datasource = %datasource,
                path = %event.path,
                kind = %kind,
                "lease event observed"
            ),
        }
        self.events.emit(RotationEvent::Observed {
            datasource: datasource.clone(),
            path: event.path.clone(),
            kind: event.kind.clone(),
        });
        RotationReport {
            datasource,
            outcome: Ok(Outcome::Observed(event.kind.clone())),
        }
    }

    fn report_failure(&self, datasource: &str, error: &RotationError) {
        tracing::warn!(
            datasource,
            error = %error,
            kind = error.kind(),
            "credential rotation failed, pool keeps previous credentials"
        );
        self.events.emit(RotationEvent::RotationFailed {
            datasource: datasource.to_owned(),
            error: error.clone(),
        });
    }

    fn triggers_rotation(&self, kind: &LeaseEventKind) -> bool {
        match kind {
            LeaseEventKind::Created => true,
            LeaseEventKind::Renewed => self.rotate_on_renewed,
            LeaseEventKind::Expired | LeaseEventKind::Error { .. } => false,
        }
    }

    fn bound_to(&self, path: &SecretPath) -> Vec<String> {
        self.slots
            .iter()
            .filter(|slot| slot.path == *path)
            .map(|slot| slot.key().clone())
            .collect()
    }

    fn slot(&self, datasource: &str) -> Result<(SecretPath, Arc<Mutex<()>>)> {
        self.slots
            .get(datasource)
            .map(|slot| (slot.path.clone(), Arc::clone(&slot.lock)))
            .ok_or_else(|| RotationError::UnknownDatasource {
                datasource: datasource.to_owned(),
            })
    }

    fn pool_for(&self, datasource: &str) -> Result<crate::registry::PoolHandle> {
        self.registry
            .lookup(datasource)
            .ok_or_else(|| RotationError::PoolNotFound {
                datasource: datasource.to_owned(),
            })
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("datasources", &self.datasources())
            .field("rotate_on_renewed", &self.rotate_on_renewed)
            .field("max_in_flight", &self.max_in_flight)
            .field("events", &self.events)
            .finish()
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "lease event handler task failed");
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to the background task started by [`Coordinator::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Subscription {
    /// Stop consuming events and wait for in-flight rotations to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait until the event channel closes and every queued event is handled.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "rotation coordinator task failed");
        }
    }

    /// Whether the background task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemorySource;
    use crate::registry::PoolHandle;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct CountingAdapter {
        calls: SyncMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl PoolAdapter for CountingAdapter {
        async fn apply_credentials(
            &self,
            _datasource: &str,
            _pool: &PoolHandle,
            _creds: &Credentials,
        ) -> Result<()> {
            self.calls.lock().push("apply");
            Ok(())
        }

        async fn soft_evict(&self, _datasource: &str, _pool: &PoolHandle) -> Result<()> {
            self.calls.lock().push("evict");
            Ok(())
        }
    }

    fn coordinator(rotate_on_renewed: bool) -> (Coordinator, Arc<CountingAdapter>) {
        let source = Arc::new(MemorySource::new());
        source.set("customer.username", "u1");
        source.set("customer.password", "p1");
        let adapter = Arc::new(CountingAdapter::default());
        let config = CoordinatorConfig {
            rotate_on_renewed,
            ..Default::default()
        };
        let coordinator = Coordinator::new(&config, source, adapter.clone()).unwrap();
        coordinator.register(DatasourceBinding::new(
            "customer",
            "secret/customer-db",
            PoolHandle::new(Arc::new(())),
        ));
        (coordinator, adapter)
    }

    #[tokio::test]
    async fn renewed_is_observed_by_default() {
        let (coordinator, adapter) = coordinator(false);
        let reports = coordinator.handle(&LeaseEvent::renewed("secret/customer-db")).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Ok(Outcome::Observed(LeaseEventKind::Renewed)));
        assert!(adapter.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn renewed_rotates_when_enabled() {
        let (coordinator, adapter) = coordinator(true);
        let reports = coordinator.handle(&LeaseEvent::renewed("secret/customer-db")).await;
        assert_eq!(reports[0].outcome, Ok(Outcome::Rotated));
        assert_eq!(*adapter.calls.lock(), vec!["apply", "evict"]);
    }

    #[tokio::test]
    async fn rotate_unknown_datasource_fails() {
        let (coordinator, adapter) = coordinator(false);
        let err = coordinator.rotate("orders").await.unwrap_err();
        assert_eq!(
            err,
            RotationError::UnknownDatasource {
                datasource: "orders".into()
            }
        );
        assert!(adapter.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn prime_applies_without_evicting() {
        let (coordinator, adapter) = coordinator(false);
        let reports = coordinator.prime().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Ok(Outcome::Primed));
        assert_eq!(*adapter.calls.lock(), vec!["apply"]);
        assert_eq!(
            coordinator.store().read("customer"),
            Some(Credentials::new("u1", "p1"))
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = CoordinatorConfig {
            event_buffer: 0,
            ..Default::default()
        };
        let result = Coordinator::new(
            &config,
            Arc::new(MemorySource::new()),
            Arc::new(CountingAdapter::default()),
        );
        assert!(matches!(result, Err(RotationError::Configuration { .. })));
    }
}

//! Metrics collection for rotation events.
//!
//! Subscribes to the coordinator's event bus and translates events into
//! counters via the `metrics` crate.
//!
//! Gated behind the `metrics` feature.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;
use crate::events::RotationEvent;

/// Background metrics collector fed by [`Coordinator::events`].
///
/// # Usage
///
/// ```rust,ignore
/// let collector = MetricsCollector::new(&coordinator);
/// let cancel = CancellationToken::new();
/// tokio::spawn(collector.run(cancel));
/// ```
pub struct MetricsCollector {
    receiver: broadcast::Receiver<RotationEvent>,
}

impl MetricsCollector {
    /// Create a new collector subscribed to the coordinator's events.
    #[must_use]
    pub fn new(coordinator: &Coordinator) -> Self {
        Self::from_receiver(coordinator.events())
    }

    /// Create a collector from an existing subscription.
    #[must_use]
    pub fn from_receiver(receiver: broadcast::Receiver<RotationEvent>) -> Self {
        Self { receiver }
    }

    /// Run the collector loop until the bus closes or `cancel` fires.
    ///
    /// Lagged events are skipped with a warning.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                result = self.receiver.recv() => {
                    match result {
                        Ok(event) => Self::record_event(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "MetricsCollector lagged behind rotation events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    fn record_event(event: &RotationEvent) {
        match event {
            RotationEvent::Rotated { datasource, .. } => {
                metrics::counter!("lease_rotation.rotated.total", "datasource" => datasource.clone())
                    .increment(1);
            }
            RotationEvent::RotationFailed { datasource, error } => {
                metrics::counter!(
                    "lease_rotation.failed.total",
                    "datasource" => datasource.clone(),
                    "kind" => error.kind()
                )
                .increment(1);
            }
            RotationEvent::Observed {
                datasource, kind, ..
            } => {
                metrics::counter!(
                    "lease_rotation.observed.total",
                    "datasource" => datasource.clone(),
                    "kind" => kind.as_str()
                )
                .increment(1);
            }
            RotationEvent::Ignored { .. } => {
                metrics::counter!("lease_rotation.ignored.total").increment(1);
            }
            // Startup wiring, tracing covers it.
            RotationEvent::BindingReplaced { .. } => {}
        }
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish()
    }
}

/// Create a [`MetricsCollector`] for `coordinator` and spawn it.
pub fn spawn_metrics_collector(
    coordinator: &Coordinator,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(MetricsCollector::new(coordinator).run(cancel))
}

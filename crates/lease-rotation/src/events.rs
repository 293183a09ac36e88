//! Event broadcasting for rotation observability.
//!
//! Provides [`RotationEvent`] variants emitted by the coordinator and an
//! [`EventBus`] backed by `tokio::sync::broadcast`.

use tokio::sync::broadcast;

use crate::error::RotationError;
use crate::lease::{LeaseEventKind, SecretPath};

// ---------------------------------------------------------------------------
// RotationEvent
// ---------------------------------------------------------------------------

/// Events emitted while the coordinator handles lease notifications.
#[derive(Debug, Clone)]
pub enum RotationEvent {
    /// New credentials were applied and soft eviction was requested.
    Rotated {
        /// The datasource name.
        datasource: String,
        /// The secret path that triggered the rotation.
        path: SecretPath,
        /// The user the pool now connects as.
        username: String,
    },
    /// A lease event matched a datasource but does not trigger rotation.
    Observed {
        /// The datasource name.
        datasource: String,
        /// The secret path.
        path: SecretPath,
        /// What happened to the lease.
        kind: LeaseEventKind,
    },
    /// A lease event matched no registered datasource.
    Ignored {
        /// The secret path.
        path: SecretPath,
        /// What happened to the lease.
        kind: LeaseEventKind,
    },
    /// Rotation for a datasource failed; the pool keeps its previous credentials.
    RotationFailed {
        /// The datasource name.
        datasource: String,
        /// The failure.
        error: RotationError,
    },
    /// A binding with an already-registered name replaced the earlier one.
    BindingReplaced {
        /// The datasource name.
        datasource: String,
        /// Secret path of the replaced binding.
        previous_path: SecretPath,
        /// Secret path of the new binding.
        path: SecretPath,
    },
}

impl RotationEvent {
    /// Datasource the event concerns, if it matched one.
    #[must_use]
    pub fn datasource(&self) -> Option<&str> {
        match self {
            Self::Rotated { datasource, .. }
            | Self::Observed { datasource, .. }
            | Self::RotationFailed { datasource, .. }
            | Self::BindingReplaced { datasource, .. } => Some(datasource),
            Self::Ignored { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for rotation events.
///
/// Emission is fire-and-forget: if no subscribers are listening or the
/// channel is full, events are dropped (no backpressure on the coordinator).
pub struct EventBus {
    sender: broadcast::Sender<RotationEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    ///
    /// Subscribers that fall more than `buffer_size` events behind receive a
    /// `Lagged` error and skip ahead.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: RotationEvent) {
        // An error only means nobody is subscribed.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

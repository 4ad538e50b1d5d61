//! Typed notifications and counters.
//!
//! Background passes never return errors to callers; what happened is
//! published here instead. Listeners subscribe to the [`EventBus`] and stop
//! listening by dropping their receiver.

mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};

use lifeline_engine::{ConflictStrategy, OperationId, OperationKind, Timestamp};
use serde::Serialize;
use tokio::sync::broadcast;

/// Something observable happened in the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Enqueued {
        id: OperationId,
        kind: OperationKind,
    },
    /// Removed to make room for higher-priority work
    Evicted {
        id: OperationId,
        kind: OperationKind,
    },
    Delivered {
        id: OperationId,
        kind: OperationKind,
        attempts: u32,
    },
    RetryScheduled {
        id: OperationId,
        kind: OperationKind,
        attempts: u32,
        next_attempt_at: Timestamp,
        error: String,
    },
    DeadLettered {
        id: OperationId,
        kind: OperationKind,
        attempts: u32,
        reason: String,
    },
    Expired {
        id: OperationId,
        kind: OperationKind,
    },
    ConflictResolved {
        id: OperationId,
        field_path: String,
        strategy: ConflictStrategy,
    },
    /// Waiting for a human decision
    ConflictParked {
        id: OperationId,
        conflict_id: String,
        field_path: String,
    },
    /// A parked operation got its last decision and is due again
    Resumed {
        id: OperationId,
    },
    Cancelled {
        id: OperationId,
    },
    PassCompleted {
        kind: OperationKind,
        processed: usize,
        purged: usize,
    },
    ConnectivityChanged {
        online: bool,
    },
    SessionRefreshed {
        expires_at: Timestamp,
    },
    SessionCleared {
        reason: String,
    },
}

/// Fan-out channel for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a listener.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish to every current listener. Publishing with no listeners is fine.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(?event, "Publishing event");
        let _ = self.sender.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

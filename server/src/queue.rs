//! Caller-facing queue operations.
//!
//! Admission is synchronous: malformed requests and a full queue come back
//! as errors and nothing is stored.

use crate::db::{SharedStore, StoreResult};
use crate::events::{EngineEvent, EventBus, Metrics};
use lifeline_engine::{
    Clock, ConflictStrategy, EnqueueRequest, ManualResolution, Operation, PolicyRegistry,
};
use serde_json::Value;
use std::sync::Arc;

/// Enqueue, cancel and manual conflict resolution over a shared store.
#[derive(Clone)]
pub struct QueueService {
    store: SharedStore,
    policies: Arc<PolicyRegistry>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl QueueService {
    pub fn new(
        store: SharedStore,
        policies: Arc<PolicyRegistry>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            policies,
            clock,
            events,
            metrics,
        }
    }

    /// Validate and queue a request.
    pub async fn enqueue(&self, request: EnqueueRequest) -> StoreResult<Operation> {
        let id = uuid::Uuid::new_v4().to_string();
        // The store assigns the real sequence number.
        let op = self.policies.admit(&request, id, 0, self.clock.now())?;
        let admitted = self.store.enqueue(op.clone()).await?;

        Metrics::add(&self.metrics.evicted, admitted.evicted.len());
        for evicted in admitted.evicted {
            tracing::warn!(op_id = %evicted.id, kind = %evicted.kind, "Evicted to make room");
            self.events.publish(EngineEvent::Evicted {
                id: evicted.id,
                kind: evicted.kind,
            });
        }

        tracing::info!(op_id = %admitted.id, kind = %op.kind, priority = %op.priority, "Enqueued");
        Metrics::incr(&self.metrics.enqueued);
        self.events.publish(EngineEvent::Enqueued {
            id: admitted.id.clone(),
            kind: op.kind,
        });

        // Re-read to pick up the assigned sequence.
        Ok(self.store.get(&admitted.id).await?.unwrap_or(op))
    }

    /// Remove a still-pending operation.
    pub async fn cancel(&self, id: &str) -> StoreResult<Operation> {
        let op = self.store.cancel(id).await?;
        tracing::info!(op_id = %op.id, "Cancelled");
        self.events.publish(EngineEvent::Cancelled { id: op.id.clone() });
        Ok(op)
    }

    /// Settle a parked conflict with a human decision.
    pub async fn resolve_conflict(&self, id: &str, value: Value) -> StoreResult<ManualResolution> {
        let resolution = self
            .store
            .resolve_conflict(id, value, self.clock.now())
            .await?;

        Metrics::incr(&self.metrics.conflicts_resolved);
        if let Some(op_id) = &resolution.record.operation_id {
            self.events.publish(EngineEvent::ConflictResolved {
                id: op_id.clone(),
                field_path: resolution.record.field_path.clone(),
                strategy: ConflictStrategy::UserChoice,
            });
            if resolution.resumed {
                tracing::info!(op_id = %op_id, "All conflicts resolved, operation resumed");
                self.events
                    .publish(EngineEvent::Resumed { id: op_id.clone() });
            }
        }
        Ok(resolution)
    }
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

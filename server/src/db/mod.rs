//! Operation storage.
//!
//! [`OperationStore`] is the single source of truth for queued work. Every
//! mutation is one all-or-nothing step and every read goes back to the
//! backing store, so several tasks may share a store without holding locks
//! across awaits.

mod memory;
mod pool;
mod sqlite;

pub use memory::MemoryStore;
pub use pool::*;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use lifeline_engine::{
    Admitted, ConflictRecord, ManualResolution, Operation, OperationId, OperationKind,
    OperationPatch, OperationStatus, PolicyRegistry, ScheduleOutcome, Timestamp,
};
use serde_json::Value;
use std::sync::Arc;

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot file error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] lifeline_engine::Error),
}

impl StoreError {
    /// The underlying engine error, if this is one.
    pub fn engine(&self) -> Option<&lifeline_engine::Error> {
        match self {
            StoreError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to a store.
pub type SharedStore = Arc<dyn OperationStore>;

/// Durable, transactional storage of operations and parked conflicts.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert an admitted operation.
    ///
    /// The store assigns the insertion sequence and applies admission
    /// control; evicted operations are returned.
    async fn enqueue(&self, op: Operation) -> StoreResult<Admitted>;

    async fn get(&self, id: &str) -> StoreResult<Option<Operation>>;

    /// Scheduling view, optionally restricted to one kind.
    async fn schedule(&self, kind: Option<OperationKind>, now: Timestamp)
        -> StoreResult<ScheduleOutcome>;

    /// Eligible operations at `now` in dispatch order.
    async fn list_eligible(&self, now: Timestamp) -> StoreResult<Vec<Operation>> {
        Ok(self.schedule(None, now).await?.eligible)
    }

    async fn list_by_kind(&self, kind: OperationKind) -> StoreResult<Vec<Operation>>;

    async fn list_by_status(&self, status: OperationStatus) -> StoreResult<Vec<Operation>>;

    async fn list_all(&self) -> StoreResult<Vec<Operation>>;

    /// Apply a patch through the state machine.
    ///
    /// An operation that reaches a terminal status loses its conflict records.
    async fn update(&self, id: &str, patch: OperationPatch) -> StoreResult<Operation>;

    /// Apply a park patch and persist the deferred records in one step.
    async fn park(
        &self,
        id: &str,
        records: Vec<ConflictRecord>,
        patch: OperationPatch,
    ) -> StoreResult<Operation>;

    async fn delete(&self, id: &str) -> StoreResult<Option<Operation>>;

    /// Remove an operation that is still pending.
    async fn cancel(&self, id: &str) -> StoreResult<Operation>;

    async fn count(&self) -> StoreResult<usize>;

    /// Drop terminal operations older than `completed_at + retention_ms`.
    async fn purge_terminal(&self, now: Timestamp, retention_ms: u64)
        -> StoreResult<Vec<OperationId>>;

    /// Move operations left in `processing` by a previous run back to
    /// `retry_scheduled`, due immediately, or to `failed` when their retry
    /// budget is spent.
    async fn recover_interrupted(
        &self,
        now: Timestamp,
        policies: &PolicyRegistry,
    ) -> StoreResult<Vec<OperationId>>;

    async fn save_conflict(&self, record: ConflictRecord) -> StoreResult<()>;

    async fn get_conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>>;

    async fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>>;

    /// Settle a parked record; resumes its operation once all are settled.
    async fn resolve_conflict(
        &self,
        id: &str,
        value: Value,
        now: Timestamp,
    ) -> StoreResult<ManualResolution>;

    /// Persist anything held only in memory.
    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

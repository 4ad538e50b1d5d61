//! In-memory store with optional snapshot persistence.
//!
//! Used when no database is configured and the memory backend was chosen
//! explicitly. Work survives a restart only if a snapshot path is set and the
//! agent shut down cleanly.

use super::{OperationStore, StoreResult};
use async_trait::async_trait;
use lifeline_engine::{
    Admitted, ConflictRecord, ManualResolution, MemoryQueue, Operation, OperationId,
    OperationKind, OperationPatch, OperationStatus, PolicyRegistry, QueueSnapshot,
    ScheduleOutcome, Timestamp,
};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// [`OperationStore`] over an engine [`MemoryQueue`].
#[derive(Debug)]
pub struct MemoryStore {
    queue: Mutex<MemoryQueue>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Mutex::new(MemoryQueue::new(max_size)),
            snapshot_path: None,
        }
    }

    /// Create a store backed by a snapshot file, loading it if present.
    pub async fn open(max_size: usize, snapshot_path: PathBuf) -> StoreResult<Self> {
        let mut queue = MemoryQueue::new(max_size);

        match tokio::fs::read_to_string(&snapshot_path).await {
            Ok(json) => {
                let snapshot = QueueSnapshot::from_json(&json)?;
                tracing::info!(
                    path = %snapshot_path.display(),
                    operations = snapshot.operation_count(),
                    "Loaded queue snapshot"
                );
                queue.import_snapshot(snapshot)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %snapshot_path.display(), "No queue snapshot, starting empty");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            queue: Mutex::new(queue),
            snapshot_path: Some(snapshot_path),
        })
    }
}

/// Listings come back in insertion order, like the sqlite store's.
fn by_seq(mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by_key(|op| op.seq);
    ops
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn enqueue(&self, mut op: Operation) -> StoreResult<Admitted> {
        let mut queue = self.queue.lock().await;
        op.seq = queue.allocate_seq();
        Ok(queue.insert(op)?)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Operation>> {
        Ok(self.queue.lock().await.get(id).cloned())
    }

    async fn schedule(
        &self,
        kind: Option<OperationKind>,
        now: Timestamp,
    ) -> StoreResult<ScheduleOutcome> {
        let queue = self.queue.lock().await;
        Ok(match kind {
            Some(kind) => queue.schedule_kind(kind, now),
            None => queue.schedule(now),
        })
    }

    async fn list_by_kind(&self, kind: OperationKind) -> StoreResult<Vec<Operation>> {
        let queue = self.queue.lock().await;
        Ok(by_seq(queue.list_by_kind(kind).into_iter().cloned().collect()))
    }

    async fn list_by_status(&self, status: OperationStatus) -> StoreResult<Vec<Operation>> {
        let queue = self.queue.lock().await;
        Ok(by_seq(queue.list_by_status(status).into_iter().cloned().collect()))
    }

    async fn list_all(&self) -> StoreResult<Vec<Operation>> {
        Ok(by_seq(self.queue.lock().await.iter().cloned().collect()))
    }

    async fn update(&self, id: &str, patch: OperationPatch) -> StoreResult<Operation> {
        Ok(self.queue.lock().await.update(id, patch)?)
    }

    async fn park(
        &self,
        id: &str,
        records: Vec<ConflictRecord>,
        patch: OperationPatch,
    ) -> StoreResult<Operation> {
        Ok(self.queue.lock().await.park(id, records, patch)?)
    }

    async fn delete(&self, id: &str) -> StoreResult<Option<Operation>> {
        Ok(self.queue.lock().await.delete(id))
    }

    async fn cancel(&self, id: &str) -> StoreResult<Operation> {
        Ok(self.queue.lock().await.cancel(id)?)
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.queue.lock().await.len())
    }

    async fn purge_terminal(
        &self,
        now: Timestamp,
        retention_ms: u64,
    ) -> StoreResult<Vec<OperationId>> {
        Ok(self.queue.lock().await.purge_terminal(now, retention_ms))
    }

    async fn recover_interrupted(
        &self,
        now: Timestamp,
        policies: &PolicyRegistry,
    ) -> StoreResult<Vec<OperationId>> {
        Ok(self.queue.lock().await.recover_interrupted(now, policies)?)
    }

    async fn save_conflict(&self, record: ConflictRecord) -> StoreResult<()> {
        self.queue.lock().await.save_conflict(record);
        Ok(())
    }

    async fn get_conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>> {
        Ok(self.queue.lock().await.get_conflict(id).cloned())
    }

    async fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        let queue = self.queue.lock().await;
        Ok(queue.list_conflicts().into_iter().cloned().collect())
    }

    async fn resolve_conflict(
        &self,
        id: &str,
        value: Value,
        now: Timestamp,
    ) -> StoreResult<ManualResolution> {
        Ok(self.queue.lock().await.resolve_conflict(id, value, now)?)
    }

    async fn flush(&self) -> StoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let json = self.queue.lock().await.export_snapshot().to_json_pretty()?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        tracing::info!(path = %path.display(), "Wrote queue snapshot");
        Ok(())
    }
}

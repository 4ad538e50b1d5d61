//! sqlite-backed store.
//!
//! Each operation is kept as a JSON document alongside the indexed columns
//! used for scans (priority, status, kind, timestamps). Every mutation runs
//! in its own `BEGIN IMMEDIATE` transaction, and the engine's state machine is
//! applied to the freshly loaded row inside that transaction.

use super::{OperationStore, Pool, StoreResult};
use async_trait::async_trait;
use lifeline_engine::{
    is_past_retention, manual_progress, plan_evictions, Admitted, ConflictRecord, Error,
    ManualResolution, Operation, OperationId, OperationKind, OperationPatch, OperationStatus,
    PolicyRegistry, PriorityScheduler, RetryController, ScheduleOutcome, Timestamp,
};
use serde_json::Value;
use sqlx::{Sqlite, SqliteConnection, Transaction};

const LIVE: &str = "status IN ('pending', 'processing', 'retry_scheduled')";
const TERMINAL: &str = "status IN ('delivered', 'failed', 'expired')";

/// [`OperationStore`] over a sqlite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
    max_size: usize,
}

impl SqliteStore {
    /// Wrap a pool whose migrations have already run.
    pub fn new(pool: Pool, max_size: usize) -> Self {
        Self { pool, max_size }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Start a write transaction holding the database write lock.
    ///
    /// A deferred transaction that reads first cannot upgrade while another
    /// connection holds the lock; sqlite then fails it with `SQLITE_BUSY`
    /// without waiting out the busy timeout.
    async fn begin_write(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

/// Timestamps are u64 milliseconds; sqlite integers are i64.
fn db_ts(ts: Timestamp) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

fn decode_ops(rows: Vec<String>) -> StoreResult<Vec<Operation>> {
    rows.iter()
        .map(|data| serde_json::from_str(data).map_err(Into::into))
        .collect()
}

fn decode_conflicts(rows: Vec<String>) -> StoreResult<Vec<ConflictRecord>> {
    rows.iter()
        .map(|data| serde_json::from_str(data).map_err(Into::into))
        .collect()
}

async fn load_op(conn: &mut SqliteConnection, id: &str) -> StoreResult<Option<Operation>> {
    let data: Option<String> = sqlx::query_scalar("SELECT data FROM operations WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(data.map(|data| serde_json::from_str(&data)).transpose()?)
}

async fn require_op(conn: &mut SqliteConnection, id: &str) -> StoreResult<Operation> {
    load_op(conn, id)
        .await?
        .ok_or_else(|| Error::OperationNotFound(id.to_string()).into())
}

async fn write_op(conn: &mut SqliteConnection, op: &Operation) -> StoreResult<()> {
    let data = serde_json::to_string(op)?;
    sqlx::query(
        r#"
        INSERT INTO operations
            (id, kind, priority, status, seq, queued_at, next_attempt_at, expires_at, completed_at, data)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            next_attempt_at = excluded.next_attempt_at,
            completed_at = excluded.completed_at,
            data = excluded.data
        "#,
    )
    .bind(&op.id)
    .bind(op.kind.as_str())
    .bind(i64::from(op.priority.rank()))
    .bind(op.status.as_str())
    .bind(db_ts(op.seq))
    .bind(db_ts(op.queued_at))
    .bind(op.next_attempt_at.map(db_ts))
    .bind(db_ts(op.expires_at))
    .bind(op.completed_at.map(db_ts))
    .bind(data)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Write a patched operation; terminal operations drop their conflict records.
async fn store_op(conn: &mut SqliteConnection, op: &Operation) -> StoreResult<()> {
    write_op(conn, op).await?;
    if op.is_terminal() {
        sqlx::query("DELETE FROM conflicts WHERE operation_id = ?")
            .bind(&op.id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn remove_op(conn: &mut SqliteConnection, id: &str) -> StoreResult<()> {
    sqlx::query("DELETE FROM conflicts WHERE operation_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM operations WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn load_conflict(conn: &mut SqliteConnection, id: &str) -> StoreResult<Option<ConflictRecord>> {
    let data: Option<String> = sqlx::query_scalar("SELECT data FROM conflicts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(data.map(|data| serde_json::from_str(&data)).transpose()?)
}

async fn write_conflict(conn: &mut SqliteConnection, record: &ConflictRecord) -> StoreResult<()> {
    let data = serde_json::to_string(record)?;
    sqlx::query(
        r#"
        INSERT INTO conflicts (id, operation_id, resolved_at, detected_at, data)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            resolved_at = excluded.resolved_at,
            data = excluded.data
        "#,
    )
    .bind(&record.id)
    .bind(record.operation_id.as_deref())
    .bind(record.resolved_at.map(db_ts))
    .bind(db_ts(record.detected_at))
    .bind(data)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl OperationStore for SqliteStore {
    async fn enqueue(&self, mut op: Operation) -> StoreResult<Admitted> {
        let mut tx = self.begin_write().await?;

        let rows: Vec<String> = sqlx::query_scalar("SELECT data FROM operations")
            .fetch_all(&mut *tx)
            .await?;
        let existing = decode_ops(rows)?;
        if existing.iter().any(|other| other.id == op.id) {
            return Err(Error::DuplicateOperation(op.id).into());
        }

        let victims = plan_evictions(&existing, &op, self.max_size)?;
        let mut evicted = Vec::with_capacity(victims.len());
        for id in &victims {
            remove_op(&mut tx, id).await?;
            if let Some(victim) = existing.iter().find(|other| &other.id == id) {
                evicted.push(victim.clone());
            }
        }

        let next_seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM operations")
            .fetch_one(&mut *tx)
            .await?;
        op.seq = u64::try_from(next_seq).unwrap_or(1);
        write_op(&mut tx, &op).await?;

        tx.commit().await?;
        Ok(Admitted { id: op.id, evicted })
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Operation>> {
        let mut conn = self.pool.acquire().await?;
        load_op(&mut conn, id).await
    }

    async fn schedule(
        &self,
        kind: Option<OperationKind>,
        now: Timestamp,
    ) -> StoreResult<ScheduleOutcome> {
        let rows: Vec<String> = match kind {
            Some(kind) => {
                sqlx::query_scalar(&format!("SELECT data FROM operations WHERE kind = ? AND {LIVE}"))
                    .bind(kind.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar(&format!("SELECT data FROM operations WHERE {LIVE}"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        let ops = decode_ops(rows)?;
        Ok(PriorityScheduler::next(&ops, now))
    }

    async fn list_by_kind(&self, kind: OperationKind) -> StoreResult<Vec<Operation>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT data FROM operations WHERE kind = ? ORDER BY seq")
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?;
        decode_ops(rows)
    }

    async fn list_by_status(&self, status: OperationStatus) -> StoreResult<Vec<Operation>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT data FROM operations WHERE status = ? ORDER BY seq")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        decode_ops(rows)
    }

    async fn list_all(&self) -> StoreResult<Vec<Operation>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT data FROM operations ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        decode_ops(rows)
    }

    async fn update(&self, id: &str, patch: OperationPatch) -> StoreResult<Operation> {
        let mut tx = self.begin_write().await?;
        let mut op = require_op(&mut tx, id).await?;
        op.apply_patch(patch)?;
        store_op(&mut tx, &op).await?;
        tx.commit().await?;
        Ok(op)
    }

    async fn park(
        &self,
        id: &str,
        records: Vec<ConflictRecord>,
        patch: OperationPatch,
    ) -> StoreResult<Operation> {
        let mut tx = self.begin_write().await?;
        let mut op = require_op(&mut tx, id).await?;
        op.apply_patch(patch)?;
        store_op(&mut tx, &op).await?;
        for record in &records {
            write_conflict(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(op)
    }

    async fn delete(&self, id: &str) -> StoreResult<Option<Operation>> {
        let mut tx = self.begin_write().await?;
        let op = load_op(&mut tx, id).await?;
        if op.is_some() {
            remove_op(&mut tx, id).await?;
        }
        tx.commit().await?;
        Ok(op)
    }

    async fn cancel(&self, id: &str) -> StoreResult<Operation> {
        let mut tx = self.begin_write().await?;
        let op = require_op(&mut tx, id).await?;
        if !op.is_cancellable() {
            return Err(Error::NotCancellable {
                id: id.to_string(),
                status: op.status,
            }
            .into());
        }
        remove_op(&mut tx, id).await?;
        tx.commit().await?;
        Ok(op)
    }

    async fn count(&self) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operations")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn purge_terminal(
        &self,
        now: Timestamp,
        retention_ms: u64,
    ) -> StoreResult<Vec<OperationId>> {
        let mut tx = self.begin_write().await?;
        let rows: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT data FROM operations WHERE {TERMINAL} AND completed_at IS NOT NULL"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let stale: Vec<OperationId> = decode_ops(rows)?
            .into_iter()
            .filter(|op| is_past_retention(op, now, retention_ms))
            .map(|op| op.id)
            .collect();
        for id in &stale {
            remove_op(&mut tx, id).await?;
        }

        tx.commit().await?;
        Ok(stale)
    }

    async fn recover_interrupted(
        &self,
        now: Timestamp,
        policies: &PolicyRegistry,
    ) -> StoreResult<Vec<OperationId>> {
        let controller = RetryController::new(policies);
        let mut tx = self.begin_write().await?;
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT data FROM operations WHERE status = 'processing'")
                .fetch_all(&mut *tx)
                .await?;

        let mut recovered = Vec::new();
        for mut op in decode_ops(rows)? {
            let patch = controller.recover(&op, now);
            op.apply_patch(patch)?;
            store_op(&mut tx, &op).await?;
            recovered.push(op.id);
        }

        tx.commit().await?;
        Ok(recovered)
    }

    async fn save_conflict(&self, record: ConflictRecord) -> StoreResult<()> {
        let mut tx = self.begin_write().await?;
        write_conflict(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>> {
        let mut conn = self.pool.acquire().await?;
        load_conflict(&mut conn, id).await
    }

    async fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT data FROM conflicts ORDER BY detected_at, id")
                .fetch_all(&self.pool)
                .await?;
        decode_conflicts(rows)
    }

    async fn resolve_conflict(
        &self,
        id: &str,
        value: Value,
        now: Timestamp,
    ) -> StoreResult<ManualResolution> {
        let mut tx = self.begin_write().await?;

        let mut record = load_conflict(&mut tx, id)
            .await?
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        if record.is_resolved() {
            return Err(Error::AlreadyResolved(id.to_string()).into());
        }
        record.settle(value, now);
        write_conflict(&mut tx, &record).await?;

        let op = match record.operation_id.as_deref() {
            Some(op_id) => load_op(&mut tx, op_id).await?,
            None => None,
        };

        let Some(mut op) = op.filter(Operation::is_parked) else {
            let operation = match record.operation_id.as_deref() {
                Some(op_id) => load_op(&mut tx, op_id).await?,
                None => None,
            };
            tx.commit().await?;
            return Ok(ManualResolution {
                record,
                operation,
                resumed: false,
            });
        };

        let mut owned = Vec::with_capacity(op.pending_conflicts.len());
        for conflict_id in &op.pending_conflicts {
            if let Some(owned_record) = load_conflict(&mut tx, conflict_id).await? {
                owned.push(owned_record);
            }
        }

        op.apply_patch(manual_progress(&op, &owned, now))?;
        write_op(&mut tx, &op).await?;

        let resumed = op.pending_conflicts.is_empty();
        if resumed {
            for settled in &owned {
                sqlx::query("DELETE FROM conflicts WHERE id = ?")
                    .bind(&settled.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(ManualResolution {
            record,
            operation: Some(op),
            resumed,
        })
    }
}

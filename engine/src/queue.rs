//! In-memory operation queue.
//!
//! `MemoryQueue` owns operations and parked conflict records and enforces
//! the queue's invariants on every mutation: unique ids, admission control,
//! the status state machine, and cancellation only while pending. It is
//! the reference store; durable backends reproduce the same behavior.

use crate::conflict::{manual_progress, ConflictRecord};
use crate::snapshot::{QueueSnapshot, SNAPSHOT_FORMAT_VERSION};
use crate::{
    admission, error::Result, Error, Operation, OperationId, OperationKind, OperationPatch,
    OperationStatus, PolicyRegistry, PriorityScheduler, RetryController, ScheduleOutcome,
    Timestamp,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Result of settling a parked conflict record.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualResolution {
    pub record: ConflictRecord,
    /// The owning operation after the update, if it still exists
    pub operation: Option<Operation>,
    /// Every record of the operation is settled and it is due again
    pub resumed: bool,
}

/// Result of inserting an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub id: OperationId,
    /// Operations removed to make room
    pub evicted: Vec<Operation>,
}

/// The in-memory queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    ops: BTreeMap<OperationId, Operation>,
    conflicts: BTreeMap<String, ConflictRecord>,
    next_seq: u64,
    max_size: usize,
}

impl MemoryQueue {
    /// Create an empty queue holding at most `max_size` operations.
    pub fn new(max_size: usize) -> Self {
        Self {
            ops: BTreeMap::new(),
            conflicts: BTreeMap::new(),
            next_seq: 1,
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Hand out the next insertion sequence number.
    pub fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert an admitted operation, evicting lower-priority work if full.
    pub fn insert(&mut self, op: Operation) -> Result<Admitted> {
        if self.ops.contains_key(&op.id) {
            return Err(Error::DuplicateOperation(op.id));
        }

        let victims = admission::plan_evictions(self.ops.values(), &op, self.max_size)?;
        let evicted = victims
            .iter()
            .filter_map(|id| self.delete(id))
            .collect();

        self.next_seq = self.next_seq.max(op.seq.saturating_add(1));
        let id = op.id.clone();
        self.ops.insert(id.clone(), op);

        Ok(Admitted { id, evicted })
    }

    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.ops.get(id)
    }

    /// Apply a patch through the state machine and return the new state.
    ///
    /// An operation that reaches a terminal status drops its conflict records.
    pub fn update(&mut self, id: &str, patch: OperationPatch) -> Result<Operation> {
        let op = self
            .ops
            .get_mut(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        op.apply_patch(patch)?;
        let op = op.clone();
        if op.is_terminal() {
            self.conflicts
                .retain(|_, record| record.operation_id.as_deref() != Some(id));
        }
        Ok(op)
    }

    /// Park an operation and store its conflict records in one step.
    ///
    /// Nothing is stored when the patch is rejected.
    pub fn park(
        &mut self,
        id: &str,
        records: Vec<ConflictRecord>,
        patch: OperationPatch,
    ) -> Result<Operation> {
        let op = self.update(id, patch)?;
        for record in records {
            self.save_conflict(record);
        }
        Ok(op)
    }

    /// Remove an operation and any conflict records it owns.
    pub fn delete(&mut self, id: &str) -> Option<Operation> {
        let op = self.ops.remove(id)?;
        self.conflicts
            .retain(|_, record| record.operation_id.as_deref() != Some(id));
        Some(op)
    }

    /// Withdraw an operation that has not started processing.
    pub fn cancel(&mut self, id: &str) -> Result<Operation> {
        let op = self
            .ops
            .get(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        if !op.is_cancellable() {
            return Err(Error::NotCancellable {
                id: id.to_string(),
                status: op.status,
            });
        }
        self.delete(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.values()
    }

    /// Scheduling view over every operation.
    pub fn schedule(&self, now: Timestamp) -> ScheduleOutcome {
        PriorityScheduler::next(self.ops.values(), now)
    }

    /// Scheduling view restricted to one kind.
    pub fn schedule_kind(&self, kind: OperationKind, now: Timestamp) -> ScheduleOutcome {
        PriorityScheduler::next(self.ops.values().filter(|op| op.kind == kind), now)
    }

    /// Eligible operations in dispatch order.
    pub fn list_eligible(&self, now: Timestamp) -> Vec<Operation> {
        self.schedule(now).eligible
    }

    pub fn list_by_kind(&self, kind: OperationKind) -> Vec<&Operation> {
        self.ops.values().filter(|op| op.kind == kind).collect()
    }

    pub fn list_by_status(&self, status: OperationStatus) -> Vec<&Operation> {
        self.ops.values().filter(|op| op.status == status).collect()
    }

    /// Drop terminal operations whose audit window has passed.
    pub fn purge_terminal(&mut self, now: Timestamp, retention_ms: u64) -> Vec<OperationId> {
        let stale: Vec<OperationId> = self
            .ops
            .values()
            .filter(|op| is_past_retention(op, now, retention_ms))
            .map(|op| op.id.clone())
            .collect();

        for id in &stale {
            self.delete(id);
        }
        stale
    }

    /// Make operations interrupted mid-attempt eligible again.
    ///
    /// The interrupted attempt stays counted; operations whose budget is
    /// spent are dead-lettered.
    pub fn recover_interrupted(
        &mut self,
        now: Timestamp,
        registry: &PolicyRegistry,
    ) -> Result<Vec<OperationId>> {
        let controller = RetryController::new(registry);
        let interrupted: Vec<(OperationId, OperationPatch)> = self
            .list_by_status(OperationStatus::Processing)
            .into_iter()
            .map(|op| (op.id.clone(), controller.recover(op, now)))
            .collect();

        let mut recovered = Vec::with_capacity(interrupted.len());
        for (id, patch) in interrupted {
            self.update(&id, patch)?;
            recovered.push(id);
        }
        Ok(recovered)
    }

    /// Persist a record awaiting manual resolution.
    pub fn save_conflict(&mut self, record: ConflictRecord) {
        self.conflicts.insert(record.id.clone(), record);
    }

    pub fn get_conflict(&self, id: &str) -> Option<&ConflictRecord> {
        self.conflicts.get(id)
    }

    pub fn list_conflicts(&self) -> Vec<&ConflictRecord> {
        self.conflicts.values().collect()
    }

    /// Settle a parked record with a human decision.
    ///
    /// Once every record of the owning operation is settled, the operation
    /// takes the resolved tree as its payload, becomes due immediately and
    /// its records are dropped.
    pub fn resolve_conflict(
        &mut self,
        id: &str,
        value: Value,
        now: Timestamp,
    ) -> Result<ManualResolution> {
        let record = self
            .conflicts
            .get_mut(id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        if record.is_resolved() {
            return Err(Error::AlreadyResolved(id.to_string()));
        }
        record.settle(value, now);
        let record = record.clone();

        let Some(op) = record
            .operation_id
            .as_deref()
            .and_then(|op_id| self.ops.get(op_id))
            .filter(|op| op.is_parked())
        else {
            let operation = record
                .operation_id
                .as_deref()
                .and_then(|op_id| self.ops.get(op_id))
                .cloned();
            return Ok(ManualResolution {
                record,
                operation,
                resumed: false,
            });
        };

        let owned: Vec<ConflictRecord> = op
            .pending_conflicts
            .iter()
            .filter_map(|cid| self.conflicts.get(cid).cloned())
            .collect();
        let op_id = op.id.clone();
        let patch = manual_progress(op, &owned, now);
        let operation = self.update(&op_id, patch)?;

        let resumed = operation.pending_conflicts.is_empty();
        if resumed {
            for settled in &owned {
                self.conflicts.remove(&settled.id);
            }
        }

        Ok(ManualResolution {
            record,
            operation: Some(operation),
            resumed,
        })
    }

    /// Export the current state as a snapshot.
    pub fn export_snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            next_seq: self.next_seq,
            operations: self.ops.clone(),
            conflicts: self.conflicts.clone(),
        }
    }

    /// Replace the current state with a snapshot's.
    pub fn import_snapshot(&mut self, snapshot: QueueSnapshot) -> Result<()> {
        snapshot.validate()?;
        self.ops = snapshot.operations;
        self.conflicts = snapshot.conflicts;
        self.next_seq = snapshot.next_seq;
        Ok(())
    }
}

/// Terminal and older than `completed_at + retention`.
pub fn is_past_retention(op: &Operation, now: Timestamp, retention_ms: u64) -> bool {
    op.is_terminal()
        && op
            .completed_at
            .is_some_and(|done| done.saturating_add(retention_ms) < now)
}

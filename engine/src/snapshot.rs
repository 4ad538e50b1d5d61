//! Snapshot types for persisting and restoring queue state.
//!
//! Snapshots are the bridge between the in-memory queue and a file on disk.
//! They use `BTreeMap`s so serialization order is deterministic.

use crate::conflict::ConflictRecord;
use crate::{error::Result, Error, Operation, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Next insertion sequence to hand out
    pub next_seq: u64,
    /// Operations by ID, terminal audit entries included
    pub operations: BTreeMap<OperationId, Operation>,
    /// Conflict records awaiting a human, by record ID
    #[serde(default)]
    pub conflicts: BTreeMap<String, ConflictRecord>,
}

impl QueueSnapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            next_seq: 1,
            ..Self::default()
        }
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Check internal consistency before the snapshot is loaded.
    pub fn validate(&self) -> Result<()> {
        for (id, op) in &self.operations {
            if id != &op.id {
                return Err(Error::InvalidSnapshot(format!(
                    "operation stored under {id} has id {}",
                    op.id
                )));
            }
            if op.expires_at <= op.queued_at {
                return Err(Error::InvalidSnapshot(format!(
                    "operation {id} expires before it was queued"
                )));
            }
            if op.seq >= self.next_seq {
                return Err(Error::InvalidSnapshot(format!(
                    "operation {id} has seq {} but next seq is {}",
                    op.seq, self.next_seq
                )));
            }
            if let Some(missing) = op
                .pending_conflicts
                .iter()
                .find(|conflict| !self.conflicts.contains_key(*conflict))
            {
                return Err(Error::InvalidSnapshot(format!(
                    "operation {id} references unknown conflict {missing}"
                )));
            }
        }

        for (id, record) in &self.conflicts {
            if id != &record.id {
                return Err(Error::InvalidSnapshot(format!(
                    "conflict stored under {id} has id {}",
                    record.id
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}

//! # Lifeline Engine
//!
//! The deterministic core of an offline-first operation queue.
//!
//! A client that loses connectivity keeps accepting state-changing work
//! (donation responses, profile edits, availability toggles, notification
//! receipts). This crate decides what happens to that work: how it is
//! admitted, in what order it is replayed, when a failed attempt is retried
//! or dead-lettered, and how client and server state are reconciled when
//! they diverge.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing about files, sockets or clocks on
//!   the wall; time is passed in
//! - **Deterministic**: same inputs, same outputs (backoff has no jitter,
//!   maps are ordered)
//! - **Testable**: pure logic, with [`ManualClock`] for time-driven tests
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! An [`Operation`] moves through a small state machine:
//!
//! ```text
//! pending ──► processing ──► delivered
//!                 │    ├──► failed        (dead-letter)
//!                 │    └──► retry_scheduled ──► processing
//!                 └─────────────────────────────► expired
//! ```
//!
//! Every change goes through [`Operation::apply_patch`], which refuses
//! illegal transitions and attempt regressions.
//!
//! ### Policies
//!
//! A [`PolicyRegistry`] maps each [`OperationKind`] to a [`TypePolicy`]:
//! TTL, [`RetryPolicy`], [`ConflictPolicy`], [`PayloadShape`] and upstream
//! [`Endpoint`].
//!
//! ### Scheduling
//!
//! [`PriorityScheduler::next`] orders eligible work by priority rank, then
//! queue time, then insertion order, and reports operations observed past
//! their expiry.
//!
//! ### Conflicts
//!
//! [`ConflictResolver`] diffs two JSON trees into [`ConflictRecord`]s and
//! settles each with `last_write_wins`, `server_wins`, `client_wins`,
//! `merge` or `user_choice`.
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeline_engine::{
//!     EnqueueRequest, MemoryQueue, OperationKind, OperationPatch, PolicyRegistry, Priority,
//! };
//! use serde_json::json;
//!
//! let registry = PolicyRegistry::default();
//! let mut queue = MemoryQueue::new(500);
//!
//! let request = EnqueueRequest::new(
//!     OperationKind::Respond,
//!     json!({"requestId": "req-1", "accepted": true}),
//! )
//! .with_priority(Priority::Critical);
//!
//! let seq = queue.allocate_seq();
//! let op = registry.admit(&request, "op-1", seq, 1_000).unwrap();
//! queue.insert(op).unwrap();
//!
//! let next = queue.list_eligible(1_000);
//! assert_eq!(next[0].id, "op-1");
//!
//! queue.update("op-1", OperationPatch::begin_attempt(&next[0], 1_000)).unwrap();
//! let done = queue.update("op-1", OperationPatch::deliver(1_200, None)).unwrap();
//! assert!(done.is_terminal());
//! ```
//!
//! ## Persistence
//!
//! Use [`MemoryQueue::export_snapshot`] and [`MemoryQueue::import_snapshot`]
//! with [`QueueSnapshot`]. Snapshots serialize to JSON with deterministic
//! ordering.

pub mod admission;
pub mod clock;
pub mod conflict;
pub mod error;
pub mod operation;
pub mod policy;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod shape;
pub mod snapshot;

// Re-export main types at crate root
pub use admission::plan_evictions;
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{
    diff_leaves, get_path, manual_progress, merge_trees, set_path, ArrayMerge, ConflictPolicy,
    ConflictRecord, ConflictResolver, ConflictStrategy, LeafDiff, Reconciliation, Resolution,
    ResolveContext,
};
pub use error::Error;
pub use operation::{
    EnqueueRequest, Operation, OperationId, OperationKind, OperationMetadata, OperationPatch,
    OperationStatus, Priority, PARKED,
};
pub use policy::{Endpoint, PolicyRegistry, TypePolicy};
pub use queue::{is_past_retention, Admitted, ManualResolution, MemoryQueue};
pub use retry::{backoff, BackoffPolicy, Failure, RetryController, RetryDecision, RetryPolicy};
pub use scheduler::{dispatch_order, is_eligible, PriorityScheduler, ScheduleOutcome};
pub use shape::{FieldDef, FieldType, PayloadShape};
pub use snapshot::{QueueSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

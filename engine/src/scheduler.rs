//! Selection of the next batch of work.
//!
//! The scheduler is a pure function over a snapshot of the queue. It never
//! mutates anything; expired operations are reported back so the caller can
//! persist the `expired` transition.

use crate::{Operation, OperationId, OperationStatus, Timestamp};
use std::cmp::Ordering;

/// Result of one scheduling decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleOutcome {
    /// Dispatch order: priority rank, then queue time, then insertion order
    pub eligible: Vec<Operation>,
    /// Non-terminal operations observed past their expiry
    pub expired: Vec<OperationId>,
}

impl ScheduleOutcome {
    pub fn is_idle(&self) -> bool {
        self.eligible.is_empty() && self.expired.is_empty()
    }
}

/// Orders eligible operations for dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityScheduler;

impl PriorityScheduler {
    /// Select eligible operations at `now` in dispatch order.
    pub fn next<'a, I>(ops: I, now: Timestamp) -> ScheduleOutcome
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        let mut outcome = ScheduleOutcome::default();

        for op in ops {
            if op.is_terminal() {
                continue;
            }
            if op.is_expired_at(now) {
                outcome.expired.push(op.id.clone());
                continue;
            }
            if is_ready(op, now) {
                outcome.eligible.push(op.clone());
            }
        }

        outcome.eligible.sort_by(dispatch_order);
        outcome
    }

    /// Earliest future time at which a scheduled retry becomes due.
    pub fn next_wake<'a, I>(ops: I, now: Timestamp) -> Option<Timestamp>
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        ops.into_iter()
            .filter(|op| op.status == OperationStatus::RetryScheduled && !op.is_parked())
            .filter_map(|op| op.next_attempt_at)
            .filter(|at| *at > now)
            .min()
    }
}

/// Status and retry time allow dispatch. Expiry is checked separately.
fn is_ready(op: &Operation, now: Timestamp) -> bool {
    match op.status {
        OperationStatus::Pending => true,
        OperationStatus::RetryScheduled => {
            !op.is_parked() && op.next_attempt_at.is_some_and(|at| at <= now)
        }
        _ => false,
    }
}

/// Full eligibility predicate.
pub fn is_eligible(op: &Operation, now: Timestamp) -> bool {
    !op.is_terminal() && !op.is_expired_at(now) && is_ready(op, now)
}

/// Comparator for dispatch order.
pub fn dispatch_order(a: &Operation, b: &Operation) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then(a.queued_at.cmp(&b.queued_at))
        .then(a.seq.cmp(&b.seq))
}

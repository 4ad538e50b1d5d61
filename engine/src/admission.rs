//! Admission control for a bounded queue.
//!
//! When admitting one more operation would exceed the cap, room is made by
//! evicting, in order:
//!
//! 1. terminal operations kept only for audit, oldest completion first;
//! 2. live operations from the lowest-priority tier, oldest first, but only
//!    from tiers ranked no higher than the incoming operation.
//!
//! In-flight (`processing`) operations are never evicted. If not enough
//! room can be made the incoming operation is refused.

use crate::error::Result;
use crate::{Error, Operation, OperationId, OperationStatus};
use std::cmp::Reverse;

/// Plan which operations to evict so that `incoming` fits under `cap`.
pub fn plan_evictions<'a, I>(existing: I, incoming: &Operation, cap: usize) -> Result<Vec<OperationId>>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let existing: Vec<&Operation> = existing.into_iter().collect();
    let need = (existing.len() + 1).saturating_sub(cap);
    if need == 0 {
        return Ok(Vec::new());
    }

    let mut audit: Vec<&Operation> = existing.iter().copied().filter(|op| op.is_terminal()).collect();
    audit.sort_by_key(|op| (op.completed_at.unwrap_or(op.queued_at), op.seq));

    let incoming_rank = incoming.priority.rank();
    let mut live: Vec<&Operation> = existing
        .iter()
        .copied()
        .filter(|op| !op.is_terminal() && op.status != OperationStatus::Processing)
        .filter(|op| op.priority.rank() >= incoming_rank)
        .collect();
    live.sort_by_key(|op| (Reverse(op.priority.rank()), op.queued_at, op.seq));

    let victims: Vec<OperationId> = audit
        .into_iter()
        .chain(live)
        .take(need)
        .map(|op| op.id.clone())
        .collect();

    if victims.len() < need {
        return Err(Error::QueueFull(format!(
            "cannot admit {} operation {}: {} of {} slots held by higher-priority or in-flight work",
            incoming.priority,
            incoming.id,
            existing.len() - victims.len(),
            cap
        )));
    }

    Ok(victims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OperationKind, OperationPatch, Priority};
    use serde_json::json;

    fn op(id: &str, priority: Priority, seq: u64) -> Operation {
        Operation::new(
            id,
            OperationKind::NotificationDelivery,
            json!({"notificationId": id}),
            priority,
            seq,
            seq * 10,
            1_000_000,
        )
    }

    #[test]
    fn room_left_means_no_evictions() {
        let existing = vec![op("a", Priority::Low, 1)];
        let plan = plan_evictions(&existing, &op("b", Priority::Low, 2), 2).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn critical_displaces_oldest_low() {
        let existing = vec![
            op("low-1", Priority::Low, 1),
            op("low-2", Priority::Low, 2),
            op("low-3", Priority::Low, 3),
        ];
        let plan = plan_evictions(&existing, &op("crit", Priority::Critical, 4), 3).unwrap();
        assert_eq!(plan, vec!["low-1".to_string()]);
    }

    #[test]
    fn lowest_tier_goes_first() {
        let existing = vec![
            op("normal", Priority::Normal, 1),
            op("low", Priority::Low, 2),
            op("high", Priority::High, 3),
        ];
        let plan = plan_evictions(&existing, &op("crit", Priority::Critical, 4), 3).unwrap();
        assert_eq!(plan, vec!["low".to_string()]);
    }

    #[test]
    fn never_evicts_higher_priority_for_lower() {
        let existing = vec![op("crit", Priority::Critical, 1), op("high", Priority::High, 2)];
        let err = plan_evictions(&existing, &op("low", Priority::Low, 3), 2).unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
    }

    #[test]
    fn audit_entries_go_before_live_work() {
        let mut done = op("done", Priority::Critical, 1);
        done.apply_patch(OperationPatch::begin_attempt(&done, 5)).unwrap();
        done.apply_patch(OperationPatch::deliver(6, None)).unwrap();

        let existing = vec![done, op("low", Priority::Low, 2)];
        let plan = plan_evictions(&existing, &op("new", Priority::Low, 3), 2).unwrap();
        assert_eq!(plan, vec!["done".to_string()]);
    }

    #[test]
    fn in_flight_is_protected() {
        let mut running = op("running", Priority::Low, 1);
        running.apply_patch(OperationPatch::begin_attempt(&running, 5)).unwrap();
        let err = plan_evictions([&running], &op("crit", Priority::Critical, 2), 1).unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
    }

    #[test]
    fn zero_cap_refuses_everything() {
        let none: Vec<Operation> = Vec::new();
        assert!(plan_evictions(&none, &op("x", Priority::Critical, 1), 0).is_err());
    }
}

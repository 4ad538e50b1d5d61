//! Edge case and scenario tests for lifeline-engine
//!
//! These drive the queue, scheduler, retry controller and conflict resolver
//! together the way the runtime does, with a manual clock.

use lifeline_engine::{
    Clock, ConflictPolicy, ConflictResolver, ConflictStrategy, EnqueueRequest, Error, Failure,
    ManualClock, MemoryQueue, OperationKind, OperationPatch, OperationStatus, PolicyRegistry,
    Priority, QueueSnapshot, RetryController, RetryDecision, RetryPolicy, TypePolicy, PARKED,
};
use serde_json::{json, Value};

fn respond_payload() -> Value {
    json!({"requestId": "req-1", "accepted": true})
}

fn enqueue(
    queue: &mut MemoryQueue,
    registry: &PolicyRegistry,
    id: &str,
    kind: OperationKind,
    payload: Value,
    priority: Priority,
    now: u64,
) -> Result<String, Error> {
    let request = EnqueueRequest::new(kind, payload).with_priority(priority);
    let seq = queue.allocate_seq();
    let op = registry.admit(&request, id, seq, now)?;
    Ok(queue.insert(op)?.id)
}

// ============================================================================
// Retry Scenarios
// ============================================================================

#[test]
fn emergency_response_retries_then_delivers() {
    let mut registry = PolicyRegistry::default();
    registry.set(
        OperationKind::Respond,
        TypePolicy {
            retry: RetryPolicy::exponential(1_000, 60_000, 3),
            ..registry.policy(OperationKind::Respond).clone()
        },
    );
    let clock = ManualClock::new(10_000);
    let mut queue = MemoryQueue::new(100);
    let request: EnqueueRequest = serde_json::from_value(json!({
        "type": "respond",
        "priority": "emergency",
        "payload": respond_payload(),
    }))
    .unwrap();
    let seq = queue.allocate_seq();
    let op = registry.admit(&request, "op-a", seq, clock.now()).unwrap();
    assert_eq!(op.priority, Priority::Critical);
    queue.insert(op).unwrap();

    let controller = RetryController::new(&registry);
    let mut deltas = Vec::new();

    for attempt in 1..=3u32 {
        let now = clock.now();
        let due = queue.list_eligible(now);
        assert_eq!(due.len(), 1, "attempt {attempt} should be due");
        let running = queue
            .update("op-a", OperationPatch::begin_attempt(&due[0], now))
            .unwrap();
        assert_eq!(running.attempts, attempt);

        if attempt < 3 {
            let decision =
                controller.decide(&running, &Failure::Retryable("503".into()), now);
            let scheduled = queue.update("op-a", decision.to_patch(now)).unwrap();
            let next = scheduled.next_attempt_at.unwrap();
            deltas.push(next - now);

            // Not due a millisecond early
            clock.set(next - 1);
            assert!(queue.list_eligible(clock.now()).is_empty());
            clock.set(next);
        } else {
            queue
                .update("op-a", OperationPatch::deliver(now, None))
                .unwrap();
        }
    }

    assert_eq!(deltas, vec![1_000, 2_000]);
    let done = queue.get("op-a").unwrap();
    assert_eq!(done.status, OperationStatus::Delivered);
    assert_eq!(done.attempts, 3);
    assert!(done.next_attempt_at.is_none());
}

#[test]
fn exhausted_budget_is_dead_lettered_and_never_rescheduled() {
    let mut registry = PolicyRegistry::default();
    registry.set(
        OperationKind::NotificationDelivery,
        TypePolicy {
            retry: RetryPolicy::fixed(10, 2),
            ..registry.policy(OperationKind::NotificationDelivery).clone()
        },
    );
    let controller = RetryController::new(&registry);
    let mut queue = MemoryQueue::new(100);
    enqueue(
        &mut queue,
        &registry,
        "n-1",
        OperationKind::NotificationDelivery,
        json!({"notificationId": "n-1"}),
        Priority::Normal,
        0,
    )
    .unwrap();

    let mut now = 0;
    loop {
        let due = queue.list_eligible(now);
        let Some(op) = due.first() else {
            now += 10;
            continue;
        };
        let running = queue
            .update(&op.id, OperationPatch::begin_attempt(op, now))
            .unwrap();
        let decision = controller.decide(&running, &Failure::Retryable("timeout".into()), now);
        let dead = decision.is_dead_letter();
        queue.update(&op.id, decision.to_patch(now)).unwrap();
        if dead {
            break;
        }
    }

    let failed = queue.get("n-1").unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.attempts, 2);
    for later in [now, now + 10, now + 1_000_000] {
        assert!(queue.list_eligible(later).is_empty());
    }
}

#[test]
fn permanent_failure_skips_budget() {
    let registry = PolicyRegistry::default();
    let controller = RetryController::new(&registry);
    let mut queue = MemoryQueue::new(10);
    enqueue(
        &mut queue,
        &registry,
        "r-1",
        OperationKind::Respond,
        respond_payload(),
        Priority::High,
        0,
    )
    .unwrap();

    let op = queue.get("r-1").unwrap().clone();
    let running = queue
        .update("r-1", OperationPatch::begin_attempt(&op, 1))
        .unwrap();
    let decision = controller.decide(&running, &Failure::Permanent("422".into()), 1);
    assert!(matches!(decision, RetryDecision::DeadLetter { .. }));

    let failed = queue.update("r-1", decision.to_patch(1)).unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.attempts, 1);
}

// ============================================================================
// Scheduling Edge Cases
// ============================================================================

#[test]
fn critical_and_low_at_same_timestamp() {
    let registry = PolicyRegistry::default();
    let mut queue = MemoryQueue::new(10);
    let payload = json!({"available": true});
    enqueue(&mut queue, &registry, "low", OperationKind::AvailabilityToggle, payload.clone(), Priority::Low, 500).unwrap();
    enqueue(&mut queue, &registry, "crit", OperationKind::AvailabilityToggle, payload, Priority::Critical, 500).unwrap();

    let order: Vec<String> = queue.list_eligible(500).into_iter().map(|op| op.id).collect();
    assert_eq!(order, vec!["crit".to_string(), "low".to_string()]);
}

#[test]
fn expiry_observed_at_exact_deadline() {
    let registry = PolicyRegistry::default();
    let mut queue = MemoryQueue::new(10);
    enqueue(
        &mut queue,
        &registry,
        "n",
        OperationKind::NotificationDelivery,
        json!({"notificationId": "n"}),
        Priority::Normal,
        0,
    )
    .unwrap();
    let expires_at = queue.get("n").unwrap().expires_at;

    assert_eq!(queue.schedule(expires_at - 1).eligible.len(), 1);
    let outcome = queue.schedule(expires_at);
    assert!(outcome.eligible.is_empty());
    assert_eq!(outcome.expired, vec!["n".to_string()]);

    let expired = queue.update("n", OperationPatch::expire(expires_at)).unwrap();
    assert_eq!(expired.status, OperationStatus::Expired);
    assert!(queue.schedule(expires_at + 1).is_idle());
}

#[test]
fn schedule_kind_isolates_queues() {
    let registry = PolicyRegistry::default();
    let mut queue = MemoryQueue::new(10);
    enqueue(&mut queue, &registry, "a", OperationKind::AvailabilityToggle, json!({"available": false}), Priority::Critical, 0).unwrap();
    enqueue(&mut queue, &registry, "r", OperationKind::Respond, respond_payload(), Priority::Low, 0).unwrap();

    let outcome = queue.schedule_kind(OperationKind::Respond, 1);
    assert_eq!(outcome.eligible.len(), 1);
    assert_eq!(outcome.eligible[0].id, "r");
}

// ============================================================================
// Admission Edge Cases
// ============================================================================

#[test]
fn capacity_evicts_only_low_priority() {
    let registry = PolicyRegistry::default();
    let mut queue = MemoryQueue::new(3);
    let payload = json!({"available": true});
    for (i, id) in ["low-1", "low-2", "low-3"].iter().enumerate() {
        enqueue(&mut queue, &registry, id, OperationKind::AvailabilityToggle, payload.clone(), Priority::Low, i as u64).unwrap();
    }
    enqueue(&mut queue, &registry, "crit", OperationKind::AvailabilityToggle, payload.clone(), Priority::Critical, 10).unwrap();

    assert_eq!(queue.len(), 3);
    assert!(queue.get("crit").is_some());
    assert!(queue.get("low-1").is_none());

    // Full of equal-or-higher work: another critical still displaces a low
    enqueue(&mut queue, &registry, "crit-2", OperationKind::AvailabilityToggle, payload.clone(), Priority::Critical, 11).unwrap();
    assert!(queue.get("low-2").is_none());
    assert!(queue.get("crit").is_some());

    // Equal tier can be displaced, higher tiers cannot
    enqueue(&mut queue, &registry, "low-4", OperationKind::AvailabilityToggle, payload.clone(), Priority::Low, 12).unwrap();
    assert!(queue.get("low-3").is_none());
    enqueue(&mut queue, &registry, "crit-3", OperationKind::AvailabilityToggle, payload.clone(), Priority::Critical, 13).unwrap();
    let err = enqueue(&mut queue, &registry, "low-5", OperationKind::AvailabilityToggle, payload, Priority::Low, 14).unwrap_err();
    assert!(matches!(err, Error::QueueFull(_)));
    assert_eq!(queue.len(), 3);
}

#[test]
fn invalid_requests_are_never_queued() {
    let registry = PolicyRegistry::default();
    let mut queue = MemoryQueue::new(10);

    let missing_payload: EnqueueRequest =
        serde_json::from_value(json!({"type": "respond"})).unwrap();
    let seq = queue.allocate_seq();
    assert!(registry.admit(&missing_payload, "x", seq, 0).unwrap_err().is_validation());

    let null_payload: EnqueueRequest =
        serde_json::from_value(json!({"type": "respond", "payload": null})).unwrap();
    assert!(registry.admit(&null_payload, "y", seq, 0).is_err());

    let wrong_type = EnqueueRequest::new(OperationKind::AvailabilityToggle, json!({"available": "yes"}));
    assert!(matches!(
        registry.admit(&wrong_type, "z", seq, 0),
        Err(Error::TypeMismatch { .. })
    ));

    assert!(queue.is_empty());
}

#[test]
fn unknown_type_rejected_at_parse() {
    let parsed: Result<EnqueueRequest, _> =
        serde_json::from_value(json!({"type": "teleport", "payload": {}}));
    assert!(parsed.is_err());
}

// ============================================================================
// Conflict Scenarios
// ============================================================================

#[test]
fn server_wins_for_email() {
    let mut registry = PolicyRegistry::default();
    registry.set(
        OperationKind::ProfileUpdate,
        TypePolicy {
            conflict: ConflictPolicy::with_default(ConflictStrategy::Merge)
                .with_field("profile.email", ConflictStrategy::ServerWins),
            ..TypePolicy::default()
        },
    );
    let resolver = ConflictResolver::new(&registry);
    let mut queue = MemoryQueue::new(10);
    enqueue(
        &mut queue,
        &registry,
        "p-1",
        OperationKind::ProfileUpdate,
        json!({"profile": {"email": "a@x.com"}}),
        Priority::Normal,
        0,
    )
    .unwrap();

    let op = queue.get("p-1").unwrap().clone();
    let running = queue
        .update("p-1", OperationPatch::begin_attempt(&op, 5))
        .unwrap();
    let result =
        resolver.reconcile_operation(&running, &json!({"profile": {"email": "b@x.com"}}), 6);
    assert_eq!(result.conflict_count(), 1);
    assert!(!result.needs_user());

    let delivered = queue
        .update("p-1", OperationPatch::deliver(6, Some(result.value)))
        .unwrap();
    assert_eq!(delivered.status, OperationStatus::Delivered);
    assert_eq!(
        delivered.resolved_value.unwrap()["profile"]["email"],
        json!("b@x.com")
    );
}

#[test]
fn user_choice_parks_until_resolved() {
    let mut registry = PolicyRegistry::default();
    registry.set(
        OperationKind::ProfileUpdate,
        TypePolicy {
            conflict: ConflictPolicy::with_default(ConflictStrategy::Merge)
                .with_field("bloodType", ConflictStrategy::UserChoice),
            ..TypePolicy::default()
        },
    );
    let resolver = ConflictResolver::new(&registry);
    let mut queue = MemoryQueue::new(10);
    enqueue(
        &mut queue,
        &registry,
        "p-2",
        OperationKind::ProfileUpdate,
        json!({"bloodType": "A+", "city": "Oslo"}),
        Priority::High,
        0,
    )
    .unwrap();

    let op = queue.get("p-2").unwrap().clone();
    let running = queue
        .update("p-2", OperationPatch::begin_attempt(&op, 10))
        .unwrap();
    let result = resolver.reconcile_operation(
        &running,
        &json!({"bloodType": "O-", "city": "Bergen"}),
        11,
    );
    assert!(result.needs_user());

    let ids: Vec<String> = result.deferred.iter().map(|r| r.id.clone()).collect();
    for record in result.deferred.clone() {
        queue.save_conflict(record);
    }
    let parked = queue
        .update("p-2", OperationPatch::park(ids.clone(), result.value.clone()))
        .unwrap();
    assert!(parked.is_parked());
    assert_eq!(parked.next_attempt_at, Some(PARKED));
    assert!(queue.list_eligible(1_000_000).is_empty());
    // Placeholder keeps the server's value
    assert_eq!(parked.resolved_value.unwrap()["bloodType"], json!("O-"));

    let outcome = queue.resolve_conflict(&ids[0], json!("A+"), 20).unwrap();
    assert!(outcome.resumed);
    let resumed = outcome.operation.unwrap();
    assert_eq!(resumed.payload, json!({"bloodType": "A+", "city": "Oslo"}));
    assert!(queue.list_conflicts().is_empty());

    let due = queue.list_eligible(20);
    assert_eq!(due.len(), 1);
    let again = queue
        .update("p-2", OperationPatch::begin_attempt(&due[0], 20))
        .unwrap();
    assert_eq!(again.attempts, 2);

    assert!(matches!(
        queue.resolve_conflict(&ids[0], json!("B+"), 21),
        Err(Error::ConflictNotFound(_))
    ));
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[test]
fn snapshot_empty_queue() {
    let queue = MemoryQueue::new(10);
    let snapshot = queue.export_snapshot();
    assert_eq!(snapshot.operation_count(), 0);
    let json = snapshot.to_json().unwrap();
    assert_eq!(QueueSnapshot::from_json(&json).unwrap(), snapshot);
}

#[test]
fn snapshot_keeps_parked_conflicts() {
    let mut registry = PolicyRegistry::default();
    registry.set(
        OperationKind::ProfileUpdate,
        TypePolicy {
            conflict: ConflictPolicy::with_default(ConflictStrategy::UserChoice),
            ..TypePolicy::default()
        },
    );
    let resolver = ConflictResolver::new(&registry);
    let mut queue = MemoryQueue::new(10);
    enqueue(&mut queue, &registry, "p", OperationKind::ProfileUpdate, json!({"a": 1}), Priority::Normal, 0).unwrap();
    let op = queue.get("p").unwrap().clone();
    let running = queue.update("p", OperationPatch::begin_attempt(&op, 1)).unwrap();
    let result = resolver.reconcile_operation(&running, &json!({"a": 2}), 2);
    let ids = result.deferred.iter().map(|r| r.id.clone()).collect();
    for record in result.deferred {
        queue.save_conflict(record);
    }
    queue.update("p", OperationPatch::park(ids, result.value)).unwrap();

    let json = queue.export_snapshot().to_json_pretty().unwrap();
    let mut restored = MemoryQueue::new(10);
    restored.import_snapshot(QueueSnapshot::from_json(&json).unwrap()).unwrap();
    assert_eq!(restored.list_conflicts().len(), 1);
    assert!(restored.get("p").unwrap().is_parked());
}

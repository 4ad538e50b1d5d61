//! Operation types for queued work.
//!
//! Every state-changing action the client takes while it may be offline is
//! captured as an [`Operation`] and moves through a small state machine:
//!
//! ```text
//! pending ──> processing ──> delivered
//!    │            │  ├─────> failed
//!    │            │  └─────> retry_scheduled ──> processing
//!    └────────────┴──────────────┴─────────────> expired
//! ```
//!
//! `delivered`, `failed` and `expired` are terminal.

use crate::{error::Result, Error, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for an operation.
pub type OperationId = String;

/// `next_attempt_at` value for operations parked until a human resolves a conflict.
pub const PARKED: Timestamp = u64::MAX;

/// Dispatch priority. Lower rank is dispatched sooner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[serde(alias = "emergency")]
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Ordinal rank used for ordering.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Inverse of [`Priority::rank`].
    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.get(usize::from(rank)).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "emergency" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::Validation(format!("unknown priority: {other}"))),
        }
    }
}

/// The kind of work an operation carries. Selects the handler and the
/// retry/conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A donor's response to a donation request
    Respond,
    /// Donor or hospital profile edit
    ProfileUpdate,
    /// Donor availability on/off
    AvailabilityToggle,
    /// Acknowledging delivery of a notification
    NotificationDelivery,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Respond,
        OperationKind::ProfileUpdate,
        OperationKind::AvailabilityToggle,
        OperationKind::NotificationDelivery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Respond => "respond",
            OperationKind::ProfileUpdate => "profile_update",
            OperationKind::AvailabilityToggle => "availability_toggle",
            OperationKind::NotificationDelivery => "notification_delivery",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown operation type: {s}")))
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Delivered,
    RetryScheduled,
    Failed,
    Expired,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 6] = [
        OperationStatus::Pending,
        OperationStatus::Processing,
        OperationStatus::Delivered,
        OperationStatus::RetryScheduled,
        OperationStatus::Failed,
        OperationStatus::Expired,
    ];

    /// Terminal states are never scheduled again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Delivered | OperationStatus::Failed | OperationStatus::Expired
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Expired)
                | (Processing, Delivered)
                | (Processing, RetryScheduled)
                | (Processing, Failed)
                | (Processing, Expired)
                | (RetryScheduled, Processing)
                | (RetryScheduled, Expired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Delivered => "delivered",
            OperationStatus::RetryScheduled => "retry_scheduled",
            OperationStatus::Failed => "failed",
            OperationStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown status: {s}")))
    }
}

/// Free-form bookkeeping attached by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    /// Where the operation originated (screen, worker, push handler)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Correlation id for tracing a user action across systems
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Anything else
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,
    /// Handler / policy selector
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Handler-specific data
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: OperationStatus,
    /// Processing attempts so far
    pub attempts: u32,
    /// Insertion sequence, the FIFO tie-break
    pub seq: u64,
    pub queued_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<Timestamp>,
    /// Set only while `status == retry_scheduled`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<Timestamp>,
    pub expires_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Reconciled state after a conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<serde_json::Value>,
    /// Conflict records awaiting a human decision
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_conflicts: Vec<String>,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

impl Operation {
    /// Create a freshly queued operation.
    ///
    /// Callers normally go through [`crate::PolicyRegistry::admit`], which
    /// validates the request and derives the expiry from the type's TTL.
    pub fn new(
        id: impl Into<OperationId>,
        kind: OperationKind,
        payload: serde_json::Value,
        priority: Priority,
        seq: u64,
        queued_at: Timestamp,
        expires_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            priority,
            status: OperationStatus::Pending,
            attempts: 0,
            seq,
            queued_at,
            last_attempt_at: None,
            next_attempt_at: None,
            expires_at,
            completed_at: None,
            last_error: None,
            resolved_value: None,
            pending_conflicts: Vec::new(),
            metadata: OperationMetadata::default(),
        }
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, metadata: OperationMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Parked behind an unresolved `user_choice` conflict.
    pub fn is_parked(&self) -> bool {
        self.status == OperationStatus::RetryScheduled && self.next_attempt_at == Some(PARKED)
    }

    /// Past its expiry at `now`.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Only untouched work can be withdrawn.
    pub fn is_cancellable(&self) -> bool {
        self.status == OperationStatus::Pending
    }

    /// Apply a patch, enforcing the state machine and attempt accounting.
    ///
    /// The patch is applied all-or-nothing: on error `self` is untouched.
    pub fn apply_patch(&mut self, patch: OperationPatch) -> Result<()> {
        if let Some(next) = patch.status {
            if next != self.status && !self.status.can_transition_to(next) {
                return Err(Error::IllegalTransition {
                    from: self.status,
                    to: next,
                });
            }
        }

        if let Some(requested) = patch.attempts {
            if requested < self.attempts || requested > self.attempts.saturating_add(1) {
                return Err(Error::AttemptsRegression {
                    current: self.attempts,
                    requested,
                });
            }
        }

        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(at) = patch.last_attempt_at {
            self.last_attempt_at = Some(at);
        }
        if let Some(next) = patch.next_attempt_at {
            self.next_attempt_at = next;
        }
        if let Some(completed) = patch.completed_at {
            self.completed_at = completed;
        }
        if let Some(error) = patch.last_error {
            self.last_error = error;
        }
        if let Some(resolved) = patch.resolved_value {
            self.resolved_value = resolved;
        }
        if let Some(payload) = patch.payload {
            self.payload = payload;
        }
        if let Some(conflicts) = patch.pending_conflicts {
            self.pending_conflicts = conflicts;
        }

        if self.status != OperationStatus::RetryScheduled {
            self.next_attempt_at = None;
        }

        Ok(())
    }
}

/// A caller's request to queue work.
///
/// Fields are optional because requests arrive from untyped callers; the
/// missing ones are rejected at admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(rename = "type", default)]
    pub kind: Option<OperationKind>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

impl EnqueueRequest {
    /// Create a request with a type and payload.
    pub fn new(kind: OperationKind, payload: serde_json::Value) -> Self {
        Self {
            kind: Some(kind),
            payload: Some(payload),
            priority: None,
            metadata: OperationMetadata::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_metadata(mut self, metadata: OperationMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check that the mandatory parts are present.
    pub fn require_parts(&self) -> Result<(OperationKind, &serde_json::Value)> {
        let kind = self
            .kind
            .ok_or_else(|| Error::Validation("operation type is required".into()))?;
        let payload = match &self.payload {
            None | Some(serde_json::Value::Null) => {
                return Err(Error::Validation("operation payload is required".into()))
            }
            Some(payload) => payload,
        };
        Ok((kind, payload))
    }
}

/// A partial update to an operation.
///
/// `Some(None)` on a nested option clears the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPatch {
    pub status: Option<OperationStatus>,
    pub attempts: Option<u32>,
    pub last_attempt_at: Option<Timestamp>,
    pub next_attempt_at: Option<Option<Timestamp>>,
    pub completed_at: Option<Option<Timestamp>>,
    pub last_error: Option<Option<String>>,
    pub resolved_value: Option<Option<serde_json::Value>>,
    pub payload: Option<serde_json::Value>,
    pub pending_conflicts: Option<Vec<String>>,
}

impl OperationPatch {
    /// Enter `processing` for one more attempt.
    pub fn begin_attempt(op: &Operation, now: Timestamp) -> Self {
        Self {
            status: Some(OperationStatus::Processing),
            attempts: Some(op.attempts.saturating_add(1)),
            last_attempt_at: Some(now),
            next_attempt_at: Some(None),
            ..Self::default()
        }
    }

    /// Handler succeeded.
    pub fn deliver(now: Timestamp, resolved_value: Option<serde_json::Value>) -> Self {
        Self {
            status: Some(OperationStatus::Delivered),
            completed_at: Some(Some(now)),
            last_error: Some(None),
            resolved_value: Some(resolved_value),
            ..Self::default()
        }
    }

    /// Retryable failure with budget left.
    pub fn schedule_retry(next_attempt_at: Timestamp, error: impl Into<String>) -> Self {
        Self {
            status: Some(OperationStatus::RetryScheduled),
            next_attempt_at: Some(Some(next_attempt_at)),
            last_error: Some(Some(error.into())),
            ..Self::default()
        }
    }

    /// Dead-letter.
    pub fn fail(now: Timestamp, error: impl Into<String>) -> Self {
        Self {
            status: Some(OperationStatus::Failed),
            completed_at: Some(Some(now)),
            last_error: Some(Some(error.into())),
            ..Self::default()
        }
    }

    /// Observed past its expiry.
    pub fn expire(now: Timestamp) -> Self {
        Self {
            status: Some(OperationStatus::Expired),
            completed_at: Some(Some(now)),
            ..Self::default()
        }
    }

    /// Wait for a human to resolve the listed conflicts.
    pub fn park(conflict_ids: Vec<String>, partial: serde_json::Value) -> Self {
        Self {
            status: Some(OperationStatus::RetryScheduled),
            next_attempt_at: Some(Some(PARKED)),
            last_error: Some(Some("awaiting manual conflict resolution".into())),
            resolved_value: Some(Some(partial)),
            pending_conflicts: Some(conflict_ids),
            ..Self::default()
        }
    }

    /// Update a parked operation's outstanding conflicts and partial result.
    pub fn progress_manual(remaining: Vec<String>, partial: serde_json::Value) -> Self {
        Self {
            resolved_value: Some(Some(partial)),
            pending_conflicts: Some(remaining),
            ..Self::default()
        }
    }

    /// Every conflict is resolved: re-dispatch with the resolved payload.
    pub fn resume(now: Timestamp, payload: serde_json::Value) -> Self {
        Self {
            next_attempt_at: Some(Some(now)),
            payload: Some(payload.clone()),
            resolved_value: Some(Some(payload)),
            pending_conflicts: Some(Vec::new()),
            last_error: Some(None),
            ..Self::default()
        }
    }

    /// An attempt was interrupted (process exit); make it eligible again.
    pub fn recover(now: Timestamp) -> Self {
        Self {
            status: Some(OperationStatus::RetryScheduled),
            next_attempt_at: Some(Some(now)),
            last_error: Some(Some("attempt interrupted".into())),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op() -> Operation {
        Operation::new(
            "op-1",
            OperationKind::Respond,
            json!({"requestId": "req-9", "accepted": true}),
            Priority::Critical,
            1,
            1_000,
            61_000,
        )
    }

    #[test]
    fn new_operation_is_pending() {
        let op = op();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempts, 0);
        assert!(op.next_attempt_at.is_none());
        assert!(op.expires_at > op.queued_at);
        assert!(op.is_cancellable());
    }

    #[test]
    fn priority_order_and_aliases() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!("emergency".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!(
            serde_json::from_str::<Priority>("\"emergency\"").unwrap(),
            Priority::Critical
        );
        assert_eq!(Priority::from_rank(3), Some(Priority::Low));
        assert_eq!(Priority::from_rank(4), None);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("donate".parse::<OperationKind>().is_err());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in OperationStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in OperationStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn pending_cannot_jump_to_delivered() {
        let mut op = op();
        let err = op.apply_patch(OperationPatch::deliver(2_000, None)).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[test]
    fn attempt_then_retry_then_deliver() {
        let mut op = op();
        op.apply_patch(OperationPatch::begin_attempt(&op, 2_000))
            .unwrap();
        assert_eq!(op.status, OperationStatus::Processing);
        assert_eq!(op.attempts, 1);
        assert_eq!(op.last_attempt_at, Some(2_000));

        op.apply_patch(OperationPatch::schedule_retry(3_000, "503"))
            .unwrap();
        assert_eq!(op.next_attempt_at, Some(3_000));
        assert_eq!(op.last_error.as_deref(), Some("503"));

        op.apply_patch(OperationPatch::begin_attempt(&op, 3_000))
            .unwrap();
        assert!(op.next_attempt_at.is_none());
        assert_eq!(op.attempts, 2);

        op.apply_patch(OperationPatch::deliver(3_100, None)).unwrap();
        assert_eq!(op.status, OperationStatus::Delivered);
        assert_eq!(op.completed_at, Some(3_100));
        assert!(op.last_error.is_none());
    }

    #[test]
    fn attempts_cannot_skip_or_regress() {
        let mut op = op();
        let patch = OperationPatch {
            attempts: Some(2),
            ..OperationPatch::default()
        };
        assert!(matches!(
            op.apply_patch(patch),
            Err(Error::AttemptsRegression { .. })
        ));

        op.attempts = 3;
        let patch = OperationPatch {
            attempts: Some(2),
            ..OperationPatch::default()
        };
        assert!(op.apply_patch(patch).is_err());
    }

    #[test]
    fn parking_uses_sentinel() {
        let mut op = op();
        op.apply_patch(OperationPatch::begin_attempt(&op, 2_000))
            .unwrap();
        op.apply_patch(OperationPatch::park(
            vec!["c-1".into()],
            json!({"accepted": true}),
        ))
        .unwrap();
        assert!(op.is_parked());
        assert_eq!(op.pending_conflicts, vec!["c-1".to_string()]);

        op.apply_patch(OperationPatch::resume(5_000, json!({"accepted": false})))
            .unwrap();
        assert!(!op.is_parked());
        assert_eq!(op.next_attempt_at, Some(5_000));
        assert_eq!(op.payload, json!({"accepted": false}));
    }

    #[test]
    fn request_requires_type_and_payload() {
        let missing_type = EnqueueRequest {
            payload: Some(json!({})),
            ..EnqueueRequest::default()
        };
        assert!(missing_type.require_parts().is_err());

        let null_payload = EnqueueRequest {
            kind: Some(OperationKind::Respond),
            payload: Some(serde_json::Value::Null),
            ..EnqueueRequest::default()
        };
        assert!(null_payload.require_parts().is_err());

        let ok = EnqueueRequest::new(OperationKind::Respond, json!({"requestId": "r"}));
        assert!(ok.require_parts().is_ok());
    }

    #[test]
    fn wire_format() {
        let op = op();
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "respond");
        assert_eq!(json["priority"], "critical");
        assert_eq!(json["status"], "pending");
        assert!(json.get("nextAttemptAt").is_none());

        let parsed: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, op);
    }

    #[test]
    fn request_from_json() {
        let request: EnqueueRequest = serde_json::from_str(
            r#"{"type": "availability_toggle", "payload": {"available": false}, "priority": "high"}"#,
        )
        .unwrap();
        assert_eq!(request.kind, Some(OperationKind::AvailabilityToggle));
        assert_eq!(request.priority, Some(Priority::High));
    }
}

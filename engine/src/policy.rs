//! Per-type policies and admission of new operations.
//!
//! Every [`OperationKind`] maps to a [`TypePolicy`] describing how long its
//! operations live, how they are retried, how their conflicts are settled,
//! what their payload must look like and where they are delivered. The
//! registry ships with defaults for the built-in kinds and can be overridden
//! from JSON.

use crate::conflict::{ArrayMerge, ConflictPolicy, ConflictStrategy};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::shape::{FieldDef, FieldType, PayloadShape};
use crate::{EnqueueRequest, Error, Operation, OperationId, OperationKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SECOND: u64 = 1_000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Upstream REST endpoint for an operation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Path relative to the API base URL; `{field}` segments are filled
    /// from the payload
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "POST".to_string()
}

impl Endpoint {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
        }
    }
}

/// Everything the engine knows about one operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypePolicy {
    /// Lifetime of a queued operation in milliseconds
    pub ttl_ms: u64,
    pub retry: RetryPolicy,
    pub conflict: ConflictPolicy,
    pub payload_shape: PayloadShape,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
}

impl Default for TypePolicy {
    fn default() -> Self {
        Self {
            ttl_ms: DAY,
            retry: RetryPolicy::default(),
            conflict: ConflictPolicy::default(),
            payload_shape: PayloadShape::default(),
            endpoint: None,
        }
    }
}

/// Registry of type policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRegistry {
    /// Strategy used when neither a field rule nor a type default applies
    #[serde(default)]
    pub default_conflict_strategy: ConflictStrategy,
    #[serde(default)]
    types: BTreeMap<OperationKind, TypePolicy>,
    #[serde(skip)]
    fallback: TypePolicy,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in OperationKind::ALL {
            registry.set(kind, builtin(kind));
        }
        registry
    }
}

impl PolicyRegistry {
    /// A registry with no type-specific policies.
    pub fn empty() -> Self {
        Self {
            default_conflict_strategy: ConflictStrategy::LastWriteWins,
            types: BTreeMap::new(),
            fallback: TypePolicy::default(),
        }
    }

    /// Parse overrides from JSON and layer them over the built-in defaults.
    ///
    /// Each type listed in the document replaces its built-in policy as a
    /// whole; unlisted types keep theirs.
    pub fn from_json(json: &str) -> Result<Self> {
        let overrides: PolicyRegistry = serde_json::from_str(json)
            .map_err(|e| Error::Validation(format!("invalid policy document: {e}")))?;

        let mut registry = Self::default();
        registry.default_conflict_strategy = overrides.default_conflict_strategy;
        for (kind, policy) in overrides.types {
            registry.set(kind, policy);
        }
        Ok(registry)
    }

    pub fn policy(&self, kind: OperationKind) -> &TypePolicy {
        self.types.get(&kind).unwrap_or(&self.fallback)
    }

    pub fn set(&mut self, kind: OperationKind, policy: TypePolicy) {
        self.types.insert(kind, policy);
    }

    /// Kinds with an explicit policy, in stable order.
    pub fn kinds(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.types.keys().copied()
    }

    /// Validate a request and build the pending operation for it.
    ///
    /// The caller supplies the id and insertion sequence; this keeps the
    /// engine free of id generation.
    pub fn admit(
        &self,
        request: &EnqueueRequest,
        id: impl Into<OperationId>,
        seq: u64,
        now: Timestamp,
    ) -> Result<Operation> {
        let (kind, payload) = request.require_parts()?;
        let policy = self.policy(kind);

        if policy.ttl_ms == 0 {
            return Err(Error::Validation(format!("ttl for {kind} must be positive")));
        }
        policy.payload_shape.validate(payload)?;

        let op = Operation::new(
            id,
            kind,
            payload.clone(),
            request.priority.unwrap_or_default(),
            seq,
            now,
            now.saturating_add(policy.ttl_ms),
        )
        .with_metadata(request.metadata.clone());

        Ok(op)
    }
}

fn builtin(kind: OperationKind) -> TypePolicy {
    match kind {
        OperationKind::Respond => TypePolicy {
            ttl_ms: DAY,
            retry: RetryPolicy::exponential(SECOND, MINUTE, 5),
            conflict: ConflictPolicy::with_default(ConflictStrategy::ServerWins),
            payload_shape: PayloadShape::new(vec![
                FieldDef::required("requestId", FieldType::String),
                FieldDef::required("accepted", FieldType::Bool),
                FieldDef::optional("message", FieldType::String),
            ]),
            endpoint: Some(Endpoint::new("POST", "/requests/{requestId}/responses")),
        },
        OperationKind::ProfileUpdate => TypePolicy {
            ttl_ms: 7 * DAY,
            retry: RetryPolicy::exponential(2 * SECOND, 5 * MINUTE, 8),
            conflict: ConflictPolicy::with_default(ConflictStrategy::Merge)
                .with_field("verified", ConflictStrategy::ServerWins)
                .with_field("donations.verified", ConflictStrategy::ServerWins)
                .with_array_merge(ArrayMerge::Atomic),
            payload_shape: PayloadShape::default(),
            endpoint: Some(Endpoint::new("PATCH", "/profile")),
        },
        OperationKind::AvailabilityToggle => TypePolicy {
            ttl_ms: DAY,
            retry: RetryPolicy::linear(5 * SECOND, 5),
            conflict: ConflictPolicy::with_default(ConflictStrategy::ClientWins),
            payload_shape: PayloadShape::new(vec![FieldDef::required(
                "available",
                FieldType::Bool,
            )]),
            endpoint: Some(Endpoint::new("PUT", "/profile/availability")),
        },
        OperationKind::NotificationDelivery => TypePolicy {
            ttl_ms: HOUR,
            retry: RetryPolicy::fixed(10 * SECOND, 3),
            conflict: ConflictPolicy::with_default(ConflictStrategy::LastWriteWins),
            payload_shape: PayloadShape::new(vec![
                FieldDef::required("notificationId", FieldType::String),
                FieldDef::optional("channel", FieldType::String),
            ]),
            endpoint: Some(Endpoint::new(
                "POST",
                "/notifications/{notificationId}/delivered",
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffPolicy, OperationStatus, Priority};
    use serde_json::json;

    #[test]
    fn builtin_defaults() {
        let registry = PolicyRegistry::default();
        let respond = registry.policy(OperationKind::Respond);
        assert_eq!(respond.retry.max_attempts, 5);
        assert_eq!(respond.conflict.default, Some(ConflictStrategy::ServerWins));

        let toggle = registry.policy(OperationKind::AvailabilityToggle);
        assert_eq!(toggle.retry.backoff, BackoffPolicy::Linear);

        let notify = registry.policy(OperationKind::NotificationDelivery);
        assert_eq!(notify.ttl_ms, HOUR);
        assert_eq!(notify.retry.backoff, BackoffPolicy::Fixed);
    }

    #[test]
    fn admit_builds_pending_operation() {
        let registry = PolicyRegistry::default();
        let request = EnqueueRequest::new(
            OperationKind::Respond,
            json!({"requestId": "req-1", "accepted": true}),
        )
        .with_priority(Priority::Critical);

        let op = registry.admit(&request, "op-1", 4, 1_000).unwrap();
        assert_eq!(op.id, "op-1");
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempts, 0);
        assert_eq!(op.seq, 4);
        assert_eq!(op.queued_at, 1_000);
        assert_eq!(op.expires_at, 1_000 + DAY);
        assert!(op.expires_at > op.queued_at);
    }

    #[test]
    fn admit_defaults_to_normal_priority() {
        let registry = PolicyRegistry::default();
        let request =
            EnqueueRequest::new(OperationKind::AvailabilityToggle, json!({"available": true}));
        let op = registry.admit(&request, "op-1", 1, 0).unwrap();
        assert_eq!(op.priority, Priority::Normal);
    }

    #[test]
    fn admit_rejects_missing_parts() {
        let registry = PolicyRegistry::default();

        let no_type = EnqueueRequest {
            payload: Some(json!({"available": true})),
            ..EnqueueRequest::default()
        };
        assert!(registry.admit(&no_type, "a", 1, 0).unwrap_err().is_validation());

        let no_payload = EnqueueRequest {
            kind: Some(OperationKind::ProfileUpdate),
            ..EnqueueRequest::default()
        };
        assert!(registry
            .admit(&no_payload, "b", 2, 0)
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn admit_enforces_payload_shape() {
        let registry = PolicyRegistry::default();
        let request =
            EnqueueRequest::new(OperationKind::Respond, json!({"requestId": "req-1"}));
        let err = registry.admit(&request, "op-1", 1, 0).unwrap_err();
        assert!(matches!(err, Error::MissingRequiredField(ref f) if f == "accepted"));
    }

    #[test]
    fn admit_rejects_zero_ttl() {
        let mut registry = PolicyRegistry::default();
        registry.set(
            OperationKind::ProfileUpdate,
            TypePolicy {
                ttl_ms: 0,
                ..TypePolicy::default()
            },
        );
        let request = EnqueueRequest::new(OperationKind::ProfileUpdate, json!({}));
        assert!(registry.admit(&request, "x", 1, 0).is_err());
    }

    #[test]
    fn overrides_layer_over_defaults() {
        let registry = PolicyRegistry::from_json(
            r#"{
                "types": {
                    "respond": {
                        "ttlMs": 5000,
                        "retry": {"backoff": "fixed", "baseDelayMs": 250, "maxDelayMs": 250, "maxAttempts": 2}
                    }
                }
            }"#,
        )
        .unwrap();

        let respond = registry.policy(OperationKind::Respond);
        assert_eq!(respond.ttl_ms, 5_000);
        assert_eq!(respond.retry.max_attempts, 2);
        // Replaced as a whole
        assert!(respond.payload_shape.fields.is_empty());

        let profile = registry.policy(OperationKind::ProfileUpdate);
        assert_eq!(profile.conflict.default, Some(ConflictStrategy::Merge));
    }

    #[test]
    fn invalid_document_is_validation_error() {
        assert!(PolicyRegistry::from_json("{not json").unwrap_err().is_validation());
    }

    #[test]
    fn empty_registry_falls_back() {
        let registry = PolicyRegistry::empty();
        assert_eq!(registry.policy(OperationKind::Respond), &TypePolicy::default());
        assert_eq!(registry.kinds().count(), 0);
    }
}

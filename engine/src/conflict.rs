//! Field-level conflict detection and resolution.
//!
//! When the server answers an operation with its own view of the entity, the
//! two JSON trees are compared leaf by leaf. Every differing leaf becomes a
//! [`ConflictRecord`] carrying the strategy that applies to its path:
//!
//! 1. an explicit rule for `(operation type, field path)` (the longest
//!    matching path prefix wins),
//! 2. the operation type's default,
//! 3. the registry-wide default (`last_write_wins`).
//!
//! A side that lacks a field has no opinion about it: whichever strategy
//! applies, the value from the side that has the field is kept.
//!
//! Arrays are leaves. Under `merge` they are replaced wholesale unless the
//! type opts into [`ArrayMerge::Union`].

use crate::{Operation, OperationId, OperationKind, OperationPatch, PolicyRegistry, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Timestamp fields looked up on values and trees for last-write-wins.
const TIMESTAMP_FIELDS: [&str; 3] = ["updatedAt", "updated_at", "timestamp"];

/// How a conflicting field is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Newer side wins; ties go to the client
    #[default]
    LastWriteWins,
    ServerWins,
    ClientWins,
    /// Deep merge, server as base, client leaves on top
    Merge,
    /// Park until a human decides
    UserChoice,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last_write_wins",
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::UserChoice => "user_choice",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Treatment of arrays under the `merge` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayMerge {
    /// Client array replaces server array
    #[default]
    Atomic,
    /// Server elements followed by client elements not already present
    Union,
}

/// Conflict rules for one operation type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPolicy {
    /// Strategy for fields without an explicit rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ConflictStrategy>,
    /// Explicit per-path rules
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, ConflictStrategy>,
    #[serde(default)]
    pub array_merge: ArrayMerge,
}

impl ConflictPolicy {
    pub fn with_default(strategy: ConflictStrategy) -> Self {
        Self {
            default: Some(strategy),
            ..Self::default()
        }
    }

    /// Builder-style method to add a field rule.
    pub fn with_field(mut self, path: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.fields.insert(path.into(), strategy);
        self
    }

    pub fn with_array_merge(mut self, mode: ArrayMerge) -> Self {
        self.array_merge = mode;
        self
    }

    /// Most specific explicit rule covering `path`.
    fn rule_for(&self, path: &str) -> Option<ConflictStrategy> {
        if let Some(strategy) = self.fields.get(path) {
            return Some(*strategy);
        }
        let mut prefix = path;
        while let Some((parent, _)) = prefix.rsplit_once('.') {
            if let Some(strategy) = self.fields.get(parent) {
                return Some(*strategy);
            }
            prefix = parent;
        }
        None
    }
}

/// One divergent field between client and server state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OperationKind>,
    /// Dotted path into the compared trees; empty for the root
    pub field_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_value: Option<Value>,
    pub resolution_strategy: ConflictStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<Value>,
    pub detected_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// The value in effect before the conflict: the server's, else the client's.
    pub fn original_value(&self) -> Value {
        self.server_value
            .clone()
            .or_else(|| self.client_value.clone())
            .unwrap_or(Value::Null)
    }

    /// Record a decision.
    pub fn settle(&mut self, value: Value, at: Timestamp) {
        self.resolved_value = Some(value);
        self.resolved_at = Some(at);
    }
}

/// Outcome of resolving one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Value),
    /// Needs a human; the placeholder keeps the pre-conflict value
    Deferred { placeholder: Value },
}

impl Resolution {
    pub fn value(&self) -> &Value {
        match self {
            Resolution::Resolved(value) => value,
            Resolution::Deferred { placeholder } => placeholder,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Resolution::Deferred { .. })
    }
}

/// Timing information used by last-write-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolveContext {
    /// Record-level timestamp of the client tree
    pub client_timestamp: Option<Timestamp>,
    /// Record-level timestamp of the server tree
    pub server_timestamp: Option<Timestamp>,
    pub now: Timestamp,
}

impl ResolveContext {
    /// Derive record timestamps from the trees' top-level timestamp fields,
    /// falling back to `client_fallback` (typically the operation's queue time).
    pub fn from_trees(
        client: &Value,
        server: &Value,
        client_fallback: Option<Timestamp>,
        now: Timestamp,
    ) -> Self {
        Self {
            client_timestamp: embedded_timestamp(client).or(client_fallback),
            server_timestamp: embedded_timestamp(server),
            now,
        }
    }
}

/// Result of reconciling a client tree with a server tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Server tree with every resolution applied (placeholders for deferred fields)
    pub value: Value,
    /// Records settled automatically
    pub resolved: Vec<ConflictRecord>,
    /// Records awaiting a human
    pub deferred: Vec<ConflictRecord>,
}

impl Reconciliation {
    pub fn needs_user(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn conflict_count(&self) -> usize {
        self.resolved.len() + self.deferred.len()
    }
}

/// Detects and settles conflicts using the registry's conflict policies.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver<'a> {
    registry: &'a PolicyRegistry,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(registry: &'a PolicyRegistry) -> Self {
        Self { registry }
    }

    /// Strategy lookup: field rule, then type default, then global default.
    pub fn strategy_for(&self, kind: Option<OperationKind>, path: &str) -> ConflictStrategy {
        kind.map(|kind| &self.registry.policy(kind).conflict)
            .and_then(|policy| policy.rule_for(path).or(policy.default))
            .unwrap_or(self.registry.default_conflict_strategy)
    }

    fn array_merge(&self, kind: Option<OperationKind>) -> ArrayMerge {
        kind.map(|kind| self.registry.policy(kind).conflict.array_merge)
            .unwrap_or_default()
    }

    /// Compare two trees and emit one record per differing leaf.
    pub fn detect(
        &self,
        kind: Option<OperationKind>,
        client: &Value,
        server: &Value,
        now: Timestamp,
    ) -> Vec<ConflictRecord> {
        diff_leaves(client, server)
            .into_iter()
            .map(|leaf| ConflictRecord {
                id: leaf.path.clone(),
                operation_id: None,
                kind,
                resolution_strategy: self.strategy_for(kind, &leaf.path),
                field_path: leaf.path,
                client_value: leaf.client,
                server_value: leaf.server,
                resolved_value: None,
                detected_at: now,
                resolved_at: None,
            })
            .collect()
    }

    /// Settle one record according to its strategy.
    ///
    /// Pure: the same record and context always give the same answer.
    pub fn resolve(&self, record: &ConflictRecord, ctx: &ResolveContext) -> Resolution {
        let (client, server) = match (&record.client_value, &record.server_value) {
            (Some(client), Some(server)) => (client, server),
            (Some(only), None) | (None, Some(only)) => return Resolution::Resolved(only.clone()),
            (None, None) => return Resolution::Resolved(Value::Null),
        };

        match record.resolution_strategy {
            ConflictStrategy::ServerWins => Resolution::Resolved(server.clone()),
            ConflictStrategy::ClientWins => Resolution::Resolved(client.clone()),
            ConflictStrategy::LastWriteWins => {
                let client_at = embedded_timestamp(client)
                    .or(ctx.client_timestamp)
                    .unwrap_or(ctx.now);
                let server_at = embedded_timestamp(server)
                    .or(ctx.server_timestamp)
                    .unwrap_or(ctx.now);
                if client_at >= server_at {
                    Resolution::Resolved(client.clone())
                } else {
                    Resolution::Resolved(server.clone())
                }
            }
            ConflictStrategy::Merge => Resolution::Resolved(merge_trees(
                server,
                client,
                self.array_merge(record.kind),
            )),
            ConflictStrategy::UserChoice => Resolution::Deferred {
                placeholder: record.original_value(),
            },
        }
    }

    /// Detect and resolve every conflict of `op` against `server`.
    ///
    /// Record ids are derived from the operation id, its attempt count and
    /// the field path, so a replay yields the same ids.
    pub fn reconcile_operation(
        &self,
        op: &Operation,
        server: &Value,
        now: Timestamp,
    ) -> Reconciliation {
        let ctx = ResolveContext::from_trees(&op.payload, server, Some(op.queued_at), now);
        let mut records = self.detect(Some(op.kind), &op.payload, server, now);
        for record in &mut records {
            record.id = format!("{}:{}:{}", op.id, op.attempts, record.field_path);
            record.operation_id = Some(op.id.clone());
        }
        self.apply(server, records, &ctx)
    }

    /// Resolve `records` and fold the results into a copy of `server`.
    pub fn apply(
        &self,
        server: &Value,
        records: Vec<ConflictRecord>,
        ctx: &ResolveContext,
    ) -> Reconciliation {
        let mut value = server.clone();
        let mut resolved = Vec::new();
        let mut deferred = Vec::new();

        for mut record in records {
            let resolution = self.resolve(&record, ctx);
            set_path(&mut value, &record.field_path, resolution.value().clone());
            match resolution {
                Resolution::Resolved(settled) => {
                    record.settle(settled, ctx.now);
                    resolved.push(record);
                }
                Resolution::Deferred { .. } => deferred.push(record),
            }
        }

        Reconciliation {
            value,
            resolved,
            deferred,
        }
    }
}

/// Next state of a parked operation after one of its records was settled.
///
/// `records` are the operation's pending conflict records in their current
/// state. Settled values are folded into the partial result; once nothing is
/// outstanding the operation resumes with the resolved tree as its payload.
pub fn manual_progress(op: &Operation, records: &[ConflictRecord], now: Timestamp) -> OperationPatch {
    let mut tree = op
        .resolved_value
        .clone()
        .unwrap_or_else(|| op.payload.clone());
    let mut remaining = Vec::new();

    for id in &op.pending_conflicts {
        match records.iter().find(|record| &record.id == id) {
            Some(ConflictRecord {
                field_path,
                resolved_value: Some(value),
                resolved_at: Some(_),
                ..
            }) => set_path(&mut tree, field_path, value.clone()),
            _ => remaining.push(id.clone()),
        }
    }

    if remaining.is_empty() {
        OperationPatch::resume(now, tree)
    } else {
        OperationPatch::progress_manual(remaining, tree)
    }
}

/// One differing leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafDiff {
    pub path: String,
    pub client: Option<Value>,
    pub server: Option<Value>,
}

/// Walk both trees and collect differing leaves in path order.
///
/// Objects are descended into; everything else (arrays included) is a leaf.
pub fn diff_leaves(client: &Value, server: &Value) -> Vec<LeafDiff> {
    let mut out = Vec::new();
    walk("", Some(client), Some(server), &mut out);
    out
}

fn walk(path: &str, client: Option<&Value>, server: Option<&Value>, out: &mut Vec<LeafDiff>) {
    if let (Some(Value::Object(c)), Some(Value::Object(s))) = (client, server) {
        let keys: BTreeSet<&String> = c.keys().chain(s.keys()).collect();
        for key in keys {
            let child = join_path(path, key);
            walk(&child, c.get(key), s.get(key), out);
        }
        return;
    }

    if client != server {
        out.push(LeafDiff {
            path: path.to_string(),
            client: client.cloned(),
            server: server.cloned(),
        });
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Deep-merge `client` onto `server`.
///
/// Objects merge key by key; for any other pair the client value wins,
/// except arrays under [`ArrayMerge::Union`].
pub fn merge_trees(server: &Value, client: &Value, arrays: ArrayMerge) -> Value {
    match (server, client) {
        (Value::Object(s), Value::Object(c)) => {
            let mut merged: Map<String, Value> = s.clone();
            for (key, client_value) in c {
                let value = match s.get(key) {
                    Some(server_value) => merge_trees(server_value, client_value, arrays),
                    None => client_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (Value::Array(s), Value::Array(c)) if arrays == ArrayMerge::Union => {
            let mut merged = s.clone();
            for item in c {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        (_, client) => client.clone(),
    }
}

/// Read a dotted path. The empty path is the root.
pub fn get_path<'v>(tree: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(tree);
    }
    path.split('.')
        .try_fold(tree, |node, key| node.as_object()?.get(key))
}

/// Write a dotted path, creating intermediate objects as needed.
pub fn set_path(tree: &mut Value, path: &str, value: Value) {
    if path.is_empty() {
        *tree = value;
        return;
    }

    let mut node = tree;
    let mut keys = path.split('.').peekable();
    while let Some(key) = keys.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if keys.peek().is_none() {
            map.insert(key.to_string(), value);
            return;
        }
        node = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Timestamp carried by a value itself, if any.
fn embedded_timestamp(value: &Value) -> Option<Timestamp> {
    let obj = value.as_object()?;
    TIMESTAMP_FIELDS
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Priority, TypePolicy};
    use serde_json::json;

    fn registry() -> PolicyRegistry {
        let mut registry = PolicyRegistry::default();
        registry.set(
            OperationKind::ProfileUpdate,
            TypePolicy {
                conflict: ConflictPolicy::with_default(ConflictStrategy::Merge)
                    .with_field("profile.email", ConflictStrategy::ServerWins)
                    .with_field("verified", ConflictStrategy::ServerWins)
                    .with_field("profile.nickname", ConflictStrategy::UserChoice),
                ..TypePolicy::default()
            },
        );
        registry
    }

    #[test]
    fn detects_nested_leaf_with_dotted_path() {
        let registry = registry();
        let resolver = ConflictResolver::new(&registry);
        let records = resolver.detect(
            Some(OperationKind::ProfileUpdate),
            &json!({"profile": {"email": "a@x.com", "city": "Oslo"}}),
            &json!({"profile": {"email": "b@x.com", "city": "Oslo"}}),
            10,
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field_path, "profile.email");
        assert_eq!(records[0].client_value, Some(json!("a@x.com")));
        assert_eq!(records[0].server_value, Some(json!("b@x.com")));
        assert_eq!(records[0].resolution_strategy, ConflictStrategy::ServerWins);
        assert!(records[0].resolved_value.is_none());
    }

    #[test]
    fn one_sided_keys_are_conflicts() {
        let diffs = diff_leaves(&json!({"a": 1}), &json!({"b": 2}));
        let paths: Vec<_> = diffs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b"]);
        assert_eq!(diffs[0].server, None);
        assert_eq!(diffs[1].client, None);
    }

    #[test]
    fn arrays_are_leaves() {
        let diffs = diff_leaves(&json!({"tags": [1, 2]}), &json!({"tags": [1, 3]}));
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "tags");
    }

    #[test]
    fn identical_trees_have_no_conflicts() {
        let tree = json!({"a": {"b": [1, {"c": null}]}});
        assert!(diff_leaves(&tree, &tree).is_empty());
    }

    #[test]
    fn strategy_lookup_order() {
        let registry = registry();
        let resolver = ConflictResolver::new(&registry);
        let kind = Some(OperationKind::ProfileUpdate);
        assert_eq!(
            resolver.strategy_for(kind, "profile.email"),
            ConflictStrategy::ServerWins
        );
        // Ancestor rule covers nested fields
        assert_eq!(
            resolver.strategy_for(kind, "verified.at"),
            ConflictStrategy::ServerWins
        );
        assert_eq!(
            resolver.strategy_for(kind, "profile.city"),
            ConflictStrategy::Merge
        );
        assert_eq!(
            resolver.strategy_for(None, "profile.city"),
            ConflictStrategy::LastWriteWins
        );
    }

    fn record(strategy: ConflictStrategy, client: Value, server: Value) -> ConflictRecord {
        ConflictRecord {
            id: "c".into(),
            operation_id: None,
            kind: None,
            field_path: "field".into(),
            client_value: Some(client),
            server_value: Some(server),
            resolution_strategy: strategy,
            resolved_value: None,
            detected_at: 0,
            resolved_at: None,
        }
    }

    #[test]
    fn last_write_wins_prefers_newer_side() {
        let registry = PolicyRegistry::default();
        let resolver = ConflictResolver::new(&registry);
        let ctx = ResolveContext {
            client_timestamp: Some(100),
            server_timestamp: Some(200),
            now: 300,
        };
        let rec = record(ConflictStrategy::LastWriteWins, json!("client"), json!("server"));
        assert_eq!(resolver.resolve(&rec, &ctx), Resolution::Resolved(json!("server")));

        // A value's own timestamp beats the record timestamp
        let rec = record(
            ConflictStrategy::LastWriteWins,
            json!({"v": 1, "updatedAt": 500}),
            json!({"v": 2, "updatedAt": 400}),
        );
        assert_eq!(
            resolver.resolve(&rec, &ctx),
            Resolution::Resolved(json!({"v": 1, "updatedAt": 500}))
        );
    }

    #[test]
    fn last_write_wins_tie_goes_to_client() {
        let registry = PolicyRegistry::default();
        let resolver = ConflictResolver::new(&registry);
        let ctx = ResolveContext {
            now: 42,
            ..ResolveContext::default()
        };
        let rec = record(ConflictStrategy::LastWriteWins, json!(1), json!(2));
        assert_eq!(resolver.resolve(&rec, &ctx), Resolution::Resolved(json!(1)));
    }

    #[test]
    fn resolution_is_idempotent() {
        let registry = PolicyRegistry::default();
        let resolver = ConflictResolver::new(&registry);
        let ctx = ResolveContext {
            now: 7,
            ..ResolveContext::default()
        };
        for strategy in [
            ConflictStrategy::LastWriteWins,
            ConflictStrategy::ServerWins,
            ConflictStrategy::ClientWins,
            ConflictStrategy::Merge,
            ConflictStrategy::UserChoice,
        ] {
            let rec = record(strategy, json!({"a": [1]}), json!({"a": [2], "b": 1}));
            assert_eq!(resolver.resolve(&rec, &ctx), resolver.resolve(&rec, &ctx));
        }
    }

    #[test]
    fn user_choice_defers_with_original_value() {
        let registry = PolicyRegistry::default();
        let resolver = ConflictResolver::new(&registry);
        let rec = record(ConflictStrategy::UserChoice, json!("mine"), json!("theirs"));
        let resolution = resolver.resolve(&rec, &ResolveContext::default());
        assert!(resolution.is_deferred());
        assert_eq!(resolution.value(), &json!("theirs"));
    }

    #[test]
    fn absent_side_has_no_opinion() {
        let registry = PolicyRegistry::default();
        let resolver = ConflictResolver::new(&registry);
        let mut rec = record(ConflictStrategy::ServerWins, json!("new"), json!(null));
        rec.server_value = None;
        assert_eq!(
            resolver.resolve(&rec, &ResolveContext::default()),
            Resolution::Resolved(json!("new"))
        );
    }

    #[test]
    fn merge_overlays_client_leaves() {
        let server = json!({"name": "Ana", "prefs": {"sms": true, "email": false}, "tags": ["a"]});
        let client = json!({"prefs": {"email": true}, "tags": ["b"]});
        let merged = merge_trees(&server, &client, ArrayMerge::Atomic);
        assert_eq!(
            merged,
            json!({"name": "Ana", "prefs": {"sms": true, "email": true}, "tags": ["b"]})
        );

        let union = merge_trees(&server, &client, ArrayMerge::Union);
        assert_eq!(union["tags"], json!(["a", "b"]));
    }

    #[test]
    fn reconcile_operation_mixes_strategies() {
        let registry = registry();
        let resolver = ConflictResolver::new(&registry);
        let mut op = Operation::new(
            "op-7",
            OperationKind::ProfileUpdate,
            json!({"profile": {"email": "a@x.com", "city": "Bergen", "nickname": "AJ"}}),
            Priority::Normal,
            1,
            100,
            10_000,
        );
        op.attempts = 1;
        let server = json!({
            "profile": {"email": "b@x.com", "city": "Oslo", "nickname": "Ana"},
            "verified": true
        });

        let result = resolver.reconcile_operation(&op, &server, 500);
        assert_eq!(result.value["profile"]["email"], "b@x.com");
        assert_eq!(result.value["profile"]["city"], "Bergen");
        // Deferred field keeps the server's value as a placeholder
        assert_eq!(result.value["profile"]["nickname"], "Ana");
        assert_eq!(result.value["verified"], true);
        assert_eq!(result.resolved.len(), 3);
        assert_eq!(result.deferred.len(), 1);
        assert_eq!(result.deferred[0].id, "op-7:1:profile.nickname");
        assert!(result.needs_user());
        assert!(result.resolved.iter().all(ConflictRecord::is_resolved));
    }

    #[test]
    fn manual_progress_resumes_once_all_settled() {
        let registry = registry();
        let resolver = ConflictResolver::new(&registry);
        let mut op = Operation::new(
            "op-3",
            OperationKind::ProfileUpdate,
            json!({"profile": {"nickname": "AJ"}}),
            Priority::Normal,
            1,
            0,
            10_000,
        );
        op.attempts = 1;
        let server = json!({"profile": {"nickname": "Ana", "city": "Oslo"}});
        let result = resolver.reconcile_operation(&op, &server, 50);
        let ids: Vec<String> = result.deferred.iter().map(|r| r.id.clone()).collect();
        op.status = crate::OperationStatus::Processing;
        op.apply_patch(OperationPatch::park(ids, result.value.clone())).unwrap();

        let mut records = result.deferred.clone();
        let still_waiting = manual_progress(&op, &records, 60);
        assert_eq!(still_waiting.pending_conflicts, Some(vec!["op-3:1:profile.nickname".to_string()]));

        records[0].settle(json!("AJ"), 70);
        let patch = manual_progress(&op, &records, 80);
        assert_eq!(patch.next_attempt_at, Some(Some(80)));
        assert_eq!(
            patch.payload,
            Some(json!({"profile": {"nickname": "AJ", "city": "Oslo"}}))
        );
        op.apply_patch(patch).unwrap();
        assert!(!op.is_parked());
        assert!(op.pending_conflicts.is_empty());
    }

    #[test]
    fn path_helpers() {
        let mut tree = json!({"a": {"b": 1}});
        set_path(&mut tree, "a.c.d", json!(true));
        assert_eq!(get_path(&tree, "a.c.d"), Some(&json!(true)));
        assert_eq!(get_path(&tree, "a.b"), Some(&json!(1)));
        assert_eq!(get_path(&tree, "a.x"), None);

        set_path(&mut tree, "a.b.z", json!(2));
        assert_eq!(tree["a"]["b"], json!({"z": 2}));

        set_path(&mut tree, "", json!("root"));
        assert_eq!(tree, json!("root"));
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_leaf() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<bool>().prop_map(Value::from),
                any::<i32>().prop_map(Value::from),
                "[a-z]{0,6}".prop_map(Value::from),
            ]
        }

        fn arb_flat_object() -> impl Strategy<Value = Map<String, Value>> {
            proptest::collection::btree_map("[a-e]", arb_leaf(), 0..5)
                .prop_map(|fields| fields.into_iter().collect())
        }

        proptest! {
            #[test]
            fn prop_merge_keeps_client_then_server(
                server in arb_flat_object(),
                client in arb_flat_object(),
            ) {
                let merged = merge_trees(
                    &Value::Object(server.clone()),
                    &Value::Object(client.clone()),
                    ArrayMerge::Atomic,
                );
                for (key, value) in &client {
                    prop_assert_eq!(&merged[key], value);
                }
                for (key, value) in server.iter().filter(|(k, _)| !client.contains_key(*k)) {
                    prop_assert_eq!(&merged[key], value);
                }
            }

            #[test]
            fn prop_detect_finds_only_differences(
                server in arb_flat_object(),
                client in arb_flat_object(),
            ) {
                let diffs = diff_leaves(&Value::Object(client.clone()), &Value::Object(server.clone()));
                for diff in &diffs {
                    prop_assert_ne!(client.get(&diff.path), server.get(&diff.path));
                }
                let differing = client
                    .keys()
                    .chain(server.keys())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .filter(|k| client.get(*k) != server.get(*k))
                    .count();
                prop_assert_eq!(diffs.len(), differing);
            }

            #[test]
            fn prop_resolution_idempotent(
                client in arb_leaf(),
                server in arb_leaf(),
                client_at in proptest::option::of(0u64..1_000),
                server_at in proptest::option::of(0u64..1_000),
            ) {
                let registry = PolicyRegistry::default();
                let resolver = ConflictResolver::new(&registry);
                let ctx = ResolveContext { client_timestamp: client_at, server_timestamp: server_at, now: 500 };
                let rec = record(ConflictStrategy::LastWriteWins, client, server);
                prop_assert_eq!(resolver.resolve(&rec, &ctx), resolver.resolve(&rec, &ctx));
            }
        }
    }
}

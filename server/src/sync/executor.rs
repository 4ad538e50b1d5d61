//! The sync executor.
//!
//! A pass drains the eligible operations of one kind, one at a time and in
//! scheduler order. At most one pass per kind runs at any moment; a second
//! request while one is running returns [`PassOutcome::Busy`] and does
//! nothing. Nothing inside a pass is returned as an error: failures are
//! logged, counted and published on the event bus.

use crate::db::{SharedStore, StoreResult};
use crate::events::{EngineEvent, EventBus, Metrics};
use crate::handlers::{DispatchContext, HandlerOutcome, HandlerRegistry, OperationHandler};
use crate::session::SessionStore;
use dashmap::DashSet;
use lifeline_engine::{
    is_eligible, Clock, ConflictResolver, Failure, Operation, OperationKind, OperationPatch,
    PolicyRegistry, RetryController, RetryDecision, Timestamp,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Writes of an attempt's outcome are tried this many times.
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;
const OUTCOME_WRITE_BACKOFF: Duration = Duration::from_millis(25);

/// Tunables for [`SyncExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Upper bound on one handler call
    pub attempt_timeout: Duration,
    /// Terminal operations older than this are purged after each pass
    pub audit_retention: Duration,
    /// Skip passes while no session is held
    pub require_session: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            audit_retention: Duration::from_secs(7 * 24 * 60 * 60),
            require_session: false,
        }
    }
}

/// Tally of one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub kind: Option<OperationKind>,
    /// Operations dispatched to the handler
    pub processed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub expired: usize,
    pub parked: usize,
    pub purged: usize,
}

/// What a request for a pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass of this kind is running
    Busy { kind: OperationKind },
    /// A session is required and none is held
    NoSession { kind: OperationKind },
    NoHandler { kind: OperationKind },
    /// The store could not be read
    Aborted { kind: OperationKind, error: String },
}

impl PassOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Removes the kind from the in-flight set when the pass ends, however it ends.
struct PassGuard<'a> {
    in_flight: &'a DashSet<OperationKind>,
    kind: OperationKind,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.kind);
    }
}

/// Drives operations from the store through their handlers.
pub struct SyncExecutor {
    store: SharedStore,
    handlers: HandlerRegistry,
    policies: Arc<PolicyRegistry>,
    clock: Arc<dyn Clock>,
    sessions: Arc<SessionStore>,
    events: EventBus,
    metrics: Arc<Metrics>,
    settings: ExecutorSettings,
    in_flight: DashSet<OperationKind>,
}

impl SyncExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStore,
        handlers: HandlerRegistry,
        policies: Arc<PolicyRegistry>,
        clock: Arc<dyn Clock>,
        sessions: Arc<SessionStore>,
        events: EventBus,
        metrics: Arc<Metrics>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            handlers,
            policies,
            clock,
            sessions,
            events,
            metrics,
            settings,
            in_flight: DashSet::new(),
        }
    }

    /// Kinds with a registered handler.
    pub fn kinds(&self) -> Vec<OperationKind> {
        self.handlers.kinds()
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.in_flight.contains(&kind)
    }

    /// Move operations interrupted by a previous run back into the queue.
    ///
    /// Operations that already spent their retry budget are dead-lettered.
    pub async fn recover(&self) -> StoreResult<usize> {
        let recovered = self
            .store
            .recover_interrupted(self.clock.now(), &self.policies)
            .await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "Recovered interrupted operations");
        }
        Ok(recovered.len())
    }

    /// Run a pass for every kind with a handler. Kinds run concurrently.
    pub async fn run_all(&self) -> Vec<PassOutcome> {
        let passes = self.kinds().into_iter().map(|kind| self.run_pass(kind));
        futures::future::join_all(passes).await
    }

    /// Run one pass for `kind`.
    pub async fn run_pass(&self, kind: OperationKind) -> PassOutcome {
        if !self.in_flight.insert(kind) {
            tracing::debug!(%kind, "Pass already running, skipping");
            return PassOutcome::Busy { kind };
        }
        let _guard = PassGuard {
            in_flight: &self.in_flight,
            kind,
        };

        let Some(handler) = self.handlers.get(kind) else {
            tracing::warn!(%kind, "No handler registered");
            return PassOutcome::NoHandler { kind };
        };

        if self.settings.require_session && self.sessions.get().await.is_none() {
            tracing::debug!(%kind, "No session, pass skipped");
            return PassOutcome::NoSession { kind };
        }

        let now = self.clock.now();
        let schedule = match self.store.schedule(Some(kind), now).await {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::error!(%kind, error = %e, "Failed to read the queue");
                return PassOutcome::Aborted {
                    kind,
                    error: e.to_string(),
                };
            }
        };

        let mut report = PassReport {
            kind: Some(kind),
            ..PassReport::default()
        };

        for id in schedule.expired {
            match self.store.update(&id, OperationPatch::expire(now)).await {
                Ok(_) => {
                    tracing::info!(op_id = %id, %kind, "Operation expired");
                    report.expired += 1;
                    Metrics::incr(&self.metrics.expired);
                    self.events.publish(EngineEvent::Expired { id, kind });
                }
                Err(e) => tracing::warn!(op_id = %id, error = %e, "Failed to expire operation"),
            }
        }

        for candidate in schedule.eligible {
            // Another task may have touched it since the schedule was read.
            let op = match self.store.get(&candidate.id).await {
                Ok(Some(op)) if is_eligible(&op, self.clock.now()) => op,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(op_id = %candidate.id, error = %e, "Failed to re-read operation");
                    continue;
                }
            };

            if let Err(e) = self.process(op, handler.as_ref(), &mut report).await {
                tracing::error!(op_id = %candidate.id, %kind, error = %e, "Failed to record attempt");
            }
        }

        let retention_ms = u64::try_from(self.settings.audit_retention.as_millis()).unwrap_or(u64::MAX);
        match self.store.purge_terminal(self.clock.now(), retention_ms).await {
            Ok(purged) => {
                report.purged = purged.len();
                Metrics::add(&self.metrics.purged, purged.len());
            }
            Err(e) => tracing::warn!(error = %e, "Audit purge failed"),
        }

        Metrics::incr(&self.metrics.passes);
        tracing::debug!(
            %kind,
            processed = report.processed,
            delivered = report.delivered,
            retried = report.retried,
            "Pass completed"
        );
        self.events.publish(EngineEvent::PassCompleted {
            kind,
            processed: report.processed,
            purged: report.purged,
        });

        PassOutcome::Completed(report)
    }

    /// One attempt of one operation.
    ///
    /// Once the attempt has begun the operation never stays in `processing`:
    /// if its outcome cannot be written it is released as a retryable
    /// failure.
    async fn process(
        &self,
        op: Operation,
        handler: &dyn OperationHandler,
        report: &mut PassReport,
    ) -> StoreResult<()> {
        let op = self
            .store
            .update(&op.id, OperationPatch::begin_attempt(&op, self.clock.now()))
            .await?;
        report.processed += 1;
        tracing::debug!(op_id = %op.id, kind = %op.kind, attempt = op.attempts, "Dispatching");

        let ctx = DispatchContext {
            access_token: self.sessions.access_token().await,
        };
        let outcome =
            match tokio::time::timeout(self.settings.attempt_timeout, handler.dispatch(&op, &ctx))
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => HandlerOutcome::Retryable(e.to_string()),
                Err(_) => HandlerOutcome::Retryable(format!(
                    "attempt timed out after {}ms",
                    self.settings.attempt_timeout.as_millis()
                )),
            };

        if let Err(e) = self.settle(&op, outcome, report).await {
            tracing::error!(
                op_id = %op.id,
                kind = %op.kind,
                error = %e,
                "Failed to record attempt outcome, releasing operation"
            );
            let failure = Failure::Retryable(format!("attempt outcome not recorded: {e}"));
            self.failed(&op, failure, self.clock.now(), report).await?;
        }
        Ok(())
    }

    /// Record what the handler said about an attempt.
    async fn settle(
        &self,
        op: &Operation,
        outcome: HandlerOutcome,
        report: &mut PassReport,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        match outcome {
            HandlerOutcome::Delivered(value) => {
                let patch = OperationPatch::deliver(now, value);
                self.write_outcome(&op.id, || self.store.update(&op.id, patch.clone()))
                    .await?;
                self.delivered(op, report);
            }
            HandlerOutcome::Conflict { server_data } => {
                self.reconcile(op, &server_data, now, report).await?;
            }
            HandlerOutcome::Retryable(msg) => {
                self.failed(op, Failure::Retryable(msg), now, report).await?;
            }
            HandlerOutcome::Permanent(msg) => {
                self.failed(op, Failure::Permanent(msg), now, report).await?;
            }
        }
        Ok(())
    }

    /// Run an outcome write, retrying failures of the store itself.
    ///
    /// Engine errors mean the write can never succeed and are returned at once.
    async fn write_outcome<T, F, Fut>(&self, id: &str, mut write: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Err(e) if e.engine().is_none() && attempt < OUTCOME_WRITE_ATTEMPTS => {
                    tracing::warn!(op_id = %id, attempt, error = %e, "Outcome write failed, retrying");
                    tokio::time::sleep(OUTCOME_WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn delivered(&self, op: &Operation, report: &mut PassReport) {
        tracing::info!(op_id = %op.id, kind = %op.kind, attempts = op.attempts, "Delivered");
        report.delivered += 1;
        Metrics::incr(&self.metrics.delivered);
        self.events.publish(EngineEvent::Delivered {
            id: op.id.clone(),
            kind: op.kind,
            attempts: op.attempts,
        });
    }

    async fn reconcile(
        &self,
        op: &Operation,
        server_data: &serde_json::Value,
        now: Timestamp,
        report: &mut PassReport,
    ) -> StoreResult<()> {
        let reconciliation =
            ConflictResolver::new(&self.policies).reconcile_operation(op, server_data, now);
        tracing::info!(
            op_id = %op.id,
            conflicts = reconciliation.conflict_count(),
            deferred = reconciliation.deferred.len(),
            "Server reported a conflict"
        );

        for record in &reconciliation.resolved {
            Metrics::incr(&self.metrics.conflicts_resolved);
            self.events.publish(EngineEvent::ConflictResolved {
                id: op.id.clone(),
                field_path: record.field_path.clone(),
                strategy: record.resolution_strategy,
            });
        }

        if !reconciliation.needs_user() {
            let patch = OperationPatch::deliver(now, Some(reconciliation.value));
            self.write_outcome(&op.id, || self.store.update(&op.id, patch.clone()))
                .await?;
            self.delivered(op, report);
            return Ok(());
        }

        let deferred = reconciliation.deferred;
        let ids = deferred.iter().map(|record| record.id.clone()).collect();
        let patch = OperationPatch::park(ids, reconciliation.value);
        self.write_outcome(&op.id, || {
            self.store.park(&op.id, deferred.clone(), patch.clone())
        })
        .await?;

        for record in &deferred {
            Metrics::incr(&self.metrics.conflicts_parked);
            self.events.publish(EngineEvent::ConflictParked {
                id: op.id.clone(),
                conflict_id: record.id.clone(),
                field_path: record.field_path.clone(),
            });
        }
        tracing::info!(op_id = %op.id, "Parked for manual conflict resolution");
        report.parked += 1;
        Ok(())
    }

    async fn failed(
        &self,
        op: &Operation,
        failure: Failure,
        now: Timestamp,
        report: &mut PassReport,
    ) -> StoreResult<()> {
        let decision = RetryController::new(&self.policies).decide(op, &failure, now);
        let patch = decision.to_patch(now);
        self.write_outcome(&op.id, || self.store.update(&op.id, patch.clone()))
            .await?;

        match decision {
            RetryDecision::Retry {
                delay_ms,
                next_attempt_at,
                error,
            } => {
                tracing::warn!(
                    op_id = %op.id,
                    kind = %op.kind,
                    attempts = op.attempts,
                    delay_ms,
                    error = %error,
                    "Attempt failed, retry scheduled"
                );
                report.retried += 1;
                Metrics::incr(&self.metrics.retried);
                self.events.publish(EngineEvent::RetryScheduled {
                    id: op.id.clone(),
                    kind: op.kind,
                    attempts: op.attempts,
                    next_attempt_at,
                    error,
                });
            }
            RetryDecision::DeadLetter { reason } => {
                tracing::error!(
                    op_id = %op.id,
                    kind = %op.kind,
                    attempts = op.attempts,
                    reason = %reason,
                    "Operation dead-lettered"
                );
                report.dead_lettered += 1;
                Metrics::incr(&self.metrics.dead_lettered);
                self.events.publish(EngineEvent::DeadLettered {
                    id: op.id.clone(),
                    kind: op.kind,
                    attempts: op.attempts,
                    reason,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncExecutor")
            .field("handlers", &self.handlers)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

//! Lifeline Server - offline sync agent.
//!
//! Hosts the durable operation queue, delivers queued work to the upstream
//! REST API with retries and conflict reconciliation, and exposes a local
//! control API for the host application.
//!
//! ```text
//! caller ──enqueue──▶ QueueService ──▶ OperationStore ◀──┐
//!                                                        │
//! NetworkTrigger ──run_pass──▶ SyncExecutor ──dispatch──▶ OperationHandler
//!                                   │
//!                                   └──▶ EventBus / Metrics
//! ```

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod queue;
pub mod routes;
pub mod session;
pub mod sync;

use crate::config::Config;
use crate::db::SharedStore;
use crate::events::{EventBus, Metrics};
use crate::handlers::HandlerRegistry;
use crate::queue::QueueService;
use crate::session::SessionStore;
use crate::sync::{ExecutorSettings, NetworkTrigger, SyncExecutor};
use axum::Router;
use lifeline_engine::{Clock, PolicyRegistry};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub queue: QueueService,
    pub executor: Arc<SyncExecutor>,
    pub trigger: Arc<NetworkTrigger>,
    pub sessions: Arc<SessionStore>,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wire the services together around `store`.
    pub fn new(
        config: Config,
        store: SharedStore,
        handlers: HandlerRegistry,
        policies: PolicyRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policies = Arc::new(policies);
        let events = EventBus::default();
        let metrics = Arc::new(Metrics::default());
        let sessions = Arc::new(SessionStore::new());

        let settings = ExecutorSettings {
            attempt_timeout: config.attempt_timeout,
            audit_retention: config.audit_retention,
            require_session: config.token_refresh_url.is_some(),
        };
        let executor = Arc::new(SyncExecutor::new(
            store.clone(),
            handlers,
            policies.clone(),
            clock.clone(),
            sessions.clone(),
            events.clone(),
            metrics.clone(),
            settings,
        ));
        let trigger = Arc::new(NetworkTrigger::new(executor.clone(), events.clone()));
        let queue = QueueService::new(
            store.clone(),
            policies,
            clock.clone(),
            events.clone(),
            metrics.clone(),
        );

        Self {
            config: Arc::new(config),
            store,
            queue,
            executor,
            trigger,
            sessions,
            events,
            metrics,
            clock,
        }
    }
}

/// The control API with its middleware.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

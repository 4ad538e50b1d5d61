//! Health and statistics endpoints.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use lifeline_engine::PriorityScheduler;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::events::MetricsSnapshot;
use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Queue statistics.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub online: bool,
    pub queued: usize,
    pub by_status: BTreeMap<String, usize>,
    /// When the earliest waiting retry becomes due
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub metrics: MetricsSnapshot,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /stats
async fn stats(State(state): State<AppState>, _auth: AuthUser) -> Result<Json<StatsResponse>> {
    let operations = state.store.list_all().await?;
    let mut by_status = BTreeMap::new();
    for op in &operations {
        *by_status.entry(op.status.to_string()).or_insert(0) += 1;
    }

    let next_retry_at = PriorityScheduler::next_wake(&operations, state.clock.now())
        .and_then(|at| i64::try_from(at).ok())
        .and_then(DateTime::from_timestamp_millis);

    Ok(Json(StatsResponse {
        online: state.trigger.is_online(),
        queued: operations.len(),
        by_status,
        next_retry_at,
        metrics: state.metrics.snapshot(),
    }))
}

/// Root handler.
async fn root() -> &'static str {
    "Lifeline Sync Agent"
}

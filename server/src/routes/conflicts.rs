//! Manual conflict resolution endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use lifeline_engine::{ConflictRecord, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::AppState;

/// Body of a resolution.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// The value chosen for the field
    pub value: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub record: ConflictRecord,
    pub operation: Option<Operation>,
    pub resumed: bool,
}

/// Create conflict routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
}

/// GET /conflicts - Records awaiting a decision.
async fn list_conflicts(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Vec<ConflictRecord>>> {
    let records = state.store.list_conflicts().await?;
    Ok(Json(
        records
            .into_iter()
            .filter(|record| !record.is_resolved())
            .collect(),
    ))
}

/// POST /conflicts/{id}/resolve
async fn resolve_conflict(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
    body: std::result::Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<ResolveResponse>> {
    let Json(request) = body?;
    let resolution = state.queue.resolve_conflict(&id, request.value).await?;
    if resolution.resumed && state.trigger.is_online() {
        state.trigger.request_sync();
    }
    Ok(Json(ResolveResponse {
        record: resolution.record,
        operation: resolution.operation,
        resumed: resolution.resumed,
    }))
}

//! Operation queue endpoints.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::get,
    Json, Router,
};
use lifeline_engine::{EnqueueRequest, Operation, OperationKind, OperationStatus};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::AppState;

/// Filters for listing operations.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<OperationStatus>,
    #[serde(rename = "type")]
    pub kind: Option<OperationKind>,
}

/// Create operation routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/operations", get(list_operations).post(enqueue))
        .route(
            "/operations/{id}",
            get(get_operation).delete(cancel_operation),
        )
}

/// POST /operations - Queue an operation.
async fn enqueue(
    State(state): State<AppState>,
    _auth: AuthUser,
    body: std::result::Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Operation>)> {
    let Json(request) = body?;
    let op = state.queue.enqueue(request).await?;
    if state.trigger.is_online() {
        state.trigger.request_sync();
    }
    Ok((StatusCode::CREATED, Json(op)))
}

/// GET /operations - List operations, optionally filtered.
async fn list_operations(
    State(state): State<AppState>,
    _auth: AuthUser,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Operation>>> {
    let Query(query) = query?;
    let mut operations = match (query.status, query.kind) {
        (Some(status), _) => state.store.list_by_status(status).await?,
        (None, Some(kind)) => state.store.list_by_kind(kind).await?,
        (None, None) => state.store.list_all().await?,
    };
    if let (Some(_), Some(kind)) = (query.status, query.kind) {
        operations.retain(|op| op.kind == kind);
    }
    Ok(Json(operations))
}

/// GET /operations/{id}
async fn get_operation(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Operation>> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("operation {id}")))
}

/// DELETE /operations/{id} - Cancel a pending operation.
async fn cancel_operation(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Operation>> {
    Ok(Json(state.queue.cancel(&id).await?))
}

//! Signals from the host application.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::session::Session;
use crate::sync::PassOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectivityRequest {
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectivityResponse {
    pub online: bool,
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub online: bool,
    pub passes: Vec<PassOutcome>,
}

/// Create control routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/connectivity", post(connectivity))
        .route("/visibility", post(visibility))
        .route("/sync", post(sync_now))
        .route("/session", put(set_session).delete(clear_session))
}

/// POST /connectivity - The host's network state changed.
async fn connectivity(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<ConnectivityRequest>,
) -> Json<ConnectivityResponse> {
    let changed = state.trigger.set_online(request.online);
    Json(ConnectivityResponse {
        online: request.online,
        changed,
    })
}

/// POST /visibility - The host moved to or from the foreground.
async fn visibility(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<VisibilityRequest>,
) -> StatusCode {
    if request.visible {
        state.trigger.became_visible();
    }
    StatusCode::ACCEPTED
}

/// POST /sync - Run passes now and report them.
async fn sync_now(State(state): State<AppState>, _auth: AuthUser) -> Json<SyncResponse> {
    let passes = state.trigger.sync_now().await;
    Json(SyncResponse {
        online: passes.is_some(),
        passes: passes.unwrap_or_default(),
    })
}

/// PUT /session - Hand the agent the user's current session.
async fn set_session(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(session): Json<Session>,
) -> StatusCode {
    tracing::info!(expires_at = session.expires_at, "Session installed");
    state.sessions.set(session).await;
    if state.trigger.is_online() {
        state.trigger.request_sync();
    }
    StatusCode::NO_CONTENT
}

/// DELETE /session - The user signed out.
async fn clear_session(State(state): State<AppState>, _auth: AuthUser) -> StatusCode {
    state.sessions.clear().await;
    StatusCode::NO_CONTENT
}

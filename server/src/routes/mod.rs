//! HTTP route definitions.

mod conflicts;
mod control;
mod events;
mod health;
mod operations;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(operations::routes())
        .merge(conflicts::routes())
        .merge(control::routes())
        .merge(events::routes())
}

//! Live event stream over a websocket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::auth::AuthUser;
use crate::events::EventBus;
use crate::AppState;

/// Create event routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/events", get(events_handler))
}

/// GET /events - Upgrade and stream every engine event as JSON text frames.
async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Response {
    let events = state.events.clone();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

async fn stream_events(socket: WebSocket, events: EventBus) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut subscription = events.subscribe();
    tracing::info!(listeners = events.listener_count(), "Event listener connected");

    let send_task = tokio::spawn(async move {
        loop {
            let event = match subscription.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event listener lagging, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::debug!("Failed to send event: {}", e);
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize event: {}", e),
            }
        }
    });

    // Only close frames and errors matter from the listener.
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Event socket error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    tracing::info!("Event listener disconnected");
}

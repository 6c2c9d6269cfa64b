//! WebSocket push: forwards loop broadcasts to dashboard subscribers.
//!
//! Fire-and-forget. A subscriber that falls behind misses events (the
//! broadcast channel is lossy by design) but never sees them out of order.

use crate::api::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut updates = state.broadcast.subscribe();
    info!("WS subscriber connected");

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(value) => {
                        let Ok(text) = serde_json::to_string(&value) else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!("WS subscriber lagged, {missed} events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    info!("WS subscriber disconnected");
}

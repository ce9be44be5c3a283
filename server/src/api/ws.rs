//! WebSocket stream of engine tick frames.
//!
//! One-way: each subscriber gets the broadcast frames as JSON text. Slow
//! consumers lag and skip frames; the next frame reflects ground truth, so
//! nothing is replayed.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

pub(super) async fn stream(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_ticks(socket, state))
}

async fn forward_ticks(mut socket: WebSocket, state: Arc<AppState>) {
    let mut frames = state.ticks.subscribe();
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "tick subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Ok(payload) = serde_json::to_string(&frame) else {
                    continue;
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Inbound content is ignored; the stream is one-way.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

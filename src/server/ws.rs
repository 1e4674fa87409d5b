use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::AppState;
use crate::orchestrator::SessionEvent;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A client that has not answered a ping for this long is dropped.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    /// Only forward events for this session.
    pub session_id: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &SessionEvent) -> bool {
        let Some(wanted) = &self.session_id else {
            return true;
        };
        let session_id = match event {
            SessionEvent::CheckpointWritten { session_id, .. }
            | SessionEvent::Paused { session_id, .. }
            | SessionEvent::Completed { session_id }
            | SessionEvent::StepFailed { session_id, .. } => session_id,
        };
        session_id == wanted
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<EventFilter>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, filter))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<SessionEvent>, filter: EventFilter) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, filter).await;
}

/// Forward session events to the client until it goes away or stops
/// answering pings.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<SessionEvent>,
    filter: EventFilter,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick fires immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket client stopped answering pings");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) if filter.matches(&event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::warn!("failed to serialize session event: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket client lagging behind events");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

use crate::handlers::AppState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A state-change notification pushed to observing clients.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    pub event: String,
    pub company_id: String,
    pub payload: Value,
}

impl RealtimeEvent {
    pub fn new(event: &str, company_id: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            company_id: company_id.to_string(),
            payload,
        }
    }
}

/// At-most-once fan-out of state changes to connected clients.
///
/// Delivery is fire-and-forget: no subscribers, slow subscribers and dropped
/// notifications are all fine, because the store remains the source of truth
/// and late subscribers can always re-query. Nothing in the business flow may
/// depend on a notification arriving.
#[derive(Clone)]
pub struct RealtimePublisher {
    tx: broadcast::Sender<String>,
}

impl RealtimePublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to whoever is listening right now.
    pub fn publish(&self, event: &RealtimeEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => {
                // A send error only means there are no subscribers.
                let _ = self.tx.send(payload);
            }
            Err(e) => {
                tracing::warn!("Failed to serialize realtime event: {}", e);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// WebSocket upgrade for dashboard clients.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.realtime.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    if ws_sender.send(WsMessage::Text(payload)).await.is_err() {
                        break;
                    }
                }
                // Lagged subscribers skip missed events; they can re-query.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Realtime subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Clients only listen; drain incoming frames until close.
    while let Some(Ok(message)) = ws_receiver.next().await {
        if let WsMessage::Close(_) = message {
            break;
        }
    }

    send_task.abort();
    let _ = (&mut send_task).await;
}

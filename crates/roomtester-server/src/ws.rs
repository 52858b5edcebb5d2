//! WebSocket handler for transport control and live metering
//!
//! Clients connect to /api/v1/ws. Each connection receives the audio
//! metadata and current state on connect, every broadcast state change, and
//! the meter events for its own subscriptions.

use crate::messages::{AudioInfo, ClientMessage, ServerMessage};
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use roomtester_core::{Source, SubscriberId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-client outbox capacity; meter events beyond this are dropped
const CLIENT_QUEUE_SIZE: usize = 64;

/// Outboxes of connected clients, keyed by subscriber id
#[derive(Clone, Default)]
pub struct ClientRegistry {
    outboxes: Arc<Mutex<HashMap<SubscriberId, mpsc::Sender<String>>>>,
    next_id: Arc<AtomicU64>,
}

impl ClientRegistry {
    /// Register a new client and return its id and inbox
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_SIZE);
        if let Ok(mut outboxes) = self.outboxes.lock() {
            outboxes.insert(id, tx);
        }
        (id, rx)
    }

    pub fn remove(&self, id: SubscriberId) {
        if let Ok(mut outboxes) = self.outboxes.lock() {
            outboxes.remove(&id);
        }
    }

    /// Queue `message` for client `id` without waiting
    ///
    /// Returns false when the client is gone or its queue is full.
    pub fn send(&self, id: SubscriberId, message: String) -> bool {
        let Ok(outboxes) = self.outboxes.lock() else {
            return false;
        };
        match outboxes.get(&id) {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }

    /// Number of connected clients
    pub fn connected(&self) -> usize {
        self.outboxes.lock().map(|o| o.len()).unwrap_or(0)
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Metadata of the loaded recordings
pub fn audio_loaded_json(state: &AppState) -> Option<String> {
    ServerMessage::AudioLoaded {
        reference: AudioInfo::from(state.store.get(Source::Reference).as_ref()),
        room: AudioInfo::from(state.store.get(Source::Room).as_ref()),
    }
    .to_json()
}

/// Handle an individual WebSocket connection
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (id, mut inbox) = state.clients.register();
    tracing::info!(
        client = id,
        connected = state.clients.connected(),
        "Client connected"
    );

    // Initial metadata and state
    if let Some(json) = audio_loaded_json(&state) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }
    if let Some(json) = ServerMessage::State(state.transport().status()).to_json() {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    // Subscribe to broadcast channel
    let mut rx = state.ws_tx.subscribe();

    // Forward broadcasts and this client's own messages
    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(msg) => msg,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "WebSocket client lagging");
                        continue;
                    }
                    Err(_) => break,
                },
                msg = inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming commands
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => handle_client_message(&recv_state, id, text.as_str()).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    state.clients.remove(id);
    if let Ok(mut metering) = state.metering.lock() {
        metering.remove_subscriber(id);
    }
    tracing::info!(
        client = id,
        connected = state.clients.connected(),
        "Client disconnected"
    );
}

/// Act on one text message from client `id`
pub async fn handle_client_message(state: &AppState, id: SubscriberId, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(client = id, "Ignoring malformed message: {}", e);
            return;
        }
    };

    // Transport commands broadcast their resulting state from the engine thread
    let result = match msg {
        ClientMessage::Play => state.engine.play().await.map(|_| ()),
        ClientMessage::Pause => state.engine.pause().await.map(|_| ()),
        ClientMessage::Seek { position } => state.engine.seek(position).await.map(|_| ()),
        ClientMessage::Source { name } => state.engine.switch_source(name).await.map(|_| ()),
        ClientMessage::Subscribe { name } => {
            subscribe(state, id, &name);
            Ok(())
        }
        ClientMessage::Unsubscribe { name } => {
            if let Ok(mut metering) = state.metering.lock() {
                metering.unsubscribe(id, &name);
            }
            Ok(())
        }
        ClientMessage::Log { category, message } => {
            tracing::info!(target: "roomtester::frontend", category = %category, "{}", message);
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::warn!(client = id, "Command failed: {}", e);
    }
}

/// Subscribe `id` to `name`, sending stored history first when any exists
fn subscribe(state: &AppState, id: SubscriberId, name: &str) {
    let history = match state.metering.lock() {
        Ok(mut metering) => metering.subscribe(id, name),
        Err(_) => return,
    };
    if let Some(history) = history {
        let msg = ServerMessage::MeterHistory {
            name: name.to_string(),
            history,
        };
        if let Some(json) = msg.to_json() {
            state.clients.send(id, json);
        }
    }
}

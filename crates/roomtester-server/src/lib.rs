//! Roomtester Web Server - Axum REST + WebSocket control plane
//!
//! Issues transport commands to the playback engine thread, manages metering
//! subscriptions and serves the measurement history.

pub mod api;
pub mod messages;
pub mod tasks;
pub mod ws;

use crate::messages::ServerMessage;
use crate::ws::ClientRegistry;
use axum::http::{header, HeaderValue};
use axum::Router;
use crossbeam_channel::{Receiver, Sender};
use roomtester_core::audio::transport::TransportRequest;
use roomtester_core::{AudioStore, MeteringContext, PlaybackEngine, PlaybackStatus, Transport};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Capacity of the command channel to the engine thread
const COMMAND_CHANNEL_SIZE: usize = 32;

/// Capacity of the broadcast channel to WebSocket clients
const BROADCAST_CHANNEL_SIZE: usize = 256;

/// Commands sent to the engine thread
pub enum EngineCommand {
    Play {
        reply: oneshot::Sender<anyhow::Result<PlaybackStatus>>,
    },
    Pause {
        reply: oneshot::Sender<PlaybackStatus>,
    },
    Seek {
        position: f64,
        reply: oneshot::Sender<PlaybackStatus>,
    },
    Source {
        name: String,
        reply: oneshot::Sender<PlaybackStatus>,
    },
    GetStatus {
        reply: oneshot::Sender<PlaybackStatus>,
    },
}

/// Handle to communicate with the engine thread
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<EngineCommand>,
    transport: Arc<Transport>,
}

fn engine_died<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("Engine thread died")
}

/// Send `message` to every connected client
pub fn broadcast(ws_tx: &broadcast::Sender<String>, message: ServerMessage) {
    if ws_tx.receiver_count() == 0 {
        return;
    }
    if let Some(json) = message.to_json() {
        let _ = ws_tx.send(json);
    }
}

/// Broadcast the transport state to every connected client
pub fn broadcast_state(ws_tx: &broadcast::Sender<String>, status: PlaybackStatus) {
    broadcast(ws_tx, ServerMessage::State(status));
}

impl EngineHandle {
    /// Spawn the engine on a dedicated thread and return a handle
    ///
    /// The thread owns the output stream. Besides commands it consumes the
    /// stop requests posted by the render callback, and broadcasts the state
    /// after every transport-affecting change.
    pub fn spawn(store: Arc<AudioStore>, ws_tx: broadcast::Sender<String>) -> anyhow::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<EngineCommand>(COMMAND_CHANNEL_SIZE);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        std::thread::Builder::new()
            .name("playback-engine".to_string())
            .spawn(move || {
                let mut engine = PlaybackEngine::new(store);
                let requests = engine.requests().clone();
                let _ = ready_tx.send(Arc::clone(engine.transport()));
                run_engine(&mut engine, &rx, &requests, &ws_tx);
                tracing::debug!("Engine thread exiting");
            })?;

        let transport = ready_rx.recv().map_err(engine_died)?;
        Ok(Self { tx, transport })
    }

    /// Shared transport state (read-only use from other tasks)
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    fn send(&self, cmd: EngineCommand) -> anyhow::Result<()> {
        self.tx.try_send(cmd).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(_) => anyhow::anyhow!("Engine busy"),
            crossbeam_channel::TrySendError::Disconnected(_) => engine_died(()),
        })
    }

    pub async fn play(&self) -> anyhow::Result<PlaybackStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Play { reply })?;
        rx.await.map_err(engine_died)?
    }

    pub async fn pause(&self) -> anyhow::Result<PlaybackStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Pause { reply })?;
        rx.await.map_err(engine_died)
    }

    pub async fn seek(&self, position: f64) -> anyhow::Result<PlaybackStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Seek { position, reply })?;
        rx.await.map_err(engine_died)
    }

    pub async fn switch_source(&self, name: String) -> anyhow::Result<PlaybackStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Source { name, reply })?;
        rx.await.map_err(engine_died)
    }

    pub async fn get_status(&self) -> anyhow::Result<PlaybackStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::GetStatus { reply })?;
        rx.await.map_err(engine_died)
    }
}

fn run_engine(
    engine: &mut PlaybackEngine,
    commands: &Receiver<EngineCommand>,
    requests: &Receiver<TransportRequest>,
    ws_tx: &broadcast::Sender<String>,
) {
    loop {
        crossbeam_channel::select! {
            recv(commands) -> cmd => {
                let Ok(cmd) = cmd else {
                    break;
                };
                handle_command(engine, cmd, ws_tx);
            }
            recv(requests) -> request => {
                if let Ok(request) = request {
                    if engine.handle_request(request) {
                        tracing::info!("Playback reached end of source");
                        broadcast_state(ws_tx, engine.status());
                    }
                }
            }
        }
    }
}

fn handle_command(
    engine: &mut PlaybackEngine,
    cmd: EngineCommand,
    ws_tx: &broadcast::Sender<String>,
) {
    match cmd {
        EngineCommand::Play { reply } => {
            let result = engine.play().map_err(anyhow::Error::from);
            match &result {
                Ok(true) => broadcast_state(ws_tx, engine.status()),
                Ok(false) => {}
                Err(e) => tracing::error!("Failed to start playback: {}", e),
            }
            let _ = reply.send(result.map(|_| engine.status()));
        }
        EngineCommand::Pause { reply } => {
            if engine.pause() {
                broadcast_state(ws_tx, engine.status());
            }
            let _ = reply.send(engine.status());
        }
        EngineCommand::Seek { position, reply } => {
            engine.seek(position);
            broadcast_state(ws_tx, engine.status());
            let _ = reply.send(engine.status());
        }
        EngineCommand::Source { name, reply } => {
            if engine.switch_source(&name) {
                broadcast_state(ws_tx, engine.status());
            }
            let _ = reply.send(engine.status());
        }
        EngineCommand::GetStatus { reply } => {
            let _ = reply.send(engine.status());
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    /// Handle to engine thread
    pub engine: EngineHandle,
    /// The three playable sources
    pub store: Arc<AudioStore>,
    /// Measurement registry, subscriptions and history
    pub metering: Arc<Mutex<MeteringContext>>,
    /// Per-client outboxes for targeted messages
    pub clients: ClientRegistry,
    /// WebSocket broadcast channel
    pub ws_tx: broadcast::Sender<String>,
    /// Server configuration
    pub config: ServerConfig,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl AppState {
    /// Spawn the engine thread over `store` and assemble the shared state
    pub fn new(
        store: Arc<AudioStore>,
        metering: MeteringContext,
        config: ServerConfig,
    ) -> anyhow::Result<Self> {
        let (ws_tx, _) = broadcast::channel(BROADCAST_CHANNEL_SIZE);
        let engine = EngineHandle::spawn(Arc::clone(&store), ws_tx.clone())?;
        Ok(Self {
            engine,
            store,
            metering: Arc::new(Mutex::new(metering)),
            clients: ClientRegistry::default(),
            ws_tx,
            config,
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        self.engine.transport()
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // REST API
        .route("/api/v1/status", axum::routing::get(api::get_status))
        .route("/api/v1/transport/play", axum::routing::post(api::play))
        .route("/api/v1/transport/pause", axum::routing::post(api::pause))
        .route("/api/v1/transport/seek", axum::routing::post(api::seek))
        .route("/api/v1/source", axum::routing::post(api::switch_source))
        .route("/api/v1/meters", axum::routing::get(api::list_meters))
        .route("/api/v1/history/{meter}", axum::routing::get(api::get_history))
        .route(
            "/api/v1/history/{meter}/export",
            axum::routing::get(api::export_history),
        )
        // Remote control of connected frontends
        .route("/api/v1/client/click", axum::routing::post(api::client_click))
        .route("/api/v1/client/refresh", axum::routing::post(api::client_refresh))
        // WebSocket
        .route("/api/v1/ws", axum::routing::get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Start the web server and the periodic tasks, until `shutdown` resolves
pub async fn start_server<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let position_task = tokio::spawn(tasks::position_report_loop(state.clone()));
    let metering_task = tokio::spawn(tasks::metering_loop(state.clone()));
    let app = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Roomtester web server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    position_task.abort();
    metering_task.abort();
    served?;
    Ok(())
}

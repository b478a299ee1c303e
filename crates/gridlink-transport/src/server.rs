//! WebSocket transport server using Axum.
//!
//! Handles HTTP upgrade to WebSocket, hands each socket to a
//! [`Connection`](crate::connection::Connection) driven by its two worker
//! loops, and exposes the HTTP tool-response ingress.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::WebSocket,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use gridlink_protocol::{AuthConfig, ToolResponsePayload};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::connection::{self, Connection, ConnectionSettings};
use crate::error::TransportError;
use crate::handler::MessageHandler;
use crate::hub::HubHandle;

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Capacity of each connection's outbound queue
    pub outbound_queue_size: usize,
    /// Heartbeat ping interval in ms (0 disables)
    pub heartbeat_interval_ms: u64,
    /// Read deadline in ms, reset by any inbound frame or heartbeat ack
    pub read_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            hostname: "127.0.0.1".into(),
            auth: AuthConfig::default(),
            max_connections: Some(256),
            outbound_queue_size: 256,
            heartbeat_interval_ms: 30_000,
            read_timeout_ms: 60_000,
        }
    }
}

impl TransportConfig {
    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            auth: self.auth.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

/// Shared state for the transport server.
struct AppState<H: MessageHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    hub: HubHandle,
    /// Live sockets (for the connection limit and health check)
    client_count: AtomicUsize,
}

/// The transport server: accepts sockets and routes them into the hub.
pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start the transport server. The hub must already be running; the
    /// handler is shared so other subsystems can hold it too.
    pub async fn start<H: MessageHandler>(
        config: TransportConfig,
        handler: Arc<H>,
        hub: HubHandle,
    ) -> Result<Self, TransportError> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        let state = Arc::new(AppState {
            handler,
            config: config.clone(),
            hub,
            client_count: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/ws", get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .route("/api/tool-response", post(tool_response_handler::<H>))
            .with_state(state);

        info!("gridlink transport listening on ws://{}:{}/ws", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                warn!("transport server exited with error: {e}");
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("gridlink transport server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: MessageHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_connections {
        let current = state.client_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn health_handler<H: MessageHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
        "connections": state.hub.connection_count(),
    }))
}

/// Tool responses from clients that are reachable only through the relay.
/// Unknown request ids are the handler's concern; the caller always gets 202.
async fn tool_response_handler<H: MessageHandler>(
    State(state): State<Arc<AppState<H>>>,
    Json(response): Json<ToolResponsePayload>,
) -> impl IntoResponse {
    debug!(request_id = %response.request_id, "tool response via http");
    state.handler.handle_tool_response(response).await;
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection<H: MessageHandler>(socket: WebSocket, state: Arc<AppState<H>>) {
    state.client_count.fetch_add(1, Ordering::Relaxed);

    let connection_id = uuid::Uuid::new_v4().to_string();
    let (conn, outbound_rx) = Connection::new(connection_id.clone(), state.config.outbound_queue_size);
    let conn = Arc::new(conn);
    info!("Client connected: {connection_id}");

    state.hub.register(conn.clone()).await;

    connection::run(
        socket,
        conn.clone(),
        outbound_rx,
        state.handler.clone(),
        state.config.connection_settings(),
    )
    .await;

    state.hub.unregister(&connection_id).await;
    if let Some(ctx) = conn.context() {
        state.handler.connection_closed(&ctx).await;
    }

    state.client_count.fetch_sub(1, Ordering::Relaxed);
    info!(
        "Client disconnected: {connection_id} (total: {})",
        state.client_count.load(Ordering::Relaxed)
    );
}

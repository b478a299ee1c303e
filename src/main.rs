//! Gridlink: real-time command/response bridge for spreadsheet clients.
//!
//! Accepts WebSocket connections from spreadsheet editors, routes their
//! traffic, and lets a backend drive tool invocations inside each client
//! session, either over the live socket or through an HTTP relay.
//!
//! Usage:
//!   gridlink                                  # Default port 8080
//!   gridlink --port 9000 --token secret       # Custom port, shared token
//!   gridlink --relay-url https://relay.local  # Keep closed sessions on the relay
//!   GRIDLINK_VERBOSE=true gridlink --log-json # Debug logs as JSON

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gridlink_bridge::{BridgeConfig, RequestCorrelator, SessionDirectory, ToolDispatcher};
use gridlink_protocol::AuthConfig;
use gridlink_server::{GridServer, InMemoryProcessor, OperationRegistry};
use gridlink_transport::{Hub, TransportConfig, TransportServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gridlink", version, about = "Gridlink: spreadsheet client command bridge")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, env = "GRIDLINK_PORT", default_value = "8080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, env = "GRIDLINK_HOSTNAME", default_value = "127.0.0.1")]
    hostname: String,

    /// Shared authentication token (any token is accepted when unset)
    #[arg(long, env = "GRIDLINK_TOKEN")]
    token: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, env = "GRIDLINK_MAX_CONNECTIONS", default_value = "256")]
    max_connections: usize,

    /// Per-connection outbound queue capacity
    #[arg(long, env = "GRIDLINK_OUTBOUND_QUEUE", default_value = "256")]
    outbound_queue: usize,

    /// Heartbeat ping interval in ms (read deadline is twice this)
    #[arg(long, env = "GRIDLINK_HEARTBEAT_MS", default_value = "30000")]
    heartbeat_ms: u64,

    /// Age in seconds after which an unanswered tool request is swept
    #[arg(long, env = "GRIDLINK_CORRELATION_TTL_SECS", default_value = "300")]
    correlation_ttl_secs: u64,

    /// Interval in seconds between correlation sweeps
    #[arg(long, env = "GRIDLINK_SWEEP_INTERVAL_SECS", default_value = "60")]
    sweep_interval_secs: u64,

    /// Age in seconds after which finished operations are cleaned up
    #[arg(long, env = "GRIDLINK_OPERATION_MAX_AGE_SECS", default_value = "3600")]
    operation_max_age_secs: u64,

    /// Timeout in ms for relay HTTP requests
    #[arg(long, env = "GRIDLINK_RELAY_TIMEOUT_MS", default_value = "10000")]
    relay_timeout_ms: u64,

    /// Relay base URL for sessions whose connection has closed
    #[arg(long, env = "GRIDLINK_RELAY_URL")]
    relay_url: Option<String>,

    /// Enable verbose logging
    #[arg(long, env = "GRIDLINK_VERBOSE")]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "GRIDLINK_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "GRIDLINK_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn transport_config(&self) -> TransportConfig {
        let auth = match &self.token {
            Some(token) => AuthConfig::with_token(token.clone()),
            None => AuthConfig::default(),
        };
        TransportConfig {
            port: self.port,
            hostname: self.hostname.clone(),
            auth,
            max_connections: Some(self.max_connections),
            outbound_queue_size: self.outbound_queue,
            heartbeat_interval_ms: self.heartbeat_ms,
            read_timeout_ms: self.heartbeat_ms.saturating_mul(2),
        }
    }

    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            relay_timeout: Duration::from_millis(self.relay_timeout_ms),
            correlation_ttl: Duration::from_secs(self.correlation_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ..BridgeConfig::default()
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &cli.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log directory {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false);
            if cli.log_json {
                builder.json().init();
            } else {
                builder.init();
            }
            eprintln!("Logging to {}", path.display());
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if cli.log_json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    if cli.token.is_none() {
        warn!("no --token configured; any auth token will be accepted");
    }

    let shutdown = CancellationToken::new();
    let (hub, hub_task) = Hub::spawn(shutdown.child_token());

    let directory = Arc::new(SessionDirectory::new());
    let correlator = Arc::new(RequestCorrelator::new());
    let dispatcher = Arc::new(
        ToolDispatcher::new(cli.bridge_config(), directory, correlator, hub.clone())
            .context("failed to build relay client")?,
    );
    let sweeper = dispatcher.spawn_sweeper(shutdown.child_token());

    let operations = Arc::new(OperationRegistry::new());
    let cleanup = operations.spawn_cleanup(
        Duration::from_secs(cli.sweep_interval_secs),
        Duration::from_secs(cli.operation_max_age_secs),
        shutdown.child_token(),
    );

    let mut server = GridServer::new(InMemoryProcessor::new(), dispatcher, operations);
    if let Some(url) = &cli.relay_url {
        server = server.with_relay_fallback(url.clone());
    }

    let mut transport = match TransportServer::start(cli.transport_config(), Arc::new(server), hub).await {
        Ok(t) => t,
        Err(e) => {
            error!("failed to start transport: {e}");
            shutdown.cancel();
            return Err(e.into());
        }
    };
    info!(port = transport.port(), "gridlink ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    // Cancelling the hub closes every live socket, so the server drains.
    shutdown.cancel();
    transport.stop().await;
    for task in [hub_task, sweeper, cleanup] {
        if let Err(e) = task.await {
            warn!("background task ended abnormally: {e}");
        }
    }
    info!("gridlink stopped");
    Ok(())
}

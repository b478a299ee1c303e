//! ToolDispatcher: session-addressed delivery and tool invocation.
//!
//! Callers name a session, never a connection. The directory decides whether
//! that session is pushed through the hub or forwarded through the relay, and
//! every `tool_request` is paired with its response by the correlator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gridlink_protocol::{Envelope, MessageKind, ServerMessageKind, ToolRequestPayload, ToolResponsePayload};
use gridlink_transport::HubHandle;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlator::{Correlation, PendingResponse, RequestCorrelator};
use crate::directory::{Recipient, SessionDirectory};
use crate::error::BridgeError;
use crate::relay::RelayClient;

/// Timing knobs for delivery and correlation.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Per-request timeout for relay POSTs
    pub relay_timeout: Duration,
    /// Age after which an unanswered correlation is swept
    pub correlation_ttl: Duration,
    /// How often the sweeper runs
    pub sweep_interval: Duration,
    /// Default wait for a tool response when the caller gives none
    pub tool_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay_timeout: Duration::from_secs(10),
            correlation_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
        }
    }
}

/// How a message for a session left this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued on the hub for this connection id.
    Direct(String),
    /// Accepted by the relay at this base URL.
    Relayed(String),
    /// The relay refused or could not be reached.
    Failed,
    /// The session is not bound anywhere.
    NoRecipient,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Direct(_) | Self::Relayed(_))
    }
}

pub struct ToolDispatcher {
    config: BridgeConfig,
    directory: Arc<SessionDirectory>,
    correlator: Arc<RequestCorrelator>,
    hub: HubHandle,
    relay: RelayClient,
}

impl ToolDispatcher {
    pub fn new(
        config: BridgeConfig,
        directory: Arc<SessionDirectory>,
        correlator: Arc<RequestCorrelator>,
        hub: HubHandle,
    ) -> Result<Self, BridgeError> {
        let relay = RelayClient::new(config.relay_timeout)?;
        Ok(Self {
            config,
            directory,
            correlator,
            hub,
            relay,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Start the periodic correlation sweep.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.correlator
            .spawn_sweeper(self.config.sweep_interval, self.config.correlation_ttl, shutdown)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────

    /// Best-effort delivery of one envelope to whatever serves `session_id`.
    pub async fn send_to_session(&self, session_id: &str, envelope: &Envelope) -> DeliveryOutcome {
        match self.directory.resolve(session_id) {
            Some(Recipient::Direct(connection_id)) => {
                self.directory.touch(session_id);
                self.hub.send_to(&connection_id, envelope).await;
                DeliveryOutcome::Direct(connection_id)
            }
            Some(Recipient::Relay(base_url)) => {
                match self
                    .relay
                    .forward(&base_url, session_id, &envelope.kind, &envelope.data)
                    .await
                {
                    Ok(()) => {
                        self.directory.touch(session_id);
                        DeliveryOutcome::Relayed(base_url)
                    }
                    Err(e) => {
                        warn!(session_id, kind = %envelope.kind, error = %e, "relay delivery failed");
                        DeliveryOutcome::Failed
                    }
                }
            }
            None => {
                warn!(session_id, kind = %envelope.kind, "no recipient for session");
                DeliveryOutcome::NoRecipient
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tool invocation
    // ─────────────────────────────────────────────────────────────────────

    /// Ask the session's client to run `tool` and wait for its answer.
    /// `timeout` falls back to [`BridgeConfig::tool_timeout`].
    pub async fn invoke_tool(
        &self,
        session_id: &str,
        tool: &str,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolResponsePayload, BridgeError> {
        if self.directory.resolve(session_id).is_none() {
            return Err(BridgeError::NoRecipient(session_id.to_string()));
        }
        let pending = self.correlator.register(session_id, tool);
        let request_id = pending.request_id().to_string();
        self.emit_request(&request_id, session_id, tool, input).await?;

        let result = pending.wait(timeout.unwrap_or(self.config.tool_timeout)).await;
        if let Err(BridgeError::Timeout(_)) = &result {
            self.correlator.cancel(&request_id);
            warn!(%request_id, session_id, tool, "tool request timed out");
        }
        result
    }

    /// Send a `tool_request` under a caller-chosen id (a queued operation id,
    /// typically) and hand back the pending half without waiting on it.
    pub async fn request_tool(
        &self,
        request_id: &str,
        session_id: &str,
        tool: &str,
        input: Value,
    ) -> Result<PendingResponse, BridgeError> {
        let pending = self.correlator.register_with_id(request_id, session_id, tool)?;
        self.emit_request(request_id, session_id, tool, input).await?;
        Ok(pending)
    }

    async fn emit_request(
        &self,
        request_id: &str,
        session_id: &str,
        tool: &str,
        input: Value,
    ) -> Result<(), BridgeError> {
        let payload = ToolRequestPayload {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            input,
            issued_at: Utc::now(),
        };
        let envelope = match Envelope::from_payload(ServerMessageKind::ToolRequest, &payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.correlator.cancel(request_id);
                return Err(e.into());
            }
        };

        let outcome = self.send_to_session(session_id, &envelope).await;
        if !outcome.is_delivered() {
            self.correlator.cancel(request_id);
            return Err(match outcome {
                DeliveryOutcome::NoRecipient => BridgeError::NoRecipient(session_id.to_string()),
                _ => BridgeError::Undeliverable(session_id.to_string()),
            });
        }
        info!(
            request_id,
            session_id,
            tool,
            kind = ServerMessageKind::ToolRequest.as_str(),
            ?outcome,
            "tool request sent"
        );
        Ok(())
    }

    /// Route a client's answer to whoever is waiting on it. Unknown ids
    /// (late, duplicated, or never issued) are logged and dropped.
    pub fn handle_tool_response(&self, response: ToolResponsePayload) -> Option<Correlation> {
        let request_id = response.request_id.clone();
        let failed = response.is_error();
        match self.correlator.resolve(response) {
            Some(correlation) => {
                debug!(%request_id, tool = %correlation.tool, failed, "tool response correlated");
                Some(correlation)
            }
            None => {
                warn!(%request_id, "tool response for unknown request discarded");
                None
            }
        }
    }
}

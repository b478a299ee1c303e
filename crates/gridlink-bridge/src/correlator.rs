//! RequestCorrelator: pairs outbound tool requests with their responses.
//!
//! Every `tool_request` gets a fresh id and a oneshot channel. The response
//! (over a live connection or the HTTP ingress) removes the entry and wakes
//! the waiter exactly once. Entries nobody claims are purged by a periodic
//! sweep. The sweep only reclaims memory: a waiter whose entry was swept
//! keeps waiting until its own deadline and then times out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gridlink_protocol::ToolResponsePayload;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::BridgeError;

struct PendingEntry {
    session_id: String,
    tool: String,
    issued_at: Instant,
    tx: oneshot::Sender<ToolResponsePayload>,
}

/// What a resolved correlation was waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub request_id: String,
    pub session_id: String,
    pub tool: String,
}

/// The caller's half of a correlation.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<ToolResponsePayload>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response, giving up after `timeout`.
    ///
    /// A correlation dropped from the correlator (swept or cancelled) can no
    /// longer be answered, but the caller still only hears about it at its
    /// own deadline.
    pub async fn wait(self, timeout: Duration) -> Result<ToolResponsePayload, BridgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                tokio::time::sleep_until(deadline).await;
                Err(BridgeError::Timeout(self.request_id))
            }
            Err(_) => Err(BridgeError::Timeout(self.request_id)),
        }
    }
}

#[derive(Default)]
pub struct RequestCorrelator {
    pending: RwLock<HashMap<String, PendingEntry>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new correlation under a freshly issued id.
    pub fn register(&self, session_id: &str, tool: &str) -> PendingResponse {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if let Ok(pending) = self.register_with_id(&id, session_id, tool) {
                return pending;
            }
        }
    }

    /// Register under a caller-chosen id (e.g. a queued operation id).
    /// Fails if that id is still outstanding.
    pub fn register_with_id(
        &self,
        request_id: &str,
        session_id: &str,
        tool: &str,
    ) -> Result<PendingResponse, BridgeError> {
        let mut pending = self.pending.write();
        if pending.contains_key(request_id) {
            return Err(BridgeError::DuplicateRequest(request_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            request_id.to_string(),
            PendingEntry {
                session_id: session_id.to_string(),
                tool: tool.to_string(),
                issued_at: Instant::now(),
                tx,
            },
        );
        debug!(request_id, session_id, tool, "correlation registered");
        Ok(PendingResponse {
            request_id: request_id.to_string(),
            rx,
        })
    }

    /// Deliver a response. Returns what the request was, or `None` when the
    /// id is unknown (already resolved, swept, or never issued).
    pub fn resolve(&self, response: ToolResponsePayload) -> Option<Correlation> {
        let entry = self.pending.write().remove(&response.request_id)?;
        let correlation = Correlation {
            request_id: response.request_id.clone(),
            session_id: entry.session_id,
            tool: entry.tool,
        };
        if entry.tx.send(response).is_err() {
            debug!(request_id = %correlation.request_id, "waiter already gone");
        }
        Some(correlation)
    }

    /// Drop a correlation without delivering anything.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.pending.write().remove(request_id).is_some()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.read().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }

    /// Purge entries older than `ttl`. Returns how many were removed.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut pending = self.pending.write();
        let before = pending.len();
        pending.retain(|_, entry| entry.issued_at.elapsed() < ttl);
        let purged = before - pending.len();
        if purged > 0 {
            info!(purged, remaining = pending.len(), "swept stale correlations");
        }
        purged
    }

    /// Run [`RequestCorrelator::sweep`] every `interval` until `shutdown`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        correlator.sweep(ttl);
                    }
                }
            }
            debug!("correlation sweeper stopped");
        })
    }
}

//! Outbound HTTP relay for sessions without a live connection on this server.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::BridgeError;

const FORWARD_PATH: &str = "/api/forward-to-client";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ForwardRequest<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a Value,
}

/// Posts messages to a relay endpoint, which pushes them to the client.
/// Failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct RelayClient {
    client: Client,
}

impl RelayClient {
    /// Build a client whose every request is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Relay` if the HTTP client cannot be created.
    pub fn new(timeout: Duration) -> Result<Self, BridgeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// `POST {base_url}/api/forward-to-client` with `{sessionId, type, data}`.
    ///
    /// # Errors
    ///
    /// `BridgeError::RelayStatus` on a non-2xx reply, `BridgeError::Relay`
    /// when the request itself fails.
    pub async fn forward(
        &self,
        base_url: &str,
        session_id: &str,
        kind: &str,
        data: &Value,
    ) -> Result<(), BridgeError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), FORWARD_PATH);
        let response = self
            .client
            .post(&url)
            .json(&ForwardRequest {
                session_id,
                kind,
                data,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::RelayStatus {
                status,
                session_id: session_id.to_string(),
            });
        }
        debug!(session_id, kind, %status, "relayed to client");
        Ok(())
    }
}

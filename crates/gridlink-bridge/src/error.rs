use thiserror::Error;

/// Failures delivering to, or waiting on, a remote client.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no recipient bound for session {0}")]
    NoRecipient(String),

    #[error("delivery to session {0} failed")]
    Undeliverable(String),

    #[error("request id {0} already has an outstanding correlation")]
    DuplicateRequest(String),

    #[error("tool request {0} timed out")]
    Timeout(String),

    #[error("relay returned {status} for session {session_id}")]
    RelayStatus {
        status: reqwest::StatusCode,
        session_id: String,
    },

    #[error("relay request failed: {0}")]
    Relay(#[from] reqwest::Error),

    #[error("failed to encode message: {0}")]
    Protocol(#[from] gridlink_protocol::ProtocolError),
}

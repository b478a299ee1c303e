//! Client-visible error codes and protocol-level error types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error codes carried in the `code` field of an `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthRequired,
    InvalidToken,
    MessageProcessingError,
    UnknownMessageType,
    InvalidMessage,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::InvalidToken => "invalid_token",
            Self::MessageProcessingError => "message_processing_error",
            Self::UnknownMessageType => "unknown_message_type",
            Self::InvalidMessage => "invalid_message",
            Self::InternalError => "internal_error",
        }
    }
}

/// Body of an `error` (or `auth_error`) envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn auth_required() -> Self {
        Self::new(
            ErrorCode::AuthRequired,
            "Not authenticated. Send an auth message first.",
        )
    }

    pub fn invalid_token() -> Self {
        Self::new(ErrorCode::InvalidToken, "Invalid authentication token")
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MessageProcessingError, message)
    }

    pub fn unknown_type(kind: &str) -> Self {
        Self::new(
            ErrorCode::UnknownMessageType,
            format!("Unknown message type: {kind}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ErrorPayload {}

/// Failures while decoding or encoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProtocolError {
    /// The error envelope body a client should see for this failure.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Malformed(_) => ErrorPayload::new(ErrorCode::InvalidMessage, self.to_string()),
            Self::UnknownMessageType(kind) => ErrorPayload::unknown_type(kind),
            Self::InvalidPayload { .. } => ErrorPayload::processing(self.to_string()),
            Self::Encode(_) => ErrorPayload::internal(self.to_string()),
        }
    }
}

impl From<ProtocolError> for ErrorPayload {
    fn from(err: ProtocolError) -> Self {
        err.to_payload()
    }
}

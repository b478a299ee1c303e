//! The wire envelope: `{ id, type, timestamp, data }`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorPayload, ProtocolError};
use crate::kinds::{ClientMessageKind, MessageKind, ServerMessageKind};

/// A single protocol message in either direction.
///
/// `data` stays opaque until the receiver dispatches on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

/// Result of dispatching one inbound envelope: an optional direct reply,
/// or an error the transport turns into an `error` envelope.
pub type HandlerResult = Result<Option<Envelope>, ErrorPayload>;

impl Envelope {
    pub fn new(kind: impl MessageKind, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.as_str().to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Build an envelope from a typed payload.
    pub fn from_payload<T: Serialize>(kind: impl MessageKind, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    /// Build an `error` envelope.
    pub fn error(error: ErrorPayload) -> Self {
        Self::new(ServerMessageKind::Error, error_value(&error))
    }

    /// Build an `auth_error` envelope.
    pub fn auth_error(error: ErrorPayload) -> Self {
        Self::new(ServerMessageKind::AuthError, error_value(&error))
    }

    /// Parse a text frame. Only the envelope shape is validated here; the
    /// `type` is checked separately so unknown kinds can be answered.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Resolve `type` against the client→server catalog.
    pub fn client_kind(&self) -> Result<ClientMessageKind, ProtocolError> {
        ClientMessageKind::parse(&self.kind)
            .ok_or_else(|| ProtocolError::UnknownMessageType(self.kind.clone()))
    }

    /// Resolve `type` against the server→client catalog.
    pub fn server_kind(&self) -> Result<ServerMessageKind, ProtocolError> {
        ServerMessageKind::parse(&self.kind)
            .ok_or_else(|| ProtocolError::UnknownMessageType(self.kind.clone()))
    }

    pub fn is(&self, kind: impl MessageKind) -> bool {
        self.kind == kind.as_str()
    }

    /// Decode `data` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })
    }
}

fn error_value(error: &ErrorPayload) -> Value {
    serde_json::to_value(error).unwrap_or_else(|_| {
        serde_json::json!({ "code": error.code.as_str(), "message": error.message })
    })
}

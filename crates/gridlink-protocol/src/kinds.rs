//! Message-kind catalogs, one per direction.
//!
//! Each variant serializes to the exact string carried in the envelope's
//! `type` field.

use serde::{Deserialize, Serialize};

/// Anything that can be written into an envelope's `type` field.
pub trait MessageKind: Copy {
    fn as_str(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

/// Kinds a spreadsheet client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessageKind {
    Auth,
    ChatMessage,
    CellUpdate,
    RangeData,
    SelectionChanged,
    Subscribe,
    Unsubscribe,
    ToolResponse,
    ApproveChanges,
    RejectChanges,
}

impl ClientMessageKind {
    pub const ALL: [ClientMessageKind; 10] = [
        Self::Auth,
        Self::ChatMessage,
        Self::CellUpdate,
        Self::RangeData,
        Self::SelectionChanged,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::ToolResponse,
        Self::ApproveChanges,
        Self::RejectChanges,
    ];

    /// Look up a kind by its wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl MessageKind for ClientMessageKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::ChatMessage => "chat_message",
            Self::CellUpdate => "cell_update",
            Self::RangeData => "range_data",
            Self::SelectionChanged => "selection_changed",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::ToolResponse => "tool_response",
            Self::ApproveChanges => "approve_changes",
            Self::RejectChanges => "reject_changes",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

/// Kinds the server pushes to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageKind {
    AuthSuccess,
    AuthError,
    ChatResponse,
    CellValueUpdate,
    RangeDataUpdate,
    Error,
    Notification,
    ChangePreview,
    ApplyChanges,
    ToolRequest,
}

impl ServerMessageKind {
    pub const ALL: [ServerMessageKind; 10] = [
        Self::AuthSuccess,
        Self::AuthError,
        Self::ChatResponse,
        Self::CellValueUpdate,
        Self::RangeDataUpdate,
        Self::Error,
        Self::Notification,
        Self::ChangePreview,
        Self::ApplyChanges,
        Self::ToolRequest,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl MessageKind for ServerMessageKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::AuthSuccess => "auth_success",
            Self::AuthError => "auth_error",
            Self::ChatResponse => "chat_response",
            Self::CellValueUpdate => "cell_value_update",
            Self::RangeDataUpdate => "range_data_update",
            Self::Error => "error",
            Self::Notification => "notification",
            Self::ChangePreview => "change_preview",
            Self::ApplyChanges => "apply_changes",
            Self::ToolRequest => "tool_request",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription keys
// ─────────────────────────────────────────────────────────────────────────────

/// Subscription key for a whole sheet.
pub fn sheet_key(sheet: &str) -> String {
    format!("sheet:{sheet}")
}

/// Subscription key for a single cell.
pub fn cell_key(sheet: &str, cell: &str) -> String {
    format!("cell:{sheet}!{cell}")
}

/// Subscription key for a range.
pub fn range_key(sheet: &str, range: &str) -> String {
    format!("range:{sheet}!{range}")
}

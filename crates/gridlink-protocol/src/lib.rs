//! Gridlink - Protocol Types
//!
//! Wire types shared by every layer of the coordination service: the JSON
//! envelope, the client/server message-kind catalogs, typed payloads, and
//! client-visible error codes. This crate is the single source of truth for
//! what travels over a connection or a relay call.

pub mod auth;
pub mod envelope;
pub mod error;
pub mod kinds;
pub mod payloads;

pub use auth::{AuthConfig, AuthState};
pub use envelope::{Envelope, HandlerResult};
pub use error::{ErrorCode, ErrorPayload, ProtocolError};
pub use kinds::{
    ClientMessageKind, MessageKind, ServerMessageKind, cell_key, range_key, sheet_key,
};
pub use payloads::{
    ApplyChangesPayload, AuthPayload, AuthSuccessPayload, CellUpdatePayload,
    ChangeDecisionPayload, ChangePreviewPayload, ChatMessagePayload, ChatResponsePayload,
    NotificationPayload, RangeDataPayload, SelectionChangedPayload, SubscriptionPayload,
    ToolRequestPayload, ToolResponsePayload,
};

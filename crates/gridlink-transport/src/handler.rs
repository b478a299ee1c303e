//! The seam between the transport and whatever interprets messages.

use gridlink_protocol::{ClientMessageKind, Envelope, HandlerResult, ToolResponsePayload};

/// Identity of the connection a message arrived on.
///
/// Built per message from the connection's state after authentication.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub connection_id: String,
    pub user_id: String,
    pub session_id: String,
}

/// Trait implemented by the server to handle authenticated traffic.
/// The transport calls this for every message it does not handle itself
/// (`auth`, `subscribe` and `unsubscribe` stay inside the connection).
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one inbound message and optionally return a direct reply.
    fn handle_message(
        &self,
        ctx: &MessageContext,
        kind: ClientMessageKind,
        envelope: Envelope,
    ) -> impl std::future::Future<Output = HandlerResult> + Send;

    /// A tool response that arrived over HTTP instead of a live connection.
    fn handle_tool_response(
        &self,
        response: ToolResponsePayload,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// Called once the connection passed the auth gate.
    fn connection_authenticated(
        &self,
        _ctx: &MessageContext,
    ) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    /// Called after an authenticated connection has been torn down.
    fn connection_closed(
        &self,
        _ctx: &MessageContext,
    ) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }
}

//! One live WebSocket connection and its two worker loops.
//!
//! The inbound loop reads frames, enforces the auth gate, and dispatches to
//! the [`MessageHandler`]. The outbound loop drains the bounded per-connection
//! queue to the socket and owns the heartbeat. Both observe the connection's
//! cancellation token; whichever loop fails first cancels the other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gridlink_protocol::{
    AuthConfig, AuthPayload, AuthState, AuthSuccessPayload, ClientMessageKind, Envelope,
    ErrorCode, ErrorPayload, HandlerResult, MessageKind, NotificationPayload, ServerMessageKind,
    SubscriptionPayload,
};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{MessageContext, MessageHandler};

/// A serialized envelope, shared between every queue it is fanned out to.
pub type Frame = Arc<str>;

#[derive(Debug, Clone)]
struct Identity {
    user_id: String,
    session_id: String,
}

/// Represents a connected client. Owned by the hub from registration to
/// unregistration; the worker loops hold additional references.
#[derive(Debug)]
pub struct Connection {
    /// Unique connection ID
    pub id: String,
    /// When the client connected
    pub connected_at: Instant,
    /// Set once the auth gate is passed
    identity: RwLock<Option<Identity>>,
    /// Keys prefixed `sheet:`, `cell:` or `range:`
    subscriptions: RwLock<HashSet<String>>,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    /// Last time anything (message or heartbeat ack) arrived
    last_activity: Mutex<Instant>,
}

impl Connection {
    /// Create a connection with an outbound queue of `queue_capacity` frames.
    pub fn new(id: impl Into<String>, queue_capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let now = Instant::now();
        let conn = Self {
            id: id.into(),
            connected_at: now,
            identity: RwLock::new(None),
            subscriptions: RwLock::new(HashSet::new()),
            outbound: tx,
            cancel: CancellationToken::new(),
            last_activity: Mutex::new(now),
        };
        (conn, rx)
    }

    pub fn auth_state(&self) -> AuthState {
        if self.identity.read().is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Pending
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    pub fn user_id(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.user_id.clone())
    }

    pub fn session_id(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.session_id.clone())
    }

    /// Record a successful handshake. A repeated auth replaces the identity.
    pub fn mark_authenticated(&self, user_id: String, session_id: String) -> MessageContext {
        *self.identity.write() = Some(Identity {
            user_id: user_id.clone(),
            session_id: session_id.clone(),
        });
        MessageContext {
            connection_id: self.id.clone(),
            user_id,
            session_id,
        }
    }

    /// Context for handler calls; `None` before authentication.
    pub fn context(&self) -> Option<MessageContext> {
        self.identity.read().as_ref().map(|i| MessageContext {
            connection_id: self.id.clone(),
            user_id: i.user_id.clone(),
            session_id: i.session_id.clone(),
        })
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    pub fn subscribe<I: IntoIterator<Item = String>>(&self, keys: I) -> usize {
        let mut subs = self.subscriptions.write();
        subs.extend(keys);
        subs.len()
    }

    pub fn unsubscribe<I: IntoIterator<Item = String>>(&self, keys: I) -> usize {
        let mut subs = self.subscriptions.write();
        for key in keys {
            subs.remove(&key);
        }
        subs.len()
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.subscriptions.read().contains(key)
    }

    /// True if any of `keys` is subscribed.
    pub fn is_subscribed_any(&self, keys: &[String]) -> bool {
        let subs = self.subscriptions.read();
        keys.iter().any(|k| subs.contains(k))
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        keys.sort();
        keys
    }

    // ── Outbound queue ──────────────────────────────────────────────────

    /// Queue an envelope without blocking. Returns `false` if the consumer
    /// is gone or too slow, in which case the connection is cancelled.
    pub fn enqueue(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(json) => self.enqueue_frame(Arc::from(json)),
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "failed to serialize outbound envelope");
                true
            }
        }
    }

    /// Queue an already-serialized frame. See [`Connection::enqueue`].
    pub fn enqueue_frame(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "outbound queue full, closing connection");
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.cancel.cancel();
                false
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker loops
// ─────────────────────────────────────────────────────────────────────────────

/// Per-connection settings taken from the transport config.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub auth: AuthConfig,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Maximum silence before the connection is considered dead.
    pub read_timeout: Duration,
}

/// Drive a connection until either loop exits. Returns once both have stopped.
pub async fn run<H: MessageHandler>(
    socket: WebSocket,
    conn: Arc<Connection>,
    outbound_rx: mpsc::Receiver<Frame>,
    handler: Arc<H>,
    settings: ConnectionSettings,
) {
    let (ws_tx, ws_rx) = socket.split();

    let outbound = tokio::spawn(outbound_loop(
        ws_tx,
        outbound_rx,
        conn.clone(),
        settings.heartbeat_interval,
        settings.read_timeout,
    ));
    let inbound = tokio::spawn(inbound_loop(ws_rx, conn.clone(), handler, settings.auth));

    let _ = tokio::join!(inbound, outbound);
    debug!(conn_id = %conn.id, "connection loops stopped");
}

async fn inbound_loop<H: MessageHandler>(
    mut ws_rx: SplitStream<WebSocket>,
    conn: Arc<Connection>,
    handler: Arc<H>,
    auth: AuthConfig,
) {
    let cancel = conn.cancellation();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        conn.touch();
                        process_frame(text.as_str(), &conn, handler.as_ref(), &auth).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => conn.touch(),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(conn_id = %conn.id, "client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn_id = %conn.id, error = %e, "websocket read error");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        conn.enqueue(&Envelope::error(ErrorPayload::new(
                            ErrorCode::InvalidMessage,
                            "Binary frames are not supported",
                        )));
                    }
                }
            }
        }
    }
    conn.cancel();
}

async fn outbound_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    conn: Arc<Connection>,
    heartbeat_interval: Duration,
    read_timeout: Duration,
) {
    let cancel = conn.cancellation();
    let heartbeat_enabled = !heartbeat_interval.is_zero();
    let mut ticker = tokio::time::interval(if heartbeat_enabled {
        heartbeat_interval
    } else {
        Duration::from_secs(3600)
    });
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = ws_tx.send(Message::Text(frame.to_string().into())).await {
                    warn!(conn_id = %conn.id, error = %e, "websocket write error");
                    break;
                }
            }
            _ = ticker.tick(), if heartbeat_enabled => {
                if conn.idle_for() > read_timeout {
                    info!(conn_id = %conn.id, "heartbeat deadline missed, closing connection");
                    break;
                }
                if let Err(e) = ws_tx.send(Message::Ping(Bytes::new())).await {
                    warn!(conn_id = %conn.id, error = %e, "heartbeat ping failed");
                    break;
                }
            }
        }
    }
    conn.cancel();
    let _ = ws_tx.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound processing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse, gate, and dispatch one text frame. Protocol errors are answered
/// with an error envelope; the connection stays open.
pub async fn process_frame<H: MessageHandler>(
    text: &str,
    conn: &Connection,
    handler: &H,
    auth: &AuthConfig,
) {
    let envelope = match Envelope::parse(text) {
        Ok(env) => env,
        Err(e) => {
            debug!(conn_id = %conn.id, error = %e, "unparseable frame");
            conn.enqueue(&Envelope::error(e.to_payload()));
            return;
        }
    };

    let kind = match envelope.client_kind() {
        Ok(kind) => kind,
        Err(e) => {
            conn.enqueue(&Envelope::error(e.to_payload()));
            return;
        }
    };

    if kind == ClientMessageKind::Auth {
        authenticate(&envelope, conn, handler, auth).await;
        return;
    }

    let Some(ctx) = conn.context() else {
        debug!(conn_id = %conn.id, kind = kind.as_str(), "message before auth");
        conn.enqueue(&Envelope::error(ErrorPayload::auth_required()));
        return;
    };

    let result = match kind {
        ClientMessageKind::Subscribe | ClientMessageKind::Unsubscribe => {
            update_subscriptions(conn, kind, &envelope)
        }
        _ => handler.handle_message(&ctx, kind, envelope).await,
    };

    match result {
        Ok(Some(reply)) => {
            conn.enqueue(&reply);
        }
        Ok(None) => {}
        Err(err) => {
            debug!(conn_id = %conn.id, error = %err, "message handling failed");
            conn.enqueue(&Envelope::error(err));
        }
    }
}

async fn authenticate<H: MessageHandler>(
    envelope: &Envelope,
    conn: &Connection,
    handler: &H,
    auth: &AuthConfig,
) {
    let payload: AuthPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => {
            conn.enqueue(&Envelope::auth_error(e.to_payload()));
            return;
        }
    };

    if !auth.verify(&payload.token) {
        warn!(conn_id = %conn.id, "client auth failed");
        conn.enqueue(&Envelope::auth_error(ErrorPayload::invalid_token()));
        return;
    }

    let user_id = payload
        .user_id
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| auth.default_user_id.clone());
    let session_id = payload
        .session_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let ctx = conn.mark_authenticated(user_id, session_id);
    // Bind the session before the client learns it is authenticated, so an
    // immediate follow-up can already be routed back to it.
    handler.connection_authenticated(&ctx).await;

    let success = AuthSuccessPayload {
        connection_id: ctx.connection_id.clone(),
        user_id: ctx.user_id.clone(),
        session_id: ctx.session_id.clone(),
    };
    match Envelope::from_payload(ServerMessageKind::AuthSuccess, &success) {
        Ok(reply) => {
            conn.enqueue(&reply);
        }
        Err(e) => warn!(conn_id = %conn.id, error = %e, "failed to encode auth_success"),
    }
    info!(conn_id = %conn.id, user_id = %ctx.user_id, session_id = %ctx.session_id, "client authenticated");
}

fn update_subscriptions(
    conn: &Connection,
    kind: ClientMessageKind,
    envelope: &Envelope,
) -> HandlerResult {
    let payload: SubscriptionPayload = envelope.payload()?;
    let (verb, total) = if kind == ClientMessageKind::Subscribe {
        ("subscribed", conn.subscribe(payload.keys.iter().cloned()))
    } else {
        ("unsubscribed", conn.unsubscribe(payload.keys.iter().cloned()))
    };
    let notice = NotificationPayload {
        message: verb.to_string(),
        details: Some(json!({ "keys": payload.keys, "total": total })),
    };
    Ok(Some(Envelope::from_payload(
        ServerMessageKind::Notification,
        &notice,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlink_protocol::ToolResponsePayload;

    /// Records every message that reaches the handler.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        authenticated: Mutex<Vec<MessageContext>>,
    }

    impl MessageHandler for RecordingHandler {
        async fn handle_message(
            &self,
            _ctx: &MessageContext,
            kind: ClientMessageKind,
            _envelope: Envelope,
        ) -> HandlerResult {
            self.seen.lock().push(kind.as_str().to_string());
            if kind == ClientMessageKind::RejectChanges {
                return Err(ErrorPayload::processing("nothing to reject"));
            }
            Ok(None)
        }

        async fn handle_tool_response(&self, _response: ToolResponsePayload) {}

        async fn connection_authenticated(&self, ctx: &MessageContext) {
            self.authenticated.lock().push(ctx.clone());
        }
    }

    fn frame(kind: &str, data: serde_json::Value) -> String {
        json!({ "id": "m1", "type": kind, "data": data }).to_string()
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(Envelope::parse(&frame).unwrap());
        }
        out
    }

    #[test]
    fn new_connection_is_pending() {
        let (conn, _rx) = Connection::new("c1", 4);
        assert_eq!(conn.auth_state(), AuthState::Pending);
        assert!(conn.context().is_none());
        assert!(!conn.is_cancelled());
    }

    #[test]
    fn subscriptions_add_and_remove() {
        let (conn, _rx) = Connection::new("c1", 4);
        conn.subscribe(["cell:S!A1".to_string(), "sheet:S".to_string()]);
        assert!(conn.is_subscribed("cell:S!A1"));
        assert!(conn.is_subscribed_any(&["range:S!A1:B2".into(), "sheet:S".into()]));
        conn.unsubscribe(["sheet:S".to_string()]);
        assert!(!conn.is_subscribed("sheet:S"));
        assert_eq!(conn.subscriptions(), vec!["cell:S!A1".to_string()]);
    }

    #[test]
    fn full_queue_cancels_connection() {
        let (conn, _rx) = Connection::new("c1", 1);
        let env = Envelope::new(ServerMessageKind::Notification, json!({}));
        assert!(conn.enqueue(&env));
        assert!(!conn.enqueue(&env));
        assert!(conn.is_cancelled());
    }

    #[test]
    fn closed_queue_cancels_connection() {
        let (conn, rx) = Connection::new("c1", 4);
        drop(rx);
        let env = Envelope::new(ServerMessageKind::Notification, json!({}));
        assert!(!conn.enqueue(&env));
        assert!(conn.is_cancelled());
    }

    #[tokio::test]
    async fn message_before_auth_is_rejected_and_not_forwarded() {
        let (conn, mut rx) = Connection::new("c1", 8);
        let handler = RecordingHandler::default();
        let auth = AuthConfig::with_token("secret");

        process_frame(
            &frame("chat_message", json!({"message": "hi"})),
            &conn,
            &handler,
            &auth,
        )
        .await;

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is(ServerMessageKind::Error));
        let err: ErrorPayload = replies[0].payload().unwrap();
        assert_eq!(err.code, ErrorCode::AuthRequired);
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn subscribe_before_auth_is_rejected() {
        let (conn, mut rx) = Connection::new("c1", 8);
        let handler = RecordingHandler::default();
        process_frame(
            &frame("subscribe", json!({"keys": ["sheet:S"]})),
            &conn,
            &handler,
            &AuthConfig::default(),
        )
        .await;
        let err: ErrorPayload = drain(&mut rx)[0].payload().unwrap();
        assert_eq!(err.code, ErrorCode::AuthRequired);
        assert!(conn.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn wrong_token_yields_auth_error_and_stays_pending() {
        let (conn, mut rx) = Connection::new("c1", 8);
        let handler = RecordingHandler::default();
        let auth = AuthConfig::with_token("secret");

        process_frame(&frame("auth", json!({"token": "nope"})), &conn, &handler, &auth).await;

        let replies = drain(&mut rx);
        assert!(replies[0].is(ServerMessageKind::AuthError));
        let err: ErrorPayload = replies[0].payload().unwrap();
        assert_eq!(err.code, ErrorCode::InvalidToken);
        assert!(!conn.is_authenticated());
        assert!(handler.authenticated.lock().is_empty());
    }

    #[tokio::test]
    async fn auth_then_messages_are_forwarded() {
        let (conn, mut rx) = Connection::new("c1", 8);
        let handler = RecordingHandler::default();
        let auth = AuthConfig::with_token("secret");

        process_frame(
            &frame("auth", json!({"token": "secret", "userId": "u1", "sessionId": "s1"})),
            &conn,
            &handler,
            &auth,
        )
        .await;
        let replies = drain(&mut rx);
        assert!(replies[0].is(ServerMessageKind::AuthSuccess));
        let ok: AuthSuccessPayload = replies[0].payload().unwrap();
        assert_eq!(ok.connection_id, "c1");
        assert_eq!(ok.user_id, "u1");
        assert_eq!(ok.session_id, "s1");
        assert_eq!(handler.authenticated.lock()[0].session_id, "s1");

        process_frame(
            &frame("chat_message", json!({"message": "hi"})),
            &conn,
            &handler,
            &auth,
        )
        .await;
        assert_eq!(*handler.seen.lock(), vec!["chat_message".to_string()]);
    }

    #[tokio::test]
    async fn auth_without_ids_assigns_defaults() {
        let (conn, mut rx) = Connection::new("c1", 8);
        let handler = RecordingHandler::default();
        process_frame(
            &frame("auth", json!({"token": "anything"})),
            &conn,
            &handler,
            &AuthConfig::default(),
        )
        .await;
        let ok: AuthSuccessPayload = drain(&mut rx)[0].payload().unwrap();
        assert_eq!(ok.user_id, "anonymous");
        assert!(!ok.session_id.is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_get_error_replies() {
        let (conn, mut rx) = Connection::new("c1", 8);
        let handler = RecordingHandler::default();
        let auth = AuthConfig::default();
        conn.mark_authenticated("u1".into(), "s1".into());

        process_frame("{not json", &conn, &handler, &auth).await;
        process_frame(&frame("teleport", json!({})), &conn, &handler, &auth).await;

        let replies = drain(&mut rx);
        let first: ErrorPayload = replies[0].payload().unwrap();
        let second: ErrorPayload = replies[1].payload().unwrap();
        assert_eq!(first.code, ErrorCode::InvalidMessage);
        assert_eq!(second.code, ErrorCode::UnknownMessageType);
        assert!(!conn.is_cancelled());
    }

    #[tokio::test]
    async fn handler_errors_become_error_envelopes() {
        let (conn, mut rx) = Connection::new("c1", 8);
        let handler = RecordingHandler::default();
        conn.mark_authenticated("u1".into(), "s1".into());

        process_frame(
            &frame("reject_changes", json!({"previewId": "p1"})),
            &conn,
            &handler,
            &AuthConfig::default(),
        )
        .await;

        let err: ErrorPayload = drain(&mut rx)[0].payload().unwrap();
        assert_eq!(err.code, ErrorCode::MessageProcessingError);
    }

    #[tokio::test]
    async fn subscribe_is_handled_locally() {
        let (conn, mut rx) = Connection::new("c1", 8);
        let handler = RecordingHandler::default();
        conn.mark_authenticated("u1".into(), "s1".into());

        process_frame(
            &frame("subscribe", json!({"keys": ["cell:S!A1", "sheet:S"]})),
            &conn,
            &handler,
            &AuthConfig::default(),
        )
        .await;
        process_frame(
            &frame("unsubscribe", json!({"keys": ["sheet:S"]})),
            &conn,
            &handler,
            &AuthConfig::default(),
        )
        .await;

        assert_eq!(conn.subscriptions(), vec!["cell:S!A1".to_string()]);
        assert!(handler.seen.lock().is_empty());
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 2);
        let notice: NotificationPayload = replies[1].payload().unwrap();
        assert_eq!(notice.message, "unsubscribed");
    }
}

//! GridServer: routes authenticated client traffic to the processor,
//! the hub, the session directory and the operation registry.

use std::collections::HashMap;
use std::sync::Arc;

use gridlink_bridge::{BridgeError, PendingResponse, Recipient, ToolDispatcher};
use gridlink_protocol::{
    ApplyChangesPayload, CellUpdatePayload, ChangeDecisionPayload, ChangePreviewPayload,
    ChatMessagePayload, ChatResponsePayload, ClientMessageKind, Envelope, ErrorPayload,
    HandlerResult, MessageKind, NotificationPayload, RangeDataPayload, SelectionChangedPayload,
    ServerMessageKind, ToolResponsePayload, cell_key, range_key, sheet_key,
};
use gridlink_transport::{Connection, ConnectionFilter, MessageContext, MessageHandler};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::operations::{OperationRegistry, OperationStatus};
use crate::processor::SpreadsheetProcessor;

/// Changes offered to a session, awaiting approve/reject.
#[derive(Debug)]
struct Preview {
    session_id: String,
    changes: Vec<Value>,
}

pub struct GridServer<P: SpreadsheetProcessor> {
    processor: P,
    dispatcher: Arc<ToolDispatcher>,
    operations: Arc<OperationRegistry>,
    previews: Mutex<HashMap<String, Preview>>,
    /// Relay base URL sessions fall back to when their connection closes
    relay_fallback: Option<String>,
}

impl<P: SpreadsheetProcessor> GridServer<P> {
    pub fn new(processor: P, dispatcher: Arc<ToolDispatcher>, operations: Arc<OperationRegistry>) -> Self {
        Self {
            processor,
            dispatcher,
            operations,
            previews: Mutex::new(HashMap::new()),
            relay_fallback: None,
        }
    }

    /// Keep sessions addressable through the relay at `base_url` after
    /// their connection closes, instead of dropping them.
    pub fn with_relay_fallback(mut self, base_url: impl Into<String>) -> Self {
        self.relay_fallback = Some(base_url.into());
        self
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    /// Offer `changes` to a session as a `change_preview`. Returns the
    /// preview id the client approves or rejects.
    pub async fn propose_changes(&self, session_id: &str, changes: Vec<Value>) -> Result<String, BridgeError> {
        let preview_id = uuid::Uuid::new_v4().to_string();
        let envelope = Envelope::from_payload(
            ServerMessageKind::ChangePreview,
            &ChangePreviewPayload {
                preview_id: preview_id.clone(),
                changes: changes.clone(),
            },
        )?;
        self.previews.lock().insert(
            preview_id.clone(),
            Preview {
                session_id: session_id.to_string(),
                changes,
            },
        );

        let outcome = self.dispatcher.send_to_session(session_id, &envelope).await;
        if !outcome.is_delivered() {
            self.previews.lock().remove(&preview_id);
            return Err(BridgeError::Undeliverable(session_id.to_string()));
        }
        debug!(%preview_id, session_id, "change preview sent");
        Ok(preview_id)
    }

    /// Send every ready operation of a session to its client as a
    /// `tool_request` keyed by the operation id. Returns how many went out.
    ///
    /// Each request is watched for the dispatcher's `tool_timeout`; an
    /// operation still in progress when it lapses is failed, which cancels
    /// its dependents.
    pub async fn dispatch_pending(&self, session_id: &str) -> usize {
        let mut sent = 0;
        for op in self.operations.get_pending_operations(session_id) {
            if self.operations.mark_operation_in_progress(&op.id).is_err() {
                continue;
            }
            match self
                .dispatcher
                .request_tool(&op.id, &op.session_id, &op.kind, op.input.clone())
                .await
            {
                Ok(pending) => {
                    self.watch_deadline(pending);
                    sent += 1;
                }
                Err(e) => {
                    warn!(op_id = %op.id, session_id, error = %e, "operation dispatch failed");
                    let _ = self.operations.mark_operation_failed(&op.id, &e.to_string());
                }
            }
        }
        sent
    }

    fn watch_deadline(&self, pending: PendingResponse) {
        let timeout = self.dispatcher.config().tool_timeout;
        let dispatcher = Arc::clone(&self.dispatcher);
        let operations = Arc::clone(&self.operations);
        tokio::spawn(async move {
            let op_id = pending.request_id().to_string();
            // A response is settled by `accept_tool_response`; only the
            // deadline is handled here.
            if pending.wait(timeout).await.is_ok() {
                return;
            }
            dispatcher.correlator().cancel(&op_id);
            let still_running = operations
                .get_operation(&op_id)
                .is_some_and(|op| op.status == OperationStatus::InProgress);
            if still_running {
                warn!(%op_id, ?timeout, "operation timed out");
                let _ = operations.mark_operation_failed(&op_id, "timed out");
            }
        });
    }

    /// A tool response from either ingress. Wakes any waiter and, when the
    /// response answers an operation this server dispatched, settles it and
    /// pushes the session's next ready work. Anything else is discarded.
    pub async fn accept_tool_response(&self, response: ToolResponsePayload) {
        let error = response
            .is_error()
            .then(|| response.error.clone().unwrap_or_else(|| "tool failed".into()));
        let result = response.result.clone();

        let Some(correlation) = self.dispatcher.handle_tool_response(response) else {
            return;
        };
        let Some(op) = self.operations.get_operation(&correlation.request_id) else {
            return;
        };
        if op.status != OperationStatus::InProgress || op.session_id != correlation.session_id {
            debug!(op_id = %op.id, status = %op.status, "response does not match a running operation");
            return;
        }
        let settled = match error {
            Some(err) => self.operations.mark_operation_failed(&op.id, &err).map(|_| ()),
            None => self.operations.mark_operation_complete(&op.id, result),
        };
        if let Err(e) = settled {
            warn!(op_id = %op.id, error = %e, "could not settle operation");
            return;
        }
        self.dispatch_pending(&op.session_id).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Per-kind handlers
    // ─────────────────────────────────────────────────────────────────────

    async fn on_chat_message(&self, ctx: &MessageContext, envelope: Envelope) -> HandlerResult {
        let payload: ChatMessagePayload = envelope.payload()?;
        let context = payload
            .context
            .or_else(|| self.dispatcher.directory().context(&ctx.session_id));
        let reply = self
            .processor
            .process_chat_message(&ctx.session_id, &payload.message, context)
            .await
            .map_err(|e| ErrorPayload::processing(e.to_string()))?;

        if !reply.proposed_changes.is_empty() {
            if let Err(e) = self.propose_changes(&ctx.session_id, reply.proposed_changes).await {
                warn!(session_id = %ctx.session_id, error = %e, "could not preview proposed changes");
            }
        }

        let response = Envelope::from_payload(
            ServerMessageKind::ChatResponse,
            &ChatResponsePayload {
                message: reply.message,
                data: reply.data,
            },
        )?;
        Ok(Some(response))
    }

    async fn on_cell_update(&self, ctx: &MessageContext, envelope: Envelope) -> HandlerResult {
        let payload: CellUpdatePayload = envelope.payload()?;
        let stored = self
            .processor
            .update_cell(&payload.sheet, &payload.cell, payload.value, payload.formula.clone())
            .await
            .map_err(|e| ErrorPayload::processing(e.to_string()))?;

        let update = Envelope::new(
            ServerMessageKind::CellValueUpdate,
            json!({
                "sheet": payload.sheet,
                "cell": payload.cell,
                "value": stored,
                "formula": payload.formula,
                "updatedBy": ctx.user_id,
            }),
        );
        let keys = vec![cell_key(&payload.sheet, &payload.cell), sheet_key(&payload.sheet)];
        self.broadcast_to_subscribers(ctx, &update, keys).await;
        Ok(None)
    }

    async fn on_range_data(&self, ctx: &MessageContext, envelope: Envelope) -> HandlerResult {
        let payload: RangeDataPayload = envelope.payload()?;
        let processing = |e: crate::processor::ProcessorError| ErrorPayload::processing(e.to_string());

        match payload.values {
            Some(values) => {
                self.processor
                    .update_range(&payload.sheet, &payload.range, values.clone())
                    .await
                    .map_err(processing)?;
                let update = Envelope::new(
                    ServerMessageKind::RangeDataUpdate,
                    json!({
                        "sheet": payload.sheet,
                        "range": payload.range,
                        "values": values,
                        "updatedBy": ctx.user_id,
                    }),
                );
                let keys = vec![range_key(&payload.sheet, &payload.range), sheet_key(&payload.sheet)];
                self.broadcast_to_subscribers(ctx, &update, keys).await;
                Ok(None)
            }
            None => {
                let values = self
                    .processor
                    .get_range_values(&payload.sheet, &payload.range)
                    .await
                    .map_err(processing)?;
                Ok(Some(Envelope::new(
                    ServerMessageKind::RangeDataUpdate,
                    json!({
                        "sheet": payload.sheet,
                        "range": payload.range,
                        "values": values,
                    }),
                )))
            }
        }
    }

    fn on_selection_changed(&self, ctx: &MessageContext, envelope: Envelope) -> HandlerResult {
        let payload: SelectionChangedPayload = envelope.payload()?;
        let selection = json!({ "sheet": payload.sheet, "range": payload.range });
        if !self
            .dispatcher
            .directory()
            .set_context(&ctx.session_id, "selection", selection)
        {
            debug!(session_id = %ctx.session_id, "selection for unbound session ignored");
        }
        Ok(None)
    }

    async fn on_tool_response(&self, ctx: &MessageContext, envelope: Envelope) -> HandlerResult {
        let mut payload: ToolResponsePayload = envelope.payload()?;
        if payload.session_id.is_empty() {
            payload.session_id = ctx.session_id.clone();
        }
        self.accept_tool_response(payload).await;
        Ok(None)
    }

    fn take_preview(&self, ctx: &MessageContext, preview_id: &str) -> Result<Preview, ErrorPayload> {
        let unknown = || ErrorPayload::processing(format!("unknown preview: {preview_id}"));
        let mut previews = self.previews.lock();
        let owned = previews
            .get(preview_id)
            .is_some_and(|p| p.session_id == ctx.session_id);
        if !owned {
            return Err(unknown());
        }
        previews.remove(preview_id).ok_or_else(unknown)
    }

    fn on_approve_changes(&self, ctx: &MessageContext, envelope: Envelope) -> HandlerResult {
        let payload: ChangeDecisionPayload = envelope.payload()?;
        let preview = self.take_preview(ctx, &payload.preview_id)?;
        info!(preview_id = %payload.preview_id, session_id = %ctx.session_id, changes = preview.changes.len(), "changes approved");
        let apply = Envelope::from_payload(
            ServerMessageKind::ApplyChanges,
            &ApplyChangesPayload {
                preview_id: payload.preview_id,
                changes: preview.changes,
            },
        )?;
        Ok(Some(apply))
    }

    fn on_reject_changes(&self, ctx: &MessageContext, envelope: Envelope) -> HandlerResult {
        let payload: ChangeDecisionPayload = envelope.payload()?;
        self.take_preview(ctx, &payload.preview_id)?;
        info!(preview_id = %payload.preview_id, session_id = %ctx.session_id, "changes rejected");
        let mut note = NotificationPayload::new("changes rejected");
        note.details = Some(json!({
            "previewId": payload.preview_id,
            "reason": payload.reason,
        }));
        Ok(Some(Envelope::from_payload(ServerMessageKind::Notification, &note)?))
    }

    async fn broadcast_to_subscribers(&self, ctx: &MessageContext, envelope: &Envelope, keys: Vec<String>) {
        let filter: ConnectionFilter = Box::new(move |conn: &Connection| conn.is_subscribed_any(&keys));
        self.dispatcher
            .hub()
            .broadcast(envelope, Some(&ctx.connection_id), Some(filter))
            .await;
    }
}

impl<P: SpreadsheetProcessor> MessageHandler for GridServer<P> {
    async fn handle_message(
        &self,
        ctx: &MessageContext,
        kind: ClientMessageKind,
        envelope: Envelope,
    ) -> HandlerResult {
        self.dispatcher.directory().touch(&ctx.session_id);
        debug!(conn_id = %ctx.connection_id, kind = kind.as_str(), "routing message");

        match kind {
            ClientMessageKind::ChatMessage => self.on_chat_message(ctx, envelope).await,
            ClientMessageKind::CellUpdate => self.on_cell_update(ctx, envelope).await,
            ClientMessageKind::RangeData => self.on_range_data(ctx, envelope).await,
            ClientMessageKind::SelectionChanged => self.on_selection_changed(ctx, envelope),
            ClientMessageKind::ToolResponse => self.on_tool_response(ctx, envelope).await,
            ClientMessageKind::ApproveChanges => self.on_approve_changes(ctx, envelope),
            ClientMessageKind::RejectChanges => self.on_reject_changes(ctx, envelope),
            ClientMessageKind::Auth | ClientMessageKind::Subscribe | ClientMessageKind::Unsubscribe => {
                Err(ErrorPayload::internal(format!("{} is handled by the transport", kind.as_str())))
            }
        }
    }

    async fn handle_tool_response(&self, response: ToolResponsePayload) {
        self.accept_tool_response(response).await;
    }

    async fn connection_authenticated(&self, ctx: &MessageContext) {
        self.dispatcher.directory().bind(
            &ctx.session_id,
            &ctx.user_id,
            Recipient::Direct(ctx.connection_id.clone()),
        );
    }

    async fn connection_closed(&self, ctx: &MessageContext) {
        let directory = self.dispatcher.directory();
        if let Some(base_url) = &self.relay_fallback {
            let direct = Recipient::Direct(ctx.connection_id.clone());
            if directory.resolve(&ctx.session_id) == Some(direct) {
                directory.bind(&ctx.session_id, &ctx.user_id, Recipient::Relay(base_url.clone()));
                info!(session_id = %ctx.session_id, relay = %base_url, "session moved to relay");
            }
        }
        let dropped = directory.unbind_connection(&ctx.connection_id);
        debug!(conn_id = %ctx.connection_id, sessions = dropped.len(), "connection closed");
    }
}

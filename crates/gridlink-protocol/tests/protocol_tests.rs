//! Protocol layer tests: envelope wire format, kind catalogs, errors, payloads.

#[cfg(test)]
mod tests {
    use gridlink_protocol::*;
    use serde_json::json;

    // ─────────────────────────────────────────────────────────────────────
    // Envelope
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(ServerMessageKind::Notification, json!({"message": "hi"}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["data"]["message"], "hi");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_string());
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn envelope_parsed_from_client_frame() {
        let wire = r#"{"id":"m1","type":"cell_update","timestamp":"2026-01-01T00:00:00Z","data":{"sheet":"S1","cell":"A1","value":3}}"#;
        let env = Envelope::parse(wire).unwrap();
        assert_eq!(env.id, "m1");
        assert_eq!(env.client_kind().unwrap(), ClientMessageKind::CellUpdate);
        let cell: CellUpdatePayload = env.payload().unwrap();
        assert_eq!(cell.sheet, "S1");
        assert_eq!(cell.cell, "A1");
        assert_eq!(cell.value, json!(3));
        assert!(cell.formula.is_none());
    }

    #[test]
    fn envelope_missing_optional_fields_defaults() {
        let env = Envelope::parse(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(env.id, "");
        assert!(env.data.is_null());
    }

    #[test]
    fn envelope_without_type_is_malformed() {
        let err = Envelope::parse(r#"{"id":"x","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(err.to_payload().code, ErrorCode::InvalidMessage);
    }

    #[test]
    fn envelope_not_json_is_malformed() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_type_maps_to_unknown_message_type() {
        let env = Envelope::parse(r#"{"type":"launch_rockets"}"#).unwrap();
        let err = env.client_kind().unwrap_err();
        let payload = err.to_payload();
        assert_eq!(payload.code, ErrorCode::UnknownMessageType);
        assert!(payload.message.contains("launch_rockets"));
    }

    #[test]
    fn invalid_payload_maps_to_processing_error() {
        let env = Envelope::new(ClientMessageKind::CellUpdate, json!({"sheet": 1}));
        let err = env.payload::<CellUpdatePayload>().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
        assert_eq!(err.to_payload().code, ErrorCode::MessageProcessingError);
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let env = Envelope::error(ErrorPayload::auth_required());
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "auth_required");
        assert!(value["data"].get("details").is_none());
    }

    #[test]
    fn auth_error_envelope() {
        let env = Envelope::auth_error(ErrorPayload::invalid_token());
        assert!(env.is(ServerMessageKind::AuthError));
        let payload: ErrorPayload = env.payload().unwrap();
        assert_eq!(payload.code, ErrorCode::InvalidToken);
    }

    #[test]
    fn error_details_serialized_when_present() {
        let err = ErrorPayload::processing("boom").with_details(json!({"cell": "B2"}));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "message_processing_error");
        assert_eq!(value["details"]["cell"], "B2");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Kind catalogs
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn client_kinds_match_wire_names() {
        let names: Vec<&str> = ClientMessageKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "auth",
                "chat_message",
                "cell_update",
                "range_data",
                "selection_changed",
                "subscribe",
                "unsubscribe",
                "tool_response",
                "approve_changes",
                "reject_changes",
            ]
        );
    }

    #[test]
    fn server_kinds_parse_back() {
        for kind in ServerMessageKind::ALL {
            assert_eq!(ServerMessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ServerMessageKind::parse("auth"), None);
    }

    #[test]
    fn kind_serde_matches_as_str() {
        let value = serde_json::to_value(ClientMessageKind::SelectionChanged).unwrap();
        assert_eq!(value, json!("selection_changed"));
    }

    #[test]
    fn subscription_keys_are_prefixed() {
        assert_eq!(sheet_key("Budget"), "sheet:Budget");
        assert_eq!(cell_key("Budget", "C3"), "cell:Budget!C3");
        assert_eq!(range_key("Budget", "A1:B2"), "range:Budget!A1:B2");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Payloads
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn auth_payload_camel_case() {
        let p: AuthPayload = serde_json::from_value(json!({
            "token": "t",
            "userId": "u1",
            "sessionId": "s1"
        }))
        .unwrap();
        assert_eq!(p.user_id.as_deref(), Some("u1"));
        assert_eq!(p.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn tool_response_payload_from_ingress_body() {
        let p: ToolResponsePayload = serde_json::from_value(json!({
            "sessionId": "s1",
            "requestId": "r1",
            "result": {"ok": true},
            "error": null
        }))
        .unwrap();
        assert_eq!(p.request_id, "r1");
        assert!(!p.is_error());
        assert_eq!(p.result["ok"], true);
    }

    #[test]
    fn tool_response_error_flag() {
        let p: ToolResponsePayload = serde_json::from_value(json!({
            "requestId": "r2",
            "error": "sheet locked"
        }))
        .unwrap();
        assert!(p.is_error());
        assert!(p.result.is_null());
        assert_eq!(p.session_id, "");
    }

    #[test]
    fn empty_tool_error_is_success() {
        let p: ToolResponsePayload = serde_json::from_value(json!({
            "requestId": "r3",
            "result": 7,
            "error": ""
        }))
        .unwrap();
        assert!(!p.is_error());
    }

    #[test]
    fn tool_request_payload_field_names() {
        let env = Envelope::from_payload(
            ServerMessageKind::ToolRequest,
            &ToolRequestPayload {
                request_id: "r1".into(),
                session_id: "s1".into(),
                tool: "write_range".into(),
                input: json!({"range": "A1:A3"}),
                issued_at: chrono::Utc::now(),
            },
        )
        .unwrap();
        assert_eq!(env.data["requestId"], "r1");
        assert_eq!(env.data["sessionId"], "s1");
        assert_eq!(env.data["tool"], "write_range");
        assert!(env.data["issuedAt"].is_string());
    }

    #[test]
    fn range_read_request_has_no_values() {
        let p: RangeDataPayload =
            serde_json::from_value(json!({"sheet": "S", "range": "A1:C3"})).unwrap();
        assert!(p.values.is_none());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Auth config
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn auth_config_verifies_token() {
        let cfg = AuthConfig::with_token("secret");
        assert!(cfg.verify("secret"));
        assert!(!cfg.verify("nope"));
    }

    #[test]
    fn auth_config_without_token_accepts_any() {
        let cfg = AuthConfig::default();
        assert!(cfg.verify(""));
        assert_eq!(cfg.default_user_id, "anonymous");
    }
}

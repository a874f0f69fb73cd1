use serde_json::json;

use crate::*;

// ============================================================================
//  PACKETS
// ============================================================================

#[test]
fn test_decode_request_packet() {
    let body = br#"{"commands":[
        {"comp":"Counter","cmd":"increment","args":[2]},
        {"comp":"Counter","cmd":"read","args":[],"replyId":7}
    ]}"#;

    let packet = decode_packet(body).expect("decode failed");
    assert_eq!(packet.commands.len(), 2);
    assert_eq!(packet.commands[0], Command::new("Counter", "increment", vec![json!(2)]));
    assert_eq!(packet.commands[1].reply_id, Some(7));
    assert!(packet.command_execution_results.is_none());
}

#[test]
fn test_missing_args_default_to_empty() {
    let packet = decode_packet(br#"{"commands":[{"comp":"A","cmd":"b"}]}"#).unwrap();
    assert!(packet.commands[0].args.is_empty());
}

#[test]
fn test_reply_id_omitted_when_absent() {
    let bytes = encode_packet(&Packet::new(vec![Command::new("A", "b", vec![])], None)).unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert!(!text.contains("replyId"));
    assert!(text.contains(r#""commandExecutionResults":null"#));
}

#[test]
fn test_results_serialize_value_and_err_side_by_side() {
    let packet = Packet::new(Vec::new(), Some(vec![
        Some(ExecResult::ok(json!(1))),
        Some(ExecResult::err(markers::INTERNAL)),
        None,
    ]));

    let value: serde_json::Value = serde_json::from_slice(&encode_packet(&packet).unwrap()).unwrap();
    assert_eq!(value["commandExecutionResults"], json!([
        {"value": 1, "err": null},
        {"value": null, "err": "error.internal"},
        null,
    ]));
}

#[test]
fn test_result_with_value_and_error_is_rejected() {
    let body = br#"{"commands":[],"commandExecutionResults":[{"value":1,"err":"boom"}]}"#;
    assert!(matches!(decode_packet(body), Err(RpcError::Malformed(_))));
}

#[test]
fn test_malformed_bodies() {
    assert!(matches!(decode_packet(b"not json"), Err(RpcError::Malformed(_))));
    assert!(matches!(decode_packet(br#"{"commands":{}}"#), Err(RpcError::Malformed(_))));
    assert!(matches!(decode_packet(br#"{"commands":[{"cmd":"x"}]}"#), Err(RpcError::Malformed(_))));
}

#[test]
fn test_packet_round_trip_preserves_order() {
    let commands: Vec<Command> = (0..5)
        .map(|i| Command::new("Log", "append", vec![json!(i)]))
        .collect();
    let packet = Packet::new(commands.clone(), None);

    let decoded = decode_packet(&encode_packet(&packet).unwrap()).unwrap();
    assert_eq!(decoded.commands, commands);
}

#[test]
fn test_refresh_and_failure_shapes() {
    let refresh = Packet::refresh();
    assert!(refresh.is_refresh());
    assert_eq!(refresh.commands[0].comp, COMMUNICATIONS);
    assert_eq!(refresh.commands[0].cmd, REQUEST_REFRESH);
    assert!(refresh.command_execution_results.is_none());

    let failure = Packet::failure(markers::PROTOCOL);
    assert!(failure.commands.is_empty());
    assert_eq!(failure.results(), &[Some(ExecResult::err(markers::PROTOCOL))]);
}

// ============================================================================
//  REPLIES
// ============================================================================

#[test]
fn test_reply_command_parses_back() {
    let cmd = Command::reply(42, ExecResult::ok(json!({"x": 1})));
    assert!(cmd.is_reply());

    let (id, result) = cmd.parse_reply().unwrap();
    assert_eq!(id, 42);
    assert_eq!(result.into_result(), Ok(json!({"x": 1})));

    let (id, result) = Command::reply(3, ExecResult::err("nope")).parse_reply().unwrap();
    assert_eq!(id, 3);
    assert_eq!(result.error(), Some("nope"));
}

#[test]
fn test_reply_without_id_is_rejected() {
    let cmd = Command::new(COMMUNICATIONS, REPLY, vec![json!("seven")]);
    assert!(matches!(cmd.parse_reply(), Err(RpcError::BadReply(_))));

    let not_reply = Command::new("Counter", "read", vec![]);
    assert!(matches!(not_reply.parse_reply(), Err(RpcError::BadReply(_))));
}

// ============================================================================
//  HEADERS & INSTALL PAYLOADS
// ============================================================================

#[test]
fn test_headers_from_pairs_is_case_insensitive() {
    let headers = Headers::from_pairs([
        ("X-Duo-Identity", "tok"),
        ("x-duo-version", "v2"),
        ("X-DUO-INSTALLED", "Layout, Chart,,"),
        ("content-type", "application/json"),
    ]);

    assert_eq!(headers.identity.as_deref(), Some("tok"));
    assert_eq!(headers.version.as_deref(), Some("v2"));
    assert_eq!(headers.installed, Some(vec!["Layout".to_string(), "Chart".to_string()]));

    let pairs = headers.to_pairs();
    let back = Headers::from_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())));
    assert_eq!(back, headers);
}

#[test]
fn test_install_payload_wire_shape() {
    let payload = InstallPayload {
        defs: vec![WireDefinition {
            name: "Chart".into(),
            kind: ComponentKind::Feature,
            includes: vec!["Layout".into()],
            shared_methods: vec![],
            host_methods: vec!["load".into()],
            client_methods: vec!["render".into()],
            resources: vec!["chart.css".into()],
        }],
        ctor_arguments: vec![json!({"sessionId": "s1"})],
    };

    let value: serde_json::Value = serde_json::from_slice(&encode_install(&payload).unwrap()).unwrap();
    assert_eq!(value["defs"][0]["kind"], json!("feature"));
    assert_eq!(value["defs"][0]["hostMethods"], json!(["load"]));
    assert_eq!(value["ctorArguments"][0]["sessionId"], json!("s1"));

    let back = decode_install(&encode_install(&payload).unwrap()).unwrap();
    assert_eq!(back.names().collect::<Vec<_>>(), vec!["Chart"]);
}

#[test]
fn test_empty_bootstrap_body() {
    assert_eq!(decode_bootstrap(b"").unwrap(), BootstrapRequest::default());
    assert_eq!(decode_bootstrap(b"  \n").unwrap(), BootstrapRequest::default());

    let request = decode_bootstrap(br#"{"features":["Chart"]}"#).unwrap();
    assert_eq!(request.features, vec!["Chart".to_string()]);
}

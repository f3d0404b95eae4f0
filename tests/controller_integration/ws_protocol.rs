use std::time::Duration;

use fleetd::{
    domain::models::{CommandPriority, CommandTarget},
    protocol::CommandPayload,
};
use serde_json::json;

use super::support::{
    TestStore, connect_node, expect_close, heartbeat_frame, hello_frame, perform_handshake,
    recv_json, result_frame, send_json, spawn_server, spawn_server_with,
};

fn queued_command(command_id: &str, node_id: &str) -> CommandPayload {
    CommandPayload {
        command_id: command_id.to_owned(),
        command_type: "start_activity".to_owned(),
        priority: CommandPriority::Normal,
        target: CommandTarget::Node(node_id.to_owned()),
        params: json!({ "activity": "watch" }),
        timeout_seconds: 30,
        retry_count: 0,
    }
}

#[tokio::test]
async fn signed_hello_establishes_a_session() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store.clone())).await;

    let mut ws = connect_node(server.addr).await;
    send_json(
        &mut ws,
        &hello_frame(Some("node-1"), Some("rack-secret"), 5),
    )
    .await;

    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "HELLO_ACK");
    assert_eq!(ack["version"], "1.0");
    assert!(
        ack["payload"]["session_id"]
            .as_str()
            .unwrap()
            .starts_with("sess-")
    );
    assert_eq!(ack["payload"]["heartbeat_interval"], 1);
    assert_eq!(ack["payload"]["max_tasks"], 3);

    assert_eq!(store.registrations(), vec!["node-1".to_owned()]);

    let nodes: serde_json::Value = reqwest::get(format!("http://{}/nodes", server.addr))
        .await
        .expect("nodes endpoint should respond")
        .json()
        .await
        .expect("nodes endpoint should return json");
    assert_eq!(nodes["count"], 1);
    assert_eq!(nodes["nodes"][0]["node_id"], "node-1");
    assert_eq!(nodes["nodes"][0]["status"], "READY");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn handshake_times_out_when_no_hello_arrives() {
    let server = spawn_server_with(None, |config| {
        config.hello_timeout = Duration::from_millis(150);
    })
    .await;

    let mut ws = connect_node(server.addr).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 4401);
    assert!(reason.contains("timeout"));

    server.stop().await;
}

#[tokio::test]
async fn malformed_handshake_is_rejected() {
    let server = spawn_server(None).await;

    let mut ws = connect_node(server.addr).await;
    send_json(&mut ws, &json!({ "type": "HEARTBEAT", "payload": {} })).await;
    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, 4402);

    server.stop().await;
}

#[tokio::test]
async fn hello_without_node_id_is_rejected() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    send_json(&mut ws, &hello_frame(None, Some("rack-secret"), 5)).await;
    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, 4403);

    server.stop().await;
}

#[tokio::test]
async fn wrong_signature_is_rejected() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    send_json(
        &mut ws,
        &hello_frame(Some("node-1"), Some("other-secret"), 5),
    )
    .await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 4404);
    assert!(reason.contains("signature"));

    server.stop().await;
}

#[tokio::test]
async fn unsigned_hello_is_rejected_when_verification_is_on() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    send_json(&mut ws, &hello_frame(Some("node-1"), None, 5)).await;
    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, 4404);

    server.stop().await;
}

#[tokio::test]
async fn unknown_node_is_admitted_as_new() {
    let store = TestStore::new();
    let server = spawn_server(Some(store.clone())).await;

    let mut ws = connect_node(server.addr).await;
    send_json(&mut ws, &hello_frame(Some("node-fresh"), None, 5)).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "HELLO_ACK");
    assert_eq!(store.registrations(), vec!["node-fresh".to_owned()]);

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn fallback_secret_admits_nodes_without_a_store() {
    let server = spawn_server_with(None, |config| {
        config.fallback_secret = Some("shared-bootstrap".to_owned());
    })
    .await;

    let mut ws = connect_node(server.addr).await;
    let session_id = perform_handshake(&mut ws, "node-1", "shared-bootstrap", 5).await;
    assert!(session_id.starts_with("sess-"));

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn reconnect_supersedes_the_previous_session() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut first = connect_node(server.addr).await;
    let first_session = perform_handshake(&mut first, "node-1", "rack-secret", 5).await;

    let mut second = connect_node(server.addr).await;
    let second_session = perform_handshake(&mut second, "node-1", "rack-secret", 5).await;
    assert_ne!(first_session, second_session);

    let (code, _) = expect_close(&mut first).await;
    assert_eq!(code, 4409);

    drop(second);
    server.stop().await;
}

#[tokio::test]
async fn heartbeat_delivers_queued_commands_and_results_are_acked() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    store.queue_command(queued_command("cmd-42", "node-1"));
    let server = spawn_server(Some(store.clone())).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 2).await;

    send_json(
        &mut ws,
        &heartbeat_frame("READY", &["node-1-b1-s1", "node-1-b1-s2"], 0),
    )
    .await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "HEARTBEAT_ACK");
    assert_eq!(ack["payload"]["status"], "OK");
    assert_eq!(ack["payload"]["commands"][0]["command_id"], "cmd-42");
    assert_eq!(store.started(), vec!["cmd-42".to_owned()]);

    let result = result_frame(
        "msg-result-1",
        "cmd-42",
        &[("node-1-b1-s1", "success"), ("node-1-b1-s2", "success")],
    );
    send_json(&mut ws, &result).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "ACK");
    assert_eq!(reply["payload"]["ack_message_id"], "msg-result-1");

    let completions = store.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].command_id, "cmd-42");
    assert_eq!(completions[0].status, "completed");
    assert_eq!(completions[0].device_results.len(), 2);

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn commands_stay_queued_while_the_node_is_busy() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    store.queue_command(queued_command("cmd-7", "node-1"));
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 1).await;

    send_json(&mut ws, &heartbeat_frame("BUSY", &["node-1-b1-s1"], 3)).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "HEARTBEAT_ACK");
    assert_eq!(ack["payload"]["commands"].as_array().unwrap().len(), 0);

    send_json(&mut ws, &heartbeat_frame("READY", &["node-1-b1-s1"], 0)).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["payload"]["commands"][0]["command_id"], "cmd-7");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn malformed_frames_get_error_replies_without_dropping_the_session() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 1).await;

    send_json(&mut ws, &json!({ "message_id": "msg-x", "type": "TELEPORT" })).await;
    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "ERROR");
    assert_eq!(error["payload"]["error_code"], "UNSUPPORTED_TYPE");
    assert_eq!(error["payload"]["related_message_id"], "msg-x");

    send_json(
        &mut ws,
        &json!({
            "version": "1.0",
            "timestamp": 1_u64,
            "message_id": "msg-y",
            "type": "HEARTBEAT",
            "payload": { "status": "NOT_A_STATUS" },
        }),
    )
    .await;
    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "ERROR");
    assert_eq!(error["payload"]["error_code"], "MALFORMED_FRAME");

    send_json(&mut ws, &heartbeat_frame("READY", &[], 0)).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "HEARTBEAT_ACK");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn duplicate_hello_after_handshake_is_an_unexpected_frame() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 1).await;

    send_json(
        &mut ws,
        &hello_frame(Some("node-1"), Some("rack-secret"), 1),
    )
    .await;
    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "ERROR");
    assert_eq!(error["payload"]["error_code"], "UNEXPECTED_FRAME");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn disconnect_is_reported_to_the_store() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store.clone())).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 1).await;
    drop(ws);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if store.disconnects() == vec!["node-1".to_owned()] {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "disconnect was never recorded"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.stop().await;
}

use std::time::Duration;

use fleetd::domain::models::{RecoveryEvent, RecoveryLevel};
use serde_json::{Value, json};

use super::support::{
    TestStore, connect_node, perform_handshake, recv_json, send_json, spawn_server,
    spawn_server_with,
};

fn heartbeat_with(device_ids: &[String], resources: Value) -> Value {
    let snapshot: Vec<Value> = device_ids
        .iter()
        .map(|id| json!({ "device_id": id }))
        .collect();
    json!({
        "version": "1.0",
        "timestamp": 1_u64,
        "message_id": "msg-hb-recovery",
        "type": "HEARTBEAT",
        "payload": {
            "status": "READY",
            "device_snapshot": snapshot,
            "active_tasks": 0,
            "resources": resources,
        },
    })
}

async fn wait_for_event(store: &TestStore, rule: &str) -> RecoveryEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(2_500);
    loop {
        let found = store
            .recovery_events()
            .into_iter()
            .find(|event| event.rule == rule);
        if let Some(event) = found {
            return event;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no {rule} event was recorded"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn device_drop_is_detected_across_heartbeats() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store.clone())).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 10).await;

    // let at least one recovery poll observe the full device count
    tokio::time::sleep(Duration::from_millis(400)).await;

    let remaining: Vec<String> = (1..=6).map(|n| format!("dev-{n}")).collect();
    send_json(&mut ws, &heartbeat_with(&remaining, json!({ "cpu": 0.4 }))).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "HEARTBEAT_ACK");

    let event = wait_for_event(&store, "device_drop_severe").await;
    assert_eq!(event.node_id, "node-1");
    assert_eq!(event.level, RecoveryLevel::Service);
    assert_eq!(event.condition["previous"], 10);
    assert_eq!(event.condition["current"], 6);
    assert_eq!(event.condition["drop_percent"], 40);
    assert!(!event.executed, "no executor is configured");
    assert!(
        event
            .skip_reason
            .as_deref()
            .unwrap_or_default()
            .contains("executor")
    );

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn gated_recovery_is_recorded_as_skipped() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    store.block_recovery();
    let server = spawn_server(Some(store.clone())).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 0).await;

    send_json(
        &mut ws,
        &heartbeat_with(&[], json!({ "input_driver": { "running": false } })),
    )
    .await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "HEARTBEAT_ACK");

    let event = wait_for_event(&store, "input_driver_down").await;
    assert!(!event.executed);
    assert!(
        event
            .skip_reason
            .as_deref()
            .unwrap_or_default()
            .contains("cooldown")
    );

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn disabling_recovery_stops_the_loop() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server_with(Some(store.clone()), |config| {
        config.recovery_enabled = false;
    })
    .await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 0).await;

    send_json(
        &mut ws,
        &heartbeat_with(&[], json!({ "input_driver": { "running": false } })),
    )
    .await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "HEARTBEAT_ACK");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(store.recovery_events().is_empty());

    drop(ws);
    server.stop().await;
}

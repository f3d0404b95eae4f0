use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{Value, json};

use super::support::{
    TestStore, connect_node, heartbeat_frame, perform_handshake, recv_json, result_frame,
    send_json, spawn_server, spawn_server_with,
};

async fn get_json(addr: SocketAddr, path: &str) -> Value {
    reqwest::get(format!("http://{addr}{path}"))
        .await
        .expect("request should be sent")
        .json()
        .await
        .expect("response should be json")
}

async fn post_json(addr: SocketAddr, path: &str, body: &Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .json(body)
        .send()
        .await
        .expect("request should be sent");
    let status = response.status().as_u16();
    let body = response.json().await.expect("response should be json");
    (status, body)
}

#[tokio::test]
async fn fleet_status_reports_the_partition() {
    let server = spawn_server(None).await;

    let status = get_json(server.addr, "/fleet/status").await;
    assert_eq!(status["total"], 10);
    assert_eq!(status["pools"]["active"], 8);
    assert_eq!(status["pools"]["reserve"], 1);
    assert_eq!(status["pools"]["maintenance"], 1);
    assert_eq!(status["statuses"]["idle"], 9);
    assert_eq!(status["statuses"]["maintenance"], 1);

    server.stop().await;
}

#[tokio::test]
async fn activity_allocation_lifecycle() {
    let server = spawn_server(None).await;

    let (status, allocation) = post_json(
        server.addr,
        "/fleet/allocate",
        &json!({ "activity": "watch", "count": 3 }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(allocation["requested"], 3);
    assert_eq!(allocation["granted"], 3);
    assert_eq!(allocation["shortfall"], 0);
    let device_ids = allocation["device_ids"].as_array().unwrap().clone();
    assert_eq!(device_ids.len(), 3);

    let activities = get_json(server.addr, "/fleet/activities").await;
    assert_eq!(activities["watch"], 3);

    let (status, released) = post_json(
        server.addr,
        "/fleet/release",
        &json!({ "device_ids": device_ids }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(released["ok"], true);
    assert_eq!(released["released"], 3);

    let activities = get_json(server.addr, "/fleet/activities").await;
    assert!(activities.get("watch").is_none());

    server.stop().await;
}

#[tokio::test]
async fn activity_counts_clamp_to_the_configured_range() {
    let server = spawn_server(None).await;

    // the test range for watch is 2..=4
    let (status, allocation) = post_json(
        server.addr,
        "/fleet/allocate",
        &json!({ "activity": "watch", "count": 9 }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(allocation["requested"], 4);
    assert_eq!(allocation["granted"], 4);

    server.stop().await;
}

#[tokio::test]
async fn urgent_requests_preempt_running_activities() {
    let server = spawn_server(None).await;

    let (_, bulk) = post_json(
        server.addr,
        "/fleet/allocate",
        &json!({ "activity": "bulk", "count": 9 }),
    )
    .await;
    assert_eq!(bulk["granted"], 9);

    // the urgent cap in the test config is 5
    let (status, urgent) = post_json(
        server.addr,
        "/fleet/allocate",
        &json!({ "priority": "P1", "count": 9 }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(urgent["requested"], 5);
    assert_eq!(urgent["granted"], 5);
    assert_eq!(urgent["shortfall"], 0);

    let activities = get_json(server.addr, "/fleet/activities").await;
    assert_eq!(activities["bulk"], 4);
    assert_eq!(activities["request-p1"], 5);

    server.stop().await;
}

#[tokio::test]
async fn batch_requests_never_preempt() {
    let server = spawn_server(None).await;

    let (_, bulk) = post_json(
        server.addr,
        "/fleet/allocate",
        &json!({ "activity": "bulk", "count": 9 }),
    )
    .await;
    assert_eq!(bulk["granted"], 9);

    // the batch cap in the test config is 3
    let (status, starved) = post_json(
        server.addr,
        "/fleet/allocate",
        &json!({ "priority": "P2", "count": 10 }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(starved["requested"], 3);
    assert_eq!(starved["granted"], 0);
    assert_eq!(starved["shortfall"], 3);

    let device_ids = bulk["device_ids"].as_array().unwrap().clone();
    post_json(
        server.addr,
        "/fleet/release",
        &json!({ "device_ids": device_ids }),
    )
    .await;

    let (_, batch) = post_json(
        server.addr,
        "/fleet/allocate",
        &json!({ "priority": "P2", "count": 10 }),
    )
    .await;
    assert_eq!(batch["granted"], 3);

    server.stop().await;
}

#[tokio::test]
async fn allocation_requires_an_activity_or_a_priority() {
    let server = spawn_server(None).await;

    let (status, body) = post_json(server.addr, "/fleet/allocate", &json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["ok"], false);

    let (status, body) =
        post_json(server.addr, "/fleet/allocate", &json!({ "priority": "P1" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["ok"], false);

    server.stop().await;
}

#[tokio::test]
async fn failed_devices_reach_maintenance_and_restore_to_reserve() {
    let server = spawn_server_with(None, |config| {
        config.fallback_secret = Some("rack-secret".to_owned());
    })
    .await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 5).await;

    for attempt in 1..=3 {
        let result = result_frame(
            &format!("msg-result-{attempt}"),
            &format!("cmd-{attempt}"),
            &[("node-1-b1-s1", "error"), ("node-1-b1-s2", "error")],
        );
        send_json(&mut ws, &result).await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "ACK");
    }

    let status = get_json(server.addr, "/fleet/status").await;
    assert!(
        status["pools"]["maintenance"].as_u64().unwrap() >= 2,
        "both devices should be quarantined: {status}"
    );

    for device_id in ["node-1-b1-s1", "node-1-b1-s2"] {
        let (code, body) = post_json(
            server.addr,
            "/fleet/restore",
            &json!({ "device_id": device_id }),
        )
        .await;
        assert_eq!(code, 200, "restore of {device_id} failed: {body}");
        assert_eq!(body["device_id"], device_id);
    }

    let status = get_json(server.addr, "/fleet/status").await;
    assert_eq!(status["pools"]["reserve"], 2);
    assert!(status["pools"]["maintenance"].as_u64().unwrap() <= 1);

    let (code, body) = post_json(
        server.addr,
        "/fleet/restore",
        &json!({ "device_id": "node-9-b9-s9" }),
    )
    .await;
    assert_eq!(code, 404);
    assert_eq!(body["ok"], false);

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn queued_commands_flow_to_the_node() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 1).await;

    let (status, body) = post_json(
        server.addr,
        "/commands",
        &json!({ "command_type": "screenshot", "target": "node-1" }),
    )
    .await;
    assert_eq!(status, 202);
    assert_eq!(body["status"], "queued");
    let command_id = body["command_id"].as_str().unwrap().to_owned();
    assert!(command_id.starts_with("cmd-"));

    send_json(&mut ws, &heartbeat_frame("READY", &["node-1-b1-s1"], 0)).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["payload"]["commands"][0]["command_id"], command_id);
    assert_eq!(ack["payload"]["commands"][0]["command_type"], "screenshot");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn waiting_commands_resolve_with_the_node_result() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 1).await;

    let addr = server.addr;
    let post_task = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("http://{addr}/commands"))
            .json(&json!({
                "command_type": "health_check",
                "target": "node-1",
                "wait": true,
            }))
            .send()
            .await
            .expect("command post should send")
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    send_json(&mut ws, &heartbeat_frame("READY", &["node-1-b1-s1"], 0)).await;
    let ack = recv_json(&mut ws).await;
    let command_id = ack["payload"]["commands"][0]["command_id"]
        .as_str()
        .expect("heartbeat ack should deliver the command")
        .to_owned();

    send_json(
        &mut ws,
        &result_frame("msg-result-w", &command_id, &[("node-1-b1-s1", "success")]),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "ACK");

    let response = post_task.await.expect("post task should finish");
    assert_eq!(response.status().as_u16(), 200);
    let outcome: Value = response.json().await.expect("outcome should be json");
    assert_eq!(outcome["command_id"], command_id);
    assert_eq!(outcome["status"], "success");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn command_queue_requires_the_store() {
    let server = spawn_server(None).await;

    let (status, body) = post_json(
        server.addr,
        "/commands",
        &json!({ "command_type": "screenshot", "target": "node-1" }),
    )
    .await;
    assert_eq!(status, 503);
    assert_eq!(body["ok"], false);

    server.stop().await;
}

#[tokio::test]
async fn health_info_and_readiness_endpoints() {
    let server = spawn_server(None).await;

    let health = get_json(server.addr, "/healthz").await;
    assert_eq!(health["ok"], true);
    assert_eq!(health["protocol_version"], "1.0");
    assert_eq!(health["devices_total"], 10);
    assert_eq!(health["nodes_connected"], 0);
    assert_eq!(health["store_connected"], false);

    let info = get_json(server.addr, "/info").await;
    assert_eq!(info["fleet"]["nodes"], 2);
    assert_eq!(info["fleet"]["devices"], 10);
    assert_eq!(info["heartbeat_interval_secs"], 1);
    assert_eq!(info["max_tasks_per_node"], 3);
    assert_eq!(info["recovery"]["enabled"], true);
    assert_eq!(info["recovery"]["rules"].as_array().unwrap().len(), 5);

    let ready = get_json(server.addr, "/readyz").await;
    assert_eq!(ready["ready"], true);
    assert_eq!(ready["nodes_connected"], 0);

    server.stop().await;
}

#[tokio::test]
async fn notify_pushes_event_frames_to_connected_nodes() {
    let store = TestStore::with_secret("node-1", "rack-secret");
    let server = spawn_server(Some(store)).await;

    let mut ws = connect_node(server.addr).await;
    perform_handshake(&mut ws, "node-1", "rack-secret", 1).await;

    let nodes = get_json(server.addr, "/nodes").await;
    assert_eq!(nodes["count"], 1);
    assert_eq!(nodes["eligible"], 1);
    assert_eq!(nodes["nodes"][0]["node_id"], "node-1");

    let (status, body) = post_json(
        server.addr,
        "/notify",
        &json!({
            "node_id": "node-1",
            "event": "maintenance_window",
            "detail": { "starts_in": 600 },
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], 1);

    let event = recv_json(&mut ws).await;
    assert_eq!(event["type"], "EVENT");
    assert_eq!(event["payload"]["event"], "maintenance_window");
    assert_eq!(event["payload"]["detail"]["starts_in"], 600);

    let (status, body) = post_json(
        server.addr,
        "/notify",
        &json!({ "node_id": "node-9", "event": "maintenance_window" }),
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(body["ok"], false);

    let (status, body) = post_json(server.addr, "/notify", &json!({ "event": "drain" })).await;
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], 1);
    let event = recv_json(&mut ws).await;
    assert_eq!(event["payload"]["event"], "drain");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn board_health_flags_the_maintenance_board() {
    let server = spawn_server(None).await;

    let boards = get_json(server.addr, "/fleet/boards").await;
    let boards = boards.as_array().unwrap();
    assert_eq!(boards.len(), 2);

    let total_errors: u64 = boards
        .iter()
        .map(|board| board["error_devices"].as_u64().unwrap())
        .sum();
    assert_eq!(total_errors, 1);

    let mut classifications: Vec<&str> = boards
        .iter()
        .map(|board| board["classification"].as_str().unwrap())
        .collect();
    classifications.sort_unstable();
    assert_eq!(classifications, vec!["good", "warning"]);
    for board in boards {
        assert_eq!(board["devices"], 5);
    }

    server.stop().await;
}

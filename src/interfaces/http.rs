use std::{future::Future, net::SocketAddr};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::{
    application::state::SharedState,
    domain::{
        error::ControlError,
        models::{CommandPriority, CommandTarget, RequestPriority},
    },
    interfaces::ws,
    protocol::{CommandPayload, FrameBody, PROTOCOL_VERSION, build_frame},
};

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/info", get(info_handler))
        .route("/nodes", get(nodes_handler))
        .route("/notify", post(notify_handler))
        .route("/fleet/status", get(fleet_status_handler))
        .route("/fleet/activities", get(fleet_activities_handler))
        .route("/fleet/boards", get(fleet_boards_handler))
        .route("/fleet/allocate", post(allocate_handler))
        .route("/fleet/release", post(release_handler))
        .route("/fleet/restore", post(restore_handler))
        .route("/commands", post(enqueue_command_handler))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ControlError> {
    let local_addr = listener.local_addr().map_err(|error| {
        ControlError::Unavailable(format!("failed to read listener address: {error}"))
    })?;

    info!(
        "fleetd listening on ws://{}:{}, protocol={}",
        local_addr.ip(),
        local_addr.port(),
        crate::protocol::PROTOCOL_VERSION,
    );

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|error| ControlError::Unavailable(format!("server runtime error: {error}")))
}

#[derive(Debug, Deserialize)]
struct AllocateRequest {
    #[serde(default)]
    activity: Option<String>,
    #[serde(default)]
    priority: Option<RequestPriority>,
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ReleaseRequest {
    device_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    #[serde(default)]
    node_id: Option<String>,
    event: String,
    #[serde(default)]
    detail: Value,
}

#[derive(Debug, Deserialize)]
struct EnqueueCommandRequest {
    command_type: String,
    target: CommandTarget,
    #[serde(default)]
    priority: Option<CommandPriority>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    wait: bool,
}

async fn healthz_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health_payload()))
}

async fn readyz_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let payload = json!({
        "ready": true,
        "store_connected": state.has_store(),
        "nodes_connected": state.pool().len(),
    });
    (StatusCode::OK, Json(payload))
}

async fn info_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.info_payload()))
}

async fn nodes_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let nodes = state.node_views();
    let eligible = state
        .pool()
        .eligible_for_work(state.config().max_tasks_per_node)
        .len();
    let payload = json!({ "count": nodes.len(), "eligible": eligible, "nodes": nodes });
    (StatusCode::OK, Json(payload))
}

async fn notify_handler(
    State(state): State<SharedState>,
    Json(request): Json<NotifyRequest>,
) -> impl IntoResponse {
    let frame = build_frame(
        PROTOCOL_VERSION,
        FrameBody::Event(json!({ "event": request.event, "detail": request.detail })),
    );
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(error) => {
            let error = ControlError::Protocol(format!("failed to encode event frame: {error}"));
            return error_response(&error).into_response();
        }
    };

    let delivered = match &request.node_id {
        Some(node_id) => {
            if !state.pool().send_to(node_id, text) {
                let error = ControlError::NotFound(format!("node {node_id} is not connected"));
                return error_response(&error).into_response();
            }
            1
        }
        None => state.pool().broadcast(&text),
    };
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "delivered": delivered })),
    )
        .into_response()
}

async fn fleet_status_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.scheduler().pool_status()))
}

async fn fleet_activities_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.scheduler().activity_counts()))
}

async fn fleet_boards_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.scheduler().board_health()))
}

async fn allocate_handler(
    State(state): State<SharedState>,
    Json(request): Json<AllocateRequest>,
) -> impl IntoResponse {
    let allocation = match (&request.priority, &request.activity) {
        (Some(priority), _) => {
            let Some(count) = request.count else {
                let error =
                    ControlError::InvalidRequest("priority allocation requires a count".to_owned());
                return error_response(&error).into_response();
            };
            Ok(state.scheduler().allocate_request(*priority, count))
        }
        (None, Some(activity)) => state.scheduler().allocate_activity(activity, request.count),
        (None, None) => Err(ControlError::InvalidRequest(
            "allocation needs an activity or a priority".to_owned(),
        )),
    };

    match allocation {
        Ok(allocation) => (StatusCode::OK, Json(json!(allocation))).into_response(),
        Err(error) => error_response(&error).into_response(),
    }
}

async fn release_handler(
    State(state): State<SharedState>,
    Json(request): Json<ReleaseRequest>,
) -> impl IntoResponse {
    let released = state.scheduler().release(&request.device_ids);
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "released": released })),
    )
}

async fn restore_handler(
    State(state): State<SharedState>,
    Json(request): Json<RestoreRequest>,
) -> impl IntoResponse {
    match state.scheduler().restore_device(&request.device_id) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "device_id": request.device_id })),
        )
            .into_response(),
        Err(error) => error_response(&error).into_response(),
    }
}

async fn enqueue_command_handler(
    State(state): State<SharedState>,
    Json(request): Json<EnqueueCommandRequest>,
) -> impl IntoResponse {
    let command = CommandPayload {
        command_id: format!("cmd-{}", Uuid::new_v4()),
        command_type: request.command_type,
        priority: request.priority.unwrap_or(CommandPriority::Normal),
        target: request.target,
        params: request.params,
        timeout_seconds: request
            .timeout_seconds
            .unwrap_or_else(|| state.config().command_timeout.as_secs()),
        retry_count: request.retry_count,
    };

    if !request.wait {
        return match state.enqueue_command(&command).await {
            Ok(()) => (
                StatusCode::ACCEPTED,
                Json(json!({ "command_id": command.command_id, "status": "queued" })),
            )
                .into_response(),
            Err(error) => error_response(&error).into_response(),
        };
    }

    let receiver_timeout = state.config().command_timeout;
    if let Err(error) = state.enqueue_command(&command).await {
        return error_response(&error).into_response();
    }

    match state.waiters().wait(&command.command_id, receiver_timeout).await {
        Some(outcome) => (StatusCode::OK, Json(json!(outcome))).into_response(),
        None => (
            StatusCode::ACCEPTED,
            Json(json!({ "command_id": command.command_id, "status": "pending" })),
        )
            .into_response(),
    }
}

fn error_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::Protocol(_) | ControlError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ControlError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::Capacity(_) => StatusCode::CONFLICT,
        ControlError::Store(_) => StatusCode::BAD_GATEWAY,
        ControlError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(error: &ControlError) -> (StatusCode, Json<Value>) {
    (
        error_status(error),
        Json(json!({ "ok": false, "error": error.to_string() })),
    )
}

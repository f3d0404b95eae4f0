use std::net::SocketAddr;

use axum::{
    extract::{
        ConnectInfo, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    application::state::{NodeCredential, SharedState},
    domain::{clock::now_unix_ms, models::NodeStatus},
    protocol::{
        AckPayload, CLOSE_HANDSHAKE_TIMEOUT, CLOSE_INVALID_SIGNATURE, CLOSE_MALFORMED_HANDSHAKE,
        CLOSE_MISSING_NODE_ID, CLOSE_SESSION_REPLACED, ERROR_MALFORMED_FRAME,
        ERROR_PAYLOAD_TOO_LARGE, ERROR_UNEXPECTED_FRAME, Frame, FrameBody, FrameError,
        HeartbeatAckPayload, HelloAckPayload, PROTOCOL_VERSION, build_frame, frame_from_value,
        parse_raw,
    },
    security::signature::verify_payload,
    sessions::{NodeSession, SessionHandle},
};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.max_message_size(state.config().max_payload_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(mut socket: WebSocket, state: SharedState, remote_addr: SocketAddr) {
    let remote_ip = Some(remote_addr.ip().to_string());

    let Some((session, rx, cancel)) = perform_handshake(&mut socket, &state, remote_ip).await
    else {
        debug!("handshake failed remote={remote_addr}");
        return;
    };
    let node_id = session.node_id.clone();
    let session_id = session.session_id.clone();
    let handle = session.handle.clone();

    let ack = build_frame(
        PROTOCOL_VERSION,
        FrameBody::HelloAck(HelloAckPayload {
            session_id: session_id.clone(),
            heartbeat_interval: state.config().heartbeat_interval.as_secs(),
            max_tasks: state.config().max_tasks_per_node,
        }),
    );
    state.register_session(session).await;

    let Ok(ack_text) = serde_json::to_string(&ack) else {
        error!("failed to serialize hello ack node={node_id}");
        state.session_closed(&node_id, &session_id).await;
        return;
    };
    if socket.send(Message::Text(ack_text.into())).await.is_err() {
        warn!("failed to deliver hello ack node={node_id}");
        state.session_closed(&node_id, &session_id).await;
        return;
    }
    debug!("handshake ok node={node_id} session={session_id} remote={remote_addr}");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx, cancel));
    read_loop(stream, &state, &node_id, &session_id, &handle).await;

    state.session_closed(&node_id, &session_id).await;
    drop(handle);
    if let Err(join_error) = writer.await {
        if !join_error.is_cancelled() {
            warn!("session writer task failed node={node_id}: {join_error}");
        }
    }
    debug!("connection closed node={node_id} remote={remote_addr}");
}

async fn perform_handshake(
    socket: &mut WebSocket,
    state: &SharedState,
    remote_ip: Option<String>,
) -> Option<(NodeSession, mpsc::UnboundedReceiver<String>, CancellationToken)> {
    let max_payload_bytes = state.config().max_payload_bytes;
    let text = match timeout(
        state.config().hello_timeout,
        recv_next_text(socket, max_payload_bytes),
    )
    .await
    {
        Ok(Ok(text)) => text,
        Ok(Err(frame_error)) => {
            close_with(socket, CLOSE_MALFORMED_HANDSHAKE, &frame_error.message).await;
            return None;
        }
        Err(_) => {
            close_with(socket, CLOSE_HANDSHAKE_TIMEOUT, "handshake timeout").await;
            return None;
        }
    };

    let raw = match parse_raw(&text) {
        Ok(raw) => raw,
        Err(frame_error) => {
            close_with(socket, CLOSE_MALFORMED_HANDSHAKE, &frame_error.message).await;
            return None;
        }
    };
    let payload_value = raw.get("payload").cloned().unwrap_or(Value::Null);
    let frame = match frame_from_value(raw) {
        Ok(frame) => frame,
        Err(frame_error) => {
            close_with(socket, CLOSE_MALFORMED_HANDSHAKE, &frame_error.message).await;
            return None;
        }
    };

    let FrameBody::Hello(hello) = frame.body else {
        close_with(socket, CLOSE_MALFORMED_HANDSHAKE, "first frame must be HELLO").await;
        return None;
    };

    let node_id = match frame.node_id.as_deref().map(str::trim) {
        Some(node_id) if !node_id.is_empty() => node_id.to_owned(),
        _ => {
            close_with(socket, CLOSE_MISSING_NODE_ID, "hello frame carries no node id").await;
            return None;
        }
    };

    if state.config().verify_signatures {
        match state.node_credential(&node_id).await {
            NodeCredential::Secret(secret) => {
                let Some(signature) = frame.signature.as_deref() else {
                    close_with(socket, CLOSE_INVALID_SIGNATURE, "hello frame is unsigned").await;
                    return None;
                };
                if !verify_payload(&payload_value, signature, &secret) {
                    warn!("hello signature verification failed node={node_id}");
                    close_with(socket, CLOSE_INVALID_SIGNATURE, "signature verification failed")
                        .await;
                    return None;
                }
            }
            // First connection for an unprovisioned node: admit it once so it
            // can register; a stored secret makes later connections verifiable.
            NodeCredential::NewNode => {
                debug!("no secret on file for node={node_id}, admitting as new");
            }
        }
    }

    let now = now_unix_ms();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let remote_ip = remote_ip.or_else(|| hello.ip_address.clone());
    let session = NodeSession {
        node_id,
        session_id: format!("sess-{}", Uuid::new_v4()),
        hostname: hello.hostname,
        remote_ip,
        capabilities: hello.capabilities,
        runner_version: hello.runner_version,
        status: NodeStatus::Ready,
        device_count: hello.device_count,
        active_tasks: 0,
        resources: Value::Null,
        connected_at_ms: now,
        last_heartbeat_ms: now,
        handle: SessionHandle::new(tx, cancel.clone()),
    };
    Some((session, rx, cancel))
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CLOSE_SESSION_REPLACED,
                    reason: "session superseded".into(),
                }));
                let _ = sink.send(close).await;
                break;
            }
            next = rx.recv() => match next {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &SharedState,
    node_id: &str,
    session_id: &str,
    handle: &SessionHandle,
) {
    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(error) => {
                warn!("websocket receive failed node={node_id}: {error}");
                break;
            }
        };

        let text = match message_to_text(message, state.config().max_payload_bytes) {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(frame_error) => {
                send_error(handle, &frame_error, None);
                break;
            }
        };

        let raw = match parse_raw(&text) {
            Ok(raw) => raw,
            Err(frame_error) => {
                send_error(handle, &frame_error, None);
                continue;
            }
        };
        let related = raw
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let frame = match frame_from_value(raw) {
            Ok(frame) => frame,
            Err(frame_error) => {
                send_error(handle, &frame_error, related);
                continue;
            }
        };

        handle_frame(state, node_id, session_id, handle, frame).await;
    }
}

async fn handle_frame(
    state: &SharedState,
    node_id: &str,
    session_id: &str,
    handle: &SessionHandle,
    frame: Frame,
) {
    match frame.body {
        FrameBody::Heartbeat(payload) => {
            let commands = state.heartbeat(node_id, session_id, &payload).await;
            if !commands.is_empty() {
                debug!("dispatching {} commands node={node_id}", commands.len());
            }
            send_body(
                handle,
                FrameBody::HeartbeatAck(HeartbeatAckPayload {
                    status: "OK".to_owned(),
                    commands,
                }),
            );
        }
        FrameBody::Result(payload) => {
            let command_id = payload.command_id.clone();
            state.command_completed(node_id, &payload).await;
            send_body(
                handle,
                FrameBody::Ack(AckPayload {
                    ack_message_id: frame.message_id,
                    status: "OK".to_owned(),
                    reason: None,
                }),
            );
            debug!("result recorded command={command_id} node={node_id}");
        }
        FrameBody::Ack(payload) => {
            debug!(
                "ack received node={node_id} for message {}",
                payload.ack_message_id
            );
        }
        FrameBody::Event(payload) => {
            debug!("event received node={node_id}: {payload}");
        }
        FrameBody::Error(payload) => {
            warn!(
                "node reported error node={node_id} code={} message={}",
                payload.error_code, payload.error_message
            );
        }
        body @ (FrameBody::Hello(_)
        | FrameBody::HelloAck(_)
        | FrameBody::HeartbeatAck(_)
        | FrameBody::Command(_)) => {
            let frame_error = FrameError::new(
                ERROR_UNEXPECTED_FRAME,
                format!("unexpected {} frame after handshake", body.kind()),
            );
            send_error(handle, &frame_error, Some(frame.message_id));
        }
    }
}

fn send_body(handle: &SessionHandle, body: FrameBody) {
    let frame = build_frame(PROTOCOL_VERSION, body);
    match serde_json::to_string(&frame) {
        Ok(text) => {
            if !handle.send(text) {
                debug!("session channel closed, dropped {} frame", frame.body.kind());
            }
        }
        Err(error) => error!("failed to serialize {} frame: {error}", frame.body.kind()),
    }
}

fn send_error(handle: &SessionHandle, frame_error: &FrameError, related_message_id: Option<String>) {
    send_body(
        handle,
        FrameBody::Error(frame_error.to_payload(related_message_id)),
    );
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let close = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }));
    if socket.send(close).await.is_err() {
        debug!("failed to deliver close frame code={code}");
    }
}

async fn recv_next_text(
    socket: &mut WebSocket,
    max_payload_bytes: usize,
) -> Result<String, FrameError> {
    loop {
        let next = socket.recv().await.ok_or_else(|| {
            FrameError::new(ERROR_MALFORMED_FRAME, "connection closed before handshake")
        })?;

        let message = next.map_err(|error| {
            FrameError::new(ERROR_MALFORMED_FRAME, format!("websocket read failed: {error}"))
        })?;

        match message_to_text(message, max_payload_bytes)? {
            Some(text) => return Ok(text),
            None => continue,
        }
    }
}

fn message_to_text(message: Message, max_payload_bytes: usize) -> Result<Option<String>, FrameError> {
    match message {
        Message::Text(text) => {
            if text.len() > max_payload_bytes {
                return Err(FrameError::new(
                    ERROR_PAYLOAD_TOO_LARGE,
                    format!("payload exceeds limit ({} > {max_payload_bytes})", text.len()),
                ));
            }
            Ok(Some(text.to_string()))
        }
        Message::Binary(bytes) => {
            if bytes.len() > max_payload_bytes {
                return Err(FrameError::new(
                    ERROR_PAYLOAD_TOO_LARGE,
                    format!("payload exceeds limit ({} > {max_payload_bytes})", bytes.len()),
                ));
            }
            let text = String::from_utf8(bytes.to_vec()).map_err(|_| {
                FrameError::new(ERROR_MALFORMED_FRAME, "binary frames must contain UTF-8")
            })?;
            Ok(Some(text))
        }
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => Ok(None),
    }
}

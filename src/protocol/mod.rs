mod errors;
mod frames;

pub use errors::{
    CLOSE_HANDSHAKE_TIMEOUT, CLOSE_INVALID_SIGNATURE, CLOSE_MALFORMED_HANDSHAKE,
    CLOSE_MISSING_NODE_ID, CLOSE_SESSION_REPLACED, ERROR_MALFORMED_FRAME, ERROR_PAYLOAD_TOO_LARGE,
    ERROR_UNEXPECTED_FRAME, ERROR_UNSUPPORTED_TYPE, FrameError,
};
pub use frames::{
    AckPayload, CommandPayload, DeviceResultEntry, DeviceSnapshotEntry, ErrorPayload, Frame,
    FrameBody, HeartbeatAckPayload, HeartbeatPayload, HelloAckPayload, HelloPayload, ResultPayload,
};

use serde_json::Value;
use uuid::Uuid;

use crate::domain::clock::now_unix_ms;

pub const PROTOCOL_VERSION: &str = "1.0";

const KNOWN_FRAME_TYPES: [&str; 9] = [
    "HELLO",
    "HELLO_ACK",
    "HEARTBEAT",
    "HEARTBEAT_ACK",
    "COMMAND",
    "RESULT",
    "ACK",
    "EVENT",
    "ERROR",
];

pub fn parse_raw(text: &str) -> Result<Value, FrameError> {
    serde_json::from_str::<Value>(text).map_err(|error| {
        FrameError::new(ERROR_MALFORMED_FRAME, format!("invalid frame json: {error}"))
    })
}

pub fn frame_from_value(value: Value) -> Result<Frame, FrameError> {
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(FrameError::new(ERROR_MALFORMED_FRAME, "missing frame type"));
    };
    if !KNOWN_FRAME_TYPES.contains(&kind) {
        return Err(FrameError::new(
            ERROR_UNSUPPORTED_TYPE,
            format!("unsupported frame type: {kind}"),
        ));
    }
    let kind = kind.to_owned();
    serde_json::from_value::<Frame>(value).map_err(|error| {
        FrameError::new(
            ERROR_MALFORMED_FRAME,
            format!("invalid {kind} frame: {error}"),
        )
    })
}

pub fn parse_frame(text: &str) -> Result<Frame, FrameError> {
    frame_from_value(parse_raw(text)?)
}

#[must_use]
pub fn build_frame(version: &str, body: FrameBody) -> Frame {
    Frame {
        version: version.to_owned(),
        timestamp: now_unix_ms(),
        message_id: format!("msg-{}", Uuid::new_v4()),
        node_id: None,
        signature: None,
        body,
    }
}

#[must_use]
pub fn map_result_status(status: &str) -> &'static str {
    match status {
        "success" => "completed",
        "partial" => "completed_partial",
        _ => "failed",
    }
}

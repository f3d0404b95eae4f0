use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::models::{CommandPriority, CommandTarget, NodeStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub version: String,
    pub timestamp: u64,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(flatten)]
    pub body: FrameBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum FrameBody {
    #[serde(rename = "HELLO")]
    Hello(HelloPayload),
    #[serde(rename = "HELLO_ACK")]
    HelloAck(HelloAckPayload),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(HeartbeatPayload),
    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck(HeartbeatAckPayload),
    #[serde(rename = "COMMAND")]
    Command(CommandPayload),
    #[serde(rename = "RESULT")]
    Result(ResultPayload),
    #[serde(rename = "ACK")]
    Ack(AckPayload),
    #[serde(rename = "EVENT")]
    Event(Value),
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
}

impl FrameBody {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FrameBody::Hello(_) => "HELLO",
            FrameBody::HelloAck(_) => "HELLO_ACK",
            FrameBody::Heartbeat(_) => "HEARTBEAT",
            FrameBody::HeartbeatAck(_) => "HEARTBEAT_ACK",
            FrameBody::Command(_) => "COMMAND",
            FrameBody::Result(_) => "RESULT",
            FrameBody::Ack(_) => "ACK",
            FrameBody::Event(_) => "EVENT",
            FrameBody::Error(_) => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub device_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAckPayload {
    pub session_id: String,
    pub heartbeat_interval: u64,
    pub max_tasks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: NodeStatus,
    #[serde(default)]
    pub device_snapshot: Vec<DeviceSnapshotEntry>,
    #[serde(default)]
    pub active_tasks: u32,
    #[serde(default)]
    pub resources: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshotEntry {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAckPayload {
    pub status: String,
    pub commands: Vec<CommandPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command_id: String,
    pub command_type: String,
    pub priority: CommandPriority,
    pub target: CommandTarget,
    #[serde(default)]
    pub params: Value,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPayload {
    pub command_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub device_results: Vec<DeviceResultEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResultEntry {
    pub device_id: String,
    pub status: String,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub watch_seconds: u64,
    #[serde(default)]
    pub interactions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack_message_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_message_id: Option<String>,
}

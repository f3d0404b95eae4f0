pub mod http;

pub use http::HttpStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::ControlError;
use crate::domain::models::{NodeStatus, RecoveryEvent, RecoveryRule};
use crate::protocol::{CommandPayload, DeviceResultEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub session_id: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub device_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_version: Option<String>,
    pub connected_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub node_id: String,
    pub session_id: String,
    pub status: NodeStatus,
    pub device_count: u32,
    pub active_tasks: u32,
    #[serde(default)]
    pub resources: Value,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCompletion {
    pub command_id: String,
    pub node_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub device_results: Vec<DeviceResultEntry>,
    pub ts: u64,
}

#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn fetch_node_secret(&self, node_id: &str) -> Result<Option<String>, ControlError>;

    async fn register_node(&self, registration: &NodeRegistration) -> Result<(), ControlError>;

    async fn disconnect_node(&self, node_id: &str, session_id: &str) -> Result<(), ControlError>;

    async fn process_heartbeat(
        &self,
        report: &HeartbeatReport,
    ) -> Result<Vec<CommandPayload>, ControlError>;

    async fn mark_command_started(
        &self,
        command_id: &str,
        node_id: &str,
    ) -> Result<(), ControlError>;

    async fn complete_command(&self, completion: &CommandCompletion) -> Result<(), ControlError>;

    async fn enqueue_command(&self, command: &CommandPayload) -> Result<(), ControlError>;

    async fn recovery_allowed(
        &self,
        rule: &RecoveryRule,
        node_id: &str,
    ) -> Result<bool, ControlError>;

    async fn record_recovery(&self, event: &RecoveryEvent) -> Result<(), ControlError>;
}

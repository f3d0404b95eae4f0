use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Ready,
    Busy,
    Disconnected,
}

impl NodeStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Ready => "READY",
            NodeStatus::Busy => "BUSY",
            NodeStatus::Disconnected => "DISCONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DevicePool {
    Active,
    Reserve,
    Maintenance,
}

impl DevicePool {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePool::Active => "ACTIVE",
            DevicePool::Reserve => "RESERVE",
            DevicePool::Maintenance => "MAINTENANCE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Idle,
    Active,
    Resting,
    Error,
    Maintenance,
    Offline,
}

impl DeviceStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Idle => "IDLE",
            DeviceStatus::Active => "ACTIVE",
            DeviceStatus::Resting => "RESTING",
            DeviceStatus::Error => "ERROR",
            DeviceStatus::Maintenance => "MAINTENANCE",
            DeviceStatus::Offline => "OFFLINE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandPriority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPriority {
    P1,
    P2,
    P3,
}

impl RequestPriority {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPriority::P1 => "P1",
            RequestPriority::P2 => "P2",
            RequestPriority::P3 => "P3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryLevel {
    Soft,
    Service,
    Power,
}

impl RecoveryLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryLevel::Soft => "soft",
            RecoveryLevel::Service => "service",
            RecoveryLevel::Power => "power",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandTarget {
    Nodes(Vec<String>),
    Node(String),
}

impl CommandTarget {
    #[must_use]
    pub fn includes(&self, node_id: &str) -> bool {
        match self {
            CommandTarget::Node(id) => id == "all" || id == node_id,
            CommandTarget::Nodes(ids) => ids.iter().any(|id| id == node_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub node_id: String,
    pub board: u32,
    pub slot: u32,
    pub pool: DevicePool,
    pub status: DeviceStatus,
    pub activity: Option<String>,
    pub activity_started_ms: Option<u64>,
    pub released_at_ms: Option<u64>,
    pub resting_since_ms: Option<u64>,
    pub consecutive_errors: u32,
    pub last_seen_ms: u64,
    pub stats_day: NaiveDate,
    pub tasks_completed_today: u32,
    pub watch_seconds_today: u64,
    pub interactions_today: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRule {
    pub name: String,
    pub enabled: bool,
    pub level: RecoveryLevel,
    pub cooldown_seconds: u64,
    pub max_per_day: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub event_id: String,
    pub node_id: String,
    pub rule: String,
    pub level: RecoveryLevel,
    pub condition: Value,
    pub ts: u64,
    pub executed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub requested: usize,
    pub granted: usize,
    pub shortfall: usize,
    pub device_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolBreakdown {
    pub active: usize,
    pub reserve: usize,
    pub maintenance: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusBreakdown {
    pub idle: usize,
    pub active: usize,
    pub resting: usize,
    pub error: usize,
    pub maintenance: usize,
    pub offline: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub total: usize,
    pub pools: PoolBreakdown,
    pub statuses: StatusBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardHealth {
    pub node_id: String,
    pub board: u32,
    pub devices: usize,
    pub error_devices: usize,
    pub error_rate: f64,
    pub active_rate: f64,
    pub classification: String,
}

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use clap::Parser;

use crate::scheduler::{ActivityRange, FleetGeometry, SchedulerConfig};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "fleetd",
    version,
    about = "Fleet controller: node session gateway, device scheduler, and auto-recovery"
)]
pub struct Args {
    #[arg(long, env = "FLEETD_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, env = "FLEETD_PORT", default_value_t = 8750)]
    pub port: u16,

    #[arg(long, env = "FLEETD_STORE_URL")]
    pub store_url: Option<String>,

    #[arg(long, env = "FLEETD_EXECUTOR_URL")]
    pub executor_url: Option<String>,

    #[arg(long, env = "FLEETD_STORE_TIMEOUT_MS", default_value_t = 5_000)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "FLEETD_MAX_PAYLOAD_BYTES", default_value_t = 1024 * 1024)]
    pub max_payload_bytes: usize,

    #[arg(long, env = "FLEETD_HELLO_TIMEOUT_MS", default_value_t = 10_000)]
    pub hello_timeout_ms: u64,

    #[arg(long, env = "FLEETD_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "FLEETD_HEARTBEAT_TIMEOUT_SECS", default_value_t = 90)]
    pub heartbeat_timeout_secs: u64,

    #[arg(long, env = "FLEETD_MAX_TASKS_PER_NODE", default_value_t = 5)]
    pub max_tasks_per_node: u32,

    #[arg(long, env = "FLEETD_COMMAND_TIMEOUT_SECS", default_value_t = 60)]
    pub command_timeout_secs: u64,

    #[arg(long, env = "FLEETD_VERIFY_SIGNATURES", default_value_t = true)]
    pub verify_signatures: bool,

    #[arg(long, env = "FLEETD_FALLBACK_SECRET")]
    pub fallback_secret: Option<String>,

    #[arg(long, env = "FLEETD_FLEET_NODES", default_value_t = 10)]
    pub fleet_nodes: u32,

    #[arg(long, env = "FLEETD_BOARDS_PER_NODE", default_value_t = 4)]
    pub boards_per_node: u32,

    #[arg(long, env = "FLEETD_SLOTS_PER_BOARD", default_value_t = 30)]
    pub slots_per_board: u32,

    #[arg(long, env = "FLEETD_ACTIVE_PERCENT", default_value_t = 83)]
    pub active_percent: u32,

    #[arg(long, env = "FLEETD_RESERVE_PERCENT", default_value_t = 10)]
    pub reserve_percent: u32,

    #[arg(long, env = "FLEETD_ERROR_THRESHOLD", default_value_t = 3)]
    pub error_threshold: u32,

    #[arg(long, env = "FLEETD_MAX_ACTIVITY_SECS", default_value_t = 4 * 3600)]
    pub max_activity_secs: u64,

    #[arg(long, env = "FLEETD_REST_SECS", default_value_t = 1_800)]
    pub rest_secs: u64,

    #[arg(long, env = "FLEETD_DEVICE_OFFLINE_SECS", default_value_t = 180)]
    pub device_offline_secs: u64,

    #[arg(long, env = "FLEETD_URGENT_DEVICE_CAP", default_value_t = 100)]
    pub urgent_device_cap: usize,

    #[arg(long, env = "FLEETD_BATCH_DEVICE_CAP", default_value_t = 50)]
    pub batch_device_cap: usize,

    #[arg(long, env = "FLEETD_ACTIVITY_RANGES")]
    pub activity_ranges: Option<String>,

    #[arg(long, env = "FLEETD_SWEEP_INTERVAL_MS", default_value_t = 30_000)]
    pub sweep_interval_ms: u64,

    #[arg(long, env = "FLEETD_RECOVERY_ENABLED", default_value_t = true)]
    pub recovery_enabled: bool,

    #[arg(long, env = "FLEETD_RECOVERY_POLL_MS", default_value_t = 30_000)]
    pub recovery_poll_ms: u64,

    #[arg(long, env = "FLEETD_DISABLED_RULES")]
    pub disabled_rules: Option<String>,

    #[arg(long, env = "FLEETD_RUNTIME_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub runtime_version: String,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[arg(long, env = "FLEETD_JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: IpAddr,
    pub port: u16,
    pub store_url: Option<String>,
    pub executor_url: Option<String>,
    pub store_timeout: Duration,
    pub max_payload_bytes: usize,
    pub hello_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_tasks_per_node: u32,
    pub command_timeout: Duration,
    pub verify_signatures: bool,
    pub fallback_secret: Option<String>,
    pub geometry: FleetGeometry,
    pub scheduler: SchedulerConfig,
    pub sweep_interval: Duration,
    pub recovery_enabled: bool,
    pub recovery_poll_interval: Duration,
    pub disabled_rules: Vec<String>,
    pub runtime_version: String,
    pub log_filter: String,
    pub json_logs: bool,
}

impl RuntimeConfig {
    pub fn from_args(args: Args) -> Result<Self, String> {
        if args.port == 0 {
            return Err("port must be greater than 0".to_owned());
        }
        if args.max_payload_bytes == 0 {
            return Err("max_payload_bytes must be greater than 0".to_owned());
        }
        if args.fleet_nodes == 0 || args.boards_per_node == 0 || args.slots_per_board == 0 {
            return Err("fleet geometry dimensions must all be greater than 0".to_owned());
        }
        if args.active_percent == 0 {
            return Err("active_percent must be greater than 0".to_owned());
        }
        if args.active_percent + args.reserve_percent > 100 {
            return Err("active_percent plus reserve_percent must not exceed 100".to_owned());
        }
        if args.error_threshold == 0 {
            return Err("error_threshold must be greater than 0".to_owned());
        }
        if args.max_activity_secs == 0 || args.rest_secs == 0 {
            return Err("activity and rest durations must be greater than 0".to_owned());
        }
        if args.urgent_device_cap == 0 || args.batch_device_cap == 0 {
            return Err("request device caps must be greater than 0".to_owned());
        }
        if args.heartbeat_interval_secs >= args.heartbeat_timeout_secs {
            return Err("heartbeat_interval_secs must be below heartbeat_timeout_secs".to_owned());
        }

        let activity_ranges = parse_activity_ranges(args.activity_ranges.as_deref())?;

        Ok(Self {
            host: args.host,
            port: args.port,
            store_url: normalize_optional(args.store_url),
            executor_url: normalize_optional(args.executor_url),
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            max_payload_bytes: args.max_payload_bytes,
            hello_timeout: Duration::from_millis(args.hello_timeout_ms),
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
            max_tasks_per_node: args.max_tasks_per_node,
            command_timeout: Duration::from_secs(args.command_timeout_secs),
            verify_signatures: args.verify_signatures,
            fallback_secret: normalize_optional(args.fallback_secret),
            geometry: FleetGeometry {
                nodes: args.fleet_nodes,
                boards_per_node: args.boards_per_node,
                slots_per_board: args.slots_per_board,
            },
            scheduler: SchedulerConfig {
                active_percent: args.active_percent,
                reserve_percent: args.reserve_percent,
                error_threshold: args.error_threshold,
                max_activity_secs: args.max_activity_secs,
                rest_secs: args.rest_secs,
                device_offline_secs: args.device_offline_secs,
                urgent_device_cap: args.urgent_device_cap,
                batch_device_cap: args.batch_device_cap,
                activity_ranges,
            },
            sweep_interval: Duration::from_millis(args.sweep_interval_ms),
            recovery_enabled: args.recovery_enabled,
            recovery_poll_interval: Duration::from_millis(args.recovery_poll_ms),
            disabled_rules: parse_disabled_rules(args.disabled_rules.as_deref()),
            runtime_version: args.runtime_version,
            log_filter: args.log_filter,
            json_logs: args.json_logs,
        })
    }

    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    #[must_use]
    pub fn for_test(host: IpAddr, port: u16) -> Self {
        let mut activity_ranges = BTreeMap::new();
        activity_ranges.insert("watch".to_owned(), ActivityRange { min: 2, max: 4 });
        activity_ranges.insert("browse".to_owned(), ActivityRange { min: 1, max: 2 });

        Self {
            host,
            port,
            store_url: None,
            executor_url: None,
            store_timeout: Duration::from_millis(2_000),
            max_payload_bytes: 256 * 1024,
            hello_timeout: Duration::from_millis(3_000),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            max_tasks_per_node: 3,
            command_timeout: Duration::from_secs(2),
            verify_signatures: true,
            fallback_secret: None,
            geometry: FleetGeometry {
                nodes: 2,
                boards_per_node: 1,
                slots_per_board: 5,
            },
            scheduler: SchedulerConfig {
                active_percent: 83,
                reserve_percent: 10,
                error_threshold: 3,
                max_activity_secs: 4 * 3600,
                rest_secs: 1_800,
                device_offline_secs: 180,
                urgent_device_cap: 5,
                batch_device_cap: 3,
                activity_ranges,
            },
            sweep_interval: Duration::from_millis(200),
            recovery_enabled: true,
            recovery_poll_interval: Duration::from_millis(200),
            disabled_rules: Vec::new(),
            runtime_version: "test".to_owned(),
            log_filter: "warn".to_owned(),
            json_logs: false,
        }
    }
}

fn normalize_optional(input: Option<String>) -> Option<String> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    })
}

fn parse_activity_ranges(input: Option<&str>) -> Result<BTreeMap<String, ActivityRange>, String> {
    let Some(raw) = input else {
        return Ok(default_activity_ranges());
    };
    let ranges: BTreeMap<String, ActivityRange> = serde_json::from_str(raw)
        .map_err(|error| format!("invalid activity_ranges JSON: {error}"))?;
    for (activity, range) in &ranges {
        if range.min == 0 {
            return Err(format!("activity {activity} range minimum must be at least 1"));
        }
        if range.min > range.max {
            return Err(format!(
                "activity {activity} range minimum exceeds its maximum"
            ));
        }
    }
    Ok(ranges)
}

fn default_activity_ranges() -> BTreeMap<String, ActivityRange> {
    let mut ranges = BTreeMap::new();
    ranges.insert("watch".to_owned(), ActivityRange { min: 50, max: 200 });
    ranges.insert("browse".to_owned(), ActivityRange { min: 20, max: 100 });
    ranges.insert("engage".to_owned(), ActivityRange { min: 10, max: 50 });
    ranges
}

fn parse_disabled_rules(input: Option<&str>) -> Vec<String> {
    input
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

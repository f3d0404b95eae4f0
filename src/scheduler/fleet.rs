use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Deserialize;

use crate::domain::clock::{now_unix_ms, today_utc};
use crate::domain::error::ControlError;
use crate::domain::models::{
    Allocation, BoardHealth, Device, DevicePool, DeviceStatus, FleetStatus, PoolBreakdown,
    RequestPriority, StatusBreakdown,
};
use crate::protocol::{DeviceResultEntry, DeviceSnapshotEntry};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ActivityRange {
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone)]
pub struct FleetGeometry {
    pub nodes: u32,
    pub boards_per_node: u32,
    pub slots_per_board: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub active_percent: u32,
    pub reserve_percent: u32,
    pub error_threshold: u32,
    pub max_activity_secs: u64,
    pub rest_secs: u64,
    pub device_offline_secs: u64,
    pub urgent_device_cap: usize,
    pub batch_device_cap: usize,
    pub activity_ranges: BTreeMap<String, ActivityRange>,
}

pub struct FleetScheduler {
    config: SchedulerConfig,
    devices: Mutex<HashMap<String, Device>>,
}

impl FleetScheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig, geometry: &FleetGeometry) -> Self {
        let now = now_unix_ms();
        let today = today_utc();

        let mut ids = Vec::new();
        let mut devices = HashMap::new();
        for node in 1..=geometry.nodes {
            let node_id = format!("node-{node}");
            for board in 1..=geometry.boards_per_node {
                for slot in 1..=geometry.slots_per_board {
                    let device_id = format!("{node_id}-b{board}-s{slot}");
                    ids.push(device_id.clone());
                    devices.insert(
                        device_id.clone(),
                        Device {
                            device_id,
                            node_id: node_id.clone(),
                            board,
                            slot,
                            pool: DevicePool::Maintenance,
                            status: DeviceStatus::Maintenance,
                            activity: None,
                            activity_started_ms: None,
                            released_at_ms: None,
                            resting_since_ms: None,
                            consecutive_errors: 0,
                            last_seen_ms: now,
                            stats_day: today,
                            tasks_completed_today: 0,
                            watch_seconds_today: 0,
                            interactions_today: 0,
                        },
                    );
                }
            }
        }

        ids.shuffle(&mut rand::thread_rng());
        let total = ids.len();
        let active_count = total * config.active_percent as usize / 100;
        let reserve_count = total * config.reserve_percent as usize / 100;
        for (index, id) in ids.iter().enumerate() {
            let Some(device) = devices.get_mut(id) else {
                continue;
            };
            if index < active_count {
                device.pool = DevicePool::Active;
                device.status = DeviceStatus::Idle;
            } else if index < active_count + reserve_count {
                device.pool = DevicePool::Reserve;
                device.status = DeviceStatus::Idle;
            }
        }

        Self {
            config,
            devices: Mutex::new(devices),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Device>> {
        match self.devices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn allocate_activity(
        &self,
        activity: &str,
        count: Option<usize>,
    ) -> Result<Allocation, ControlError> {
        let range = self.config.activity_ranges.get(activity).copied();
        let target = match (count, range) {
            (Some(asked), Some(range)) => asked.clamp(range.min, range.max),
            (Some(asked), None) => asked,
            (None, Some(range)) => rand::thread_rng().gen_range(range.min..=range.max),
            (None, None) => {
                return Err(ControlError::InvalidRequest(format!(
                    "activity {activity} has no configured range and no count was given"
                )));
            }
        };

        let mut devices = self.lock();
        let selected = take_idle(&mut devices, target);
        let granted = selected.len();
        mark_allocated(&mut devices, &selected, activity);
        Ok(Allocation {
            requested: target,
            granted,
            shortfall: target - granted,
            device_ids: selected,
        })
    }

    #[must_use]
    pub fn allocate_request(&self, priority: RequestPriority, count: usize) -> Allocation {
        let target = match priority {
            RequestPriority::P1 => count.min(self.config.urgent_device_cap),
            RequestPriority::P2 => count.min(self.config.batch_device_cap),
            RequestPriority::P3 => count,
        };
        let label = format!("request-{}", priority.as_str().to_lowercase());

        let mut devices = self.lock();
        let mut selected = take_idle(&mut devices, target);
        if priority == RequestPriority::P1 && selected.len() < target {
            let taken: HashSet<&String> = selected.iter().collect();
            let mut preemptable: Vec<String> = devices
                .values()
                .filter(|device| {
                    device.status == DeviceStatus::Active && !taken.contains(&device.device_id)
                })
                .map(|device| device.device_id.clone())
                .collect();
            preemptable.sort();
            preemptable.truncate(target - selected.len());
            selected.extend(preemptable);
        }

        let granted = selected.len();
        mark_allocated(&mut devices, &selected, &label);
        Allocation {
            requested: target,
            granted,
            shortfall: target - granted,
            device_ids: selected,
        }
    }

    pub fn release(&self, device_ids: &[String]) -> usize {
        let now = now_unix_ms();
        let mut devices = self.lock();
        let mut released = 0;
        for id in device_ids {
            let Some(device) = devices.get_mut(id) else {
                continue;
            };
            if device.status == DeviceStatus::Active {
                device.status = DeviceStatus::Idle;
                device.activity = None;
                device.activity_started_ms = None;
                device.released_at_ms = Some(now);
                released += 1;
            }
        }
        released
    }

    pub fn record_error(&self, device_id: &str) -> Result<bool, ControlError> {
        let mut devices = self.lock();
        let promoted = {
            let Some(device) = devices.get_mut(device_id) else {
                return Err(ControlError::NotFound(format!(
                    "device {device_id} is not part of the fleet"
                )));
            };
            device.consecutive_errors += 1;
            device.activity = None;
            device.activity_started_ms = None;
            if device.consecutive_errors >= self.config.error_threshold
                && device.pool != DevicePool::Maintenance
            {
                device.pool = DevicePool::Maintenance;
                device.status = DeviceStatus::Maintenance;
                true
            } else {
                if device.pool != DevicePool::Maintenance {
                    device.status = DeviceStatus::Error;
                }
                false
            }
        };
        if promoted {
            promote_reserve(&mut devices);
        }
        Ok(promoted)
    }

    pub fn record_success(&self, device_id: &str) -> Result<(), ControlError> {
        let mut devices = self.lock();
        let Some(device) = devices.get_mut(device_id) else {
            return Err(ControlError::NotFound(format!(
                "device {device_id} is not part of the fleet"
            )));
        };
        device.consecutive_errors = 0;
        if device.status == DeviceStatus::Error {
            device.status = DeviceStatus::Idle;
        }
        Ok(())
    }

    pub fn restore_device(&self, device_id: &str) -> Result<(), ControlError> {
        let mut devices = self.lock();
        let Some(device) = devices.get_mut(device_id) else {
            return Err(ControlError::NotFound(format!(
                "device {device_id} is not part of the fleet"
            )));
        };
        if device.pool != DevicePool::Maintenance {
            return Err(ControlError::InvalidRequest(format!(
                "device {device_id} is not in maintenance"
            )));
        }
        device.pool = DevicePool::Reserve;
        device.status = DeviceStatus::Idle;
        device.consecutive_errors = 0;
        device.activity = None;
        device.activity_started_ms = None;
        device.resting_since_ms = None;
        Ok(())
    }

    pub fn apply_result_stats(&self, results: &[DeviceResultEntry]) {
        self.apply_result_stats_at(results, today_utc());
    }

    fn apply_result_stats_at(&self, results: &[DeviceResultEntry], today: NaiveDate) {
        let mut crossings = 0;
        let mut devices = self.lock();
        for entry in results {
            let Some(device) = devices.get_mut(&entry.device_id) else {
                continue;
            };
            if device.stats_day != today {
                device.stats_day = today;
                device.tasks_completed_today = 0;
                device.watch_seconds_today = 0;
                device.interactions_today = 0;
            }
            if entry.status == "success" {
                device.tasks_completed_today += entry.tasks_completed.max(1);
                device.watch_seconds_today += entry.watch_seconds;
                device.interactions_today += entry.interactions;
                device.consecutive_errors = 0;
                if device.status == DeviceStatus::Error {
                    device.status = DeviceStatus::Idle;
                }
            } else {
                device.consecutive_errors += 1;
                device.activity = None;
                device.activity_started_ms = None;
                if device.consecutive_errors >= self.config.error_threshold
                    && device.pool != DevicePool::Maintenance
                {
                    device.pool = DevicePool::Maintenance;
                    device.status = DeviceStatus::Maintenance;
                    crossings += 1;
                } else if device.pool != DevicePool::Maintenance {
                    device.status = DeviceStatus::Error;
                }
            }
        }
        // One reserve activation per device pulled into maintenance.
        for _ in 0..crossings {
            promote_reserve(&mut devices);
        }
    }

    pub fn observe_heartbeats(
        &self,
        node_id: &str,
        entries: &[DeviceSnapshotEntry],
        now_ms: u64,
    ) -> usize {
        let mut devices = self.lock();
        let mut updated = 0;
        for entry in entries {
            let Some(device) = devices.get_mut(&entry.device_id) else {
                continue;
            };
            if device.node_id != node_id {
                continue;
            }
            device.last_seen_ms = now_ms;
            if device.status == DeviceStatus::Offline {
                device.status = DeviceStatus::Idle;
            }
            updated += 1;
        }
        updated
    }

    pub fn mark_node_offline(&self, node_id: &str) -> usize {
        let mut devices = self.lock();
        let mut marked = 0;
        for device in devices.values_mut() {
            if device.node_id == node_id && device.status != DeviceStatus::Offline {
                device.status = DeviceStatus::Offline;
                device.activity = None;
                device.activity_started_ms = None;
                marked += 1;
            }
        }
        marked
    }

    pub fn sweep_offline(&self, now_ms: u64) -> usize {
        let timeout_ms = self.config.device_offline_secs * 1_000;
        let mut devices = self.lock();
        let mut marked = 0;
        for device in devices.values_mut() {
            if device.status != DeviceStatus::Offline
                && now_ms.saturating_sub(device.last_seen_ms) > timeout_ms
            {
                device.status = DeviceStatus::Offline;
                device.activity = None;
                device.activity_started_ms = None;
                marked += 1;
            }
        }
        marked
    }

    pub fn sweep_rotation(&self, now_ms: u64) -> (usize, usize) {
        let max_activity_ms = self.config.max_activity_secs * 1_000;
        let rest_ms = self.config.rest_secs * 1_000;
        let mut devices = self.lock();
        let mut rested = 0;
        let mut woken = 0;
        for device in devices.values_mut() {
            match device.status {
                DeviceStatus::Active => {
                    let Some(started) = device.activity_started_ms else {
                        continue;
                    };
                    if now_ms.saturating_sub(started) >= max_activity_ms {
                        device.status = DeviceStatus::Resting;
                        device.resting_since_ms = Some(now_ms);
                        device.activity = None;
                        device.activity_started_ms = None;
                        rested += 1;
                    }
                }
                DeviceStatus::Resting => {
                    let Some(since) = device.resting_since_ms else {
                        device.status = DeviceStatus::Idle;
                        woken += 1;
                        continue;
                    };
                    if now_ms.saturating_sub(since) >= rest_ms {
                        device.status = DeviceStatus::Idle;
                        device.resting_since_ms = None;
                        woken += 1;
                    }
                }
                _ => {}
            }
        }
        (rested, woken)
    }

    #[must_use]
    pub fn pool_status(&self) -> FleetStatus {
        let devices = self.lock();
        let mut pools = PoolBreakdown {
            active: 0,
            reserve: 0,
            maintenance: 0,
        };
        let mut statuses = StatusBreakdown {
            idle: 0,
            active: 0,
            resting: 0,
            error: 0,
            maintenance: 0,
            offline: 0,
        };
        for device in devices.values() {
            match device.pool {
                DevicePool::Active => pools.active += 1,
                DevicePool::Reserve => pools.reserve += 1,
                DevicePool::Maintenance => pools.maintenance += 1,
            }
            match device.status {
                DeviceStatus::Idle => statuses.idle += 1,
                DeviceStatus::Active => statuses.active += 1,
                DeviceStatus::Resting => statuses.resting += 1,
                DeviceStatus::Error => statuses.error += 1,
                DeviceStatus::Maintenance => statuses.maintenance += 1,
                DeviceStatus::Offline => statuses.offline += 1,
            }
        }
        FleetStatus {
            total: devices.len(),
            pools,
            statuses,
        }
    }

    #[must_use]
    pub fn activity_counts(&self) -> BTreeMap<String, usize> {
        let devices = self.lock();
        let mut counts = BTreeMap::new();
        for device in devices.values() {
            if device.status != DeviceStatus::Active {
                continue;
            }
            let Some(activity) = &device.activity else {
                continue;
            };
            *counts.entry(activity.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn board_health(&self) -> Vec<BoardHealth> {
        let devices = self.lock();
        let mut boards: BTreeMap<(String, u32), (usize, usize, usize)> = BTreeMap::new();
        for device in devices.values() {
            let entry = boards
                .entry((device.node_id.clone(), device.board))
                .or_insert((0, 0, 0));
            entry.0 += 1;
            let unhealthy = device.pool == DevicePool::Maintenance
                || matches!(device.status, DeviceStatus::Error | DeviceStatus::Offline);
            if unhealthy {
                entry.1 += 1;
            }
            if device.status == DeviceStatus::Active {
                entry.2 += 1;
            }
        }

        boards
            .into_iter()
            .map(|((node_id, board), (total, errors, active))| {
                let error_rate = errors as f64 / total as f64;
                let active_rate = active as f64 / total as f64;
                let classification = if error_rate < 0.1 {
                    "good"
                } else if error_rate < 0.3 {
                    "warning"
                } else {
                    "critical"
                };
                BoardHealth {
                    node_id,
                    board,
                    devices: total,
                    error_devices: errors,
                    error_rate,
                    active_rate,
                    classification: classification.to_owned(),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.lock().get(device_id).cloned()
    }

    #[must_use]
    pub fn total_devices(&self) -> usize {
        self.lock().len()
    }
}

fn take_idle(devices: &mut HashMap<String, Device>, target: usize) -> Vec<String> {
    let mut selected = idle_in_pool(devices, DevicePool::Active, target);
    if selected.len() < target {
        let backfill = idle_in_pool(devices, DevicePool::Reserve, target - selected.len());
        selected.extend(backfill);
    }
    selected
}

fn idle_in_pool(devices: &HashMap<String, Device>, pool: DevicePool, limit: usize) -> Vec<String> {
    let mut ids: Vec<String> = devices
        .values()
        .filter(|device| device.pool == pool && device.status == DeviceStatus::Idle)
        .map(|device| device.device_id.clone())
        .collect();
    ids.sort();
    ids.truncate(limit);
    ids
}

fn mark_allocated(devices: &mut HashMap<String, Device>, ids: &[String], activity: &str) {
    let now = now_unix_ms();
    for id in ids {
        let Some(device) = devices.get_mut(id) else {
            continue;
        };
        device.status = DeviceStatus::Active;
        device.activity = Some(activity.to_owned());
        device.activity_started_ms = Some(now);
    }
}

fn promote_reserve(devices: &mut HashMap<String, Device>) {
    let candidate = idle_in_pool(devices, DevicePool::Reserve, 1);
    let Some(id) = candidate.first() else {
        return;
    };
    if let Some(device) = devices.get_mut(id) {
        device.pool = DevicePool::Active;
    }
}

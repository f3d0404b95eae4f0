use std::collections::BTreeMap;

use crate::domain::models::{RecoveryLevel, RecoveryRule};

pub const RULE_DEVICE_DROP: &str = "device_drop";
pub const RULE_DEVICE_DROP_SEVERE: &str = "device_drop_severe";
pub const RULE_INPUT_DRIVER_DOWN: &str = "input_driver_down";
pub const RULE_DEVICE_BRIDGE_ERROR: &str = "device_bridge_error";
pub const RULE_NODE_POWER_CYCLE: &str = "node_power_cycle";

pub struct RuleSet {
    rules: BTreeMap<String, RecoveryRule>,
}

impl RuleSet {
    #[must_use]
    pub fn defaults() -> Self {
        let mut rules = BTreeMap::new();
        for rule in [
            RecoveryRule {
                name: RULE_DEVICE_DROP.to_owned(),
                enabled: true,
                level: RecoveryLevel::Soft,
                cooldown_seconds: 600,
                max_per_day: 10,
            },
            RecoveryRule {
                name: RULE_DEVICE_DROP_SEVERE.to_owned(),
                enabled: true,
                level: RecoveryLevel::Service,
                cooldown_seconds: 1800,
                max_per_day: 6,
            },
            RecoveryRule {
                name: RULE_INPUT_DRIVER_DOWN.to_owned(),
                enabled: true,
                level: RecoveryLevel::Service,
                cooldown_seconds: 900,
                max_per_day: 8,
            },
            RecoveryRule {
                name: RULE_DEVICE_BRIDGE_ERROR.to_owned(),
                enabled: true,
                level: RecoveryLevel::Service,
                cooldown_seconds: 900,
                max_per_day: 8,
            },
            RecoveryRule {
                name: RULE_NODE_POWER_CYCLE.to_owned(),
                enabled: true,
                level: RecoveryLevel::Power,
                cooldown_seconds: 3600,
                max_per_day: 2,
            },
        ] {
            rules.insert(rule.name.clone(), rule);
        }
        Self { rules }
    }

    #[must_use]
    pub fn with_disabled(disabled: &[String]) -> (Self, Vec<String>) {
        let mut set = Self::defaults();
        let mut unknown = Vec::new();
        for name in disabled {
            if !set.disable(name) {
                unknown.push(name.clone());
            }
        }
        (set, unknown)
    }

    pub fn disable(&mut self, name: &str) -> bool {
        match self.rules.get_mut(name) {
            Some(rule) => {
                rule.enabled = false;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RecoveryRule> {
        self.rules.get(name)
    }

    #[must_use]
    pub fn all(&self) -> Vec<RecoveryRule> {
        self.rules.values().cloned().collect()
    }
}

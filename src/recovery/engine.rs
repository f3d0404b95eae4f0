use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::RecoveryExecutor;
use super::rules::{
    RULE_DEVICE_BRIDGE_ERROR, RULE_DEVICE_DROP, RULE_DEVICE_DROP_SEVERE, RULE_INPUT_DRIVER_DOWN,
    RuleSet,
};
use crate::domain::clock::now_unix_ms;
use crate::domain::models::{RecoveryEvent, RecoveryLevel, RecoveryRule};
use crate::sessions::NodeSession;
use crate::store::ControlStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub rule: String,
    pub condition: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    UnknownRule,
    Disabled,
    Skipped,
    AlertOnly,
    Executed,
    ExecutorFailed,
    ExecutorUnavailable,
}

pub struct RecoveryEngine {
    rules: RuleSet,
    store: Option<Arc<dyn ControlStore>>,
    executor: Option<Arc<dyn RecoveryExecutor>>,
    baselines: Mutex<HashMap<String, u32>>,
}

impl RecoveryEngine {
    #[must_use]
    pub fn new(
        rules: RuleSet,
        store: Option<Arc<dyn ControlStore>>,
        executor: Option<Arc<dyn RecoveryExecutor>>,
    ) -> Self {
        Self {
            rules,
            store,
            executor,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    fn lock_baselines(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        match self.baselines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[must_use]
    pub fn evaluate(&self, session: &NodeSession) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        if let Some(trigger) = self.device_drop_trigger(&session.node_id, session.device_count) {
            triggers.push(trigger);
        }
        if let Some(trigger) = input_driver_trigger(&session.resources) {
            triggers.push(trigger);
        }
        if let Some(trigger) = device_bridge_trigger(&session.resources, session.device_count) {
            triggers.push(trigger);
        }
        triggers
    }

    // The baseline moves to the latest report even when a drop fires, so a
    // slow stepwise decline can stay under both thresholds indefinitely.
    fn device_drop_trigger(&self, node_id: &str, current: u32) -> Option<Trigger> {
        let previous = {
            let mut baselines = self.lock_baselines();
            baselines.insert(node_id.to_owned(), current)
        }?;
        if previous == 0 || current >= previous {
            return None;
        }
        let drop_pct = u64::from(previous - current) * 100 / u64::from(previous);
        let condition = json!({
            "previous": previous,
            "current": current,
            "drop_percent": drop_pct,
        });
        if drop_pct >= 30 {
            Some(Trigger {
                rule: RULE_DEVICE_DROP_SEVERE.to_owned(),
                condition,
            })
        } else if drop_pct >= 10 {
            Some(Trigger {
                rule: RULE_DEVICE_DROP.to_owned(),
                condition,
            })
        } else {
            None
        }
    }

    pub async fn handle_trigger(&self, node_id: &str, trigger: &Trigger) -> TriggerOutcome {
        let Some(rule) = self.rules.get(&trigger.rule) else {
            warn!(
                "recovery trigger references unknown rule {} node={node_id}",
                trigger.rule
            );
            return TriggerOutcome::UnknownRule;
        };
        let rule = rule.clone();
        if !rule.enabled {
            debug!("recovery rule {} is disabled node={node_id}", rule.name);
            return TriggerOutcome::Disabled;
        }

        let allowed = match &self.store {
            Some(store) => match store.recovery_allowed(&rule, node_id).await {
                Ok(allowed) => allowed,
                Err(error) => {
                    warn!(
                        "recovery gate check failed for {} node={node_id}: {error}",
                        rule.name
                    );
                    true
                }
            },
            None => true,
        };

        if !allowed {
            self.record_event(
                node_id,
                &rule,
                trigger,
                false,
                Some("cooldown or daily limit reached"),
            )
            .await;
            info!(
                "recovery for {} node={node_id} skipped by cooldown or daily limit",
                rule.name
            );
            return TriggerOutcome::Skipped;
        }

        if rule.level == RecoveryLevel::Power {
            self.record_event(
                node_id,
                &rule,
                trigger,
                false,
                Some("power recovery requires manual confirmation"),
            )
            .await;
            warn!(
                "power recovery suggested node={node_id} rule={} condition={}",
                rule.name, trigger.condition
            );
            return TriggerOutcome::AlertOnly;
        }

        let Some(executor) = self.executor.clone() else {
            self.record_event(
                node_id,
                &rule,
                trigger,
                false,
                Some("recovery executor unavailable"),
            )
            .await;
            warn!(
                "recovery executor unavailable, {} for node={node_id} not executed",
                rule.name
            );
            return TriggerOutcome::ExecutorUnavailable;
        };

        let event = self.record_event(node_id, &rule, trigger, true, None).await;
        match executor.execute(&event.event_id, node_id, rule.level).await {
            Ok(()) => {
                info!(
                    "recovery executed node={node_id} rule={} level={}",
                    rule.name,
                    rule.level.as_str()
                );
                TriggerOutcome::Executed
            }
            Err(error) => {
                warn!(
                    "recovery execution failed node={node_id} rule={}: {error}",
                    rule.name
                );
                TriggerOutcome::ExecutorFailed
            }
        }
    }

    async fn record_event(
        &self,
        node_id: &str,
        rule: &RecoveryRule,
        trigger: &Trigger,
        executed: bool,
        skip_reason: Option<&str>,
    ) -> RecoveryEvent {
        let event = RecoveryEvent {
            event_id: format!("rec-{}", Uuid::new_v4()),
            node_id: node_id.to_owned(),
            rule: rule.name.clone(),
            level: rule.level,
            condition: trigger.condition.clone(),
            ts: now_unix_ms(),
            executed,
            skip_reason: skip_reason.map(str::to_owned),
        };
        if let Some(store) = &self.store {
            if let Err(error) = store.record_recovery(&event).await {
                warn!("failed to record recovery event {}: {error}", event.event_id);
            }
        }
        event
    }

    pub async fn tick(&self, sessions: &[NodeSession]) {
        for session in sessions {
            for trigger in self.evaluate(session) {
                let outcome = self.handle_trigger(&session.node_id, &trigger).await;
                debug!(
                    "recovery trigger node={} rule={} outcome={outcome:?}",
                    session.node_id, trigger.rule
                );
            }
        }
    }

    #[must_use]
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

fn input_driver_trigger(resources: &Value) -> Option<Trigger> {
    let driver = resources.get("input_driver")?;
    let running = driver.get("running").and_then(Value::as_bool)?;
    if running {
        return None;
    }
    Some(Trigger {
        rule: RULE_INPUT_DRIVER_DOWN.to_owned(),
        condition: json!({ "input_driver": driver.clone() }),
    })
}

fn device_bridge_trigger(resources: &Value, device_count: u32) -> Option<Trigger> {
    let bridge = resources.get("device_bridge")?;
    let status = bridge.get("status").and_then(Value::as_str)?;
    if status != "error" {
        return None;
    }
    let attached = bridge
        .get("attached_devices")
        .and_then(Value::as_u64)
        .unwrap_or(u64::from(device_count));
    if attached > 0 {
        return None;
    }
    Some(Trigger {
        rule: RULE_DEVICE_BRIDGE_ERROR.to_owned(),
        condition: json!({ "device_bridge": bridge.clone(), "attached_devices": attached }),
    })
}

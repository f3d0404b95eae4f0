mod engine;
mod executor;
mod rules;

pub use engine::{RecoveryEngine, Trigger, TriggerOutcome};
pub use executor::{HttpExecutor, RecoveryExecutor};
pub use rules::{
    RULE_DEVICE_BRIDGE_ERROR, RULE_DEVICE_DROP, RULE_DEVICE_DROP_SEVERE, RULE_INPUT_DRIVER_DOWN,
    RULE_NODE_POWER_CYCLE, RuleSet,
};

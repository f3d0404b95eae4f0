mod fleet;

pub use fleet::{ActivityRange, FleetGeometry, FleetScheduler, SchedulerConfig};

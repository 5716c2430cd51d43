pub mod config;
pub mod controller;

pub use config::{HealthThresholds, RollbackConfig, RollbackConfigUpdate};
pub use controller::{
    EnvironmentSnapshot, HealthMetrics, HostSignals, MonitorState, RollbackController,
    RollbackEvent, RollbackPoint,
};

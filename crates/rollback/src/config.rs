use serde::{Deserialize, Serialize};

/// Breach limits evaluated over the monitoring window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Errors / total requests above this triggers a rollback.
    pub error_rate: f64,
    /// Mean response time above this (milliseconds) triggers a rollback.
    pub response_time_ms: f64,
    /// Availability below this triggers a rollback.
    pub availability_target: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.05,
            response_time_ms: 2000.0,
            availability_target: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub auto_rollback_enabled: bool,
    pub thresholds: HealthThresholds,
    pub monitoring_window_secs: u64,
    /// Minimum gap between two automatic rollback attempts.
    pub cooldown_secs: u64,
    /// Best-effort pause after the quiesce broadcast before restoring.
    pub quiesce_grace_ms: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            auto_rollback_enabled: false,
            thresholds: HealthThresholds::default(),
            monitoring_window_secs: 300,
            cooldown_secs: 1800,
            quiesce_grace_ms: 2000,
        }
    }
}

/// Partial config update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RollbackConfigUpdate {
    pub auto_rollback_enabled: Option<bool>,
    pub thresholds: Option<HealthThresholds>,
    pub monitoring_window_secs: Option<u64>,
    pub cooldown_secs: Option<u64>,
    pub quiesce_grace_ms: Option<u64>,
}

impl RollbackConfig {
    pub fn apply(&mut self, update: RollbackConfigUpdate) {
        if let Some(enabled) = update.auto_rollback_enabled {
            self.auto_rollback_enabled = enabled;
        }
        if let Some(thresholds) = update.thresholds {
            self.thresholds = thresholds;
        }
        if let Some(window) = update.monitoring_window_secs {
            self.monitoring_window_secs = window;
        }
        if let Some(cooldown) = update.cooldown_secs {
            self.cooldown_secs = cooldown;
        }
        if let Some(grace) = update.quiesce_grace_ms {
            self.quiesce_grace_ms = grace;
        }
    }
}

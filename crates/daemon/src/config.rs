use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveTime, Weekday};
use serde::Deserialize;
use taskvault_core::BackupKind;
use taskvault_rollback::RollbackConfig;
use taskvault_scheduler::Schedule;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub rollback: RollbackSection,
    pub security: SecurityConfig,
    #[serde(rename = "schedule")]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub root: Option<String>,
    pub chunk_size: Option<usize>,
    pub max_backups: Option<usize>,
    pub retention_days: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RollbackSection {
    pub environment: Option<String>,
    /// Initial rollback config, used until one is persisted via the API.
    pub config: Option<RollbackConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_token: Option<String>,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    pub id: String,
    pub kind: BackupKind,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Wall-clock fire time, "HH:MM" (UTC).
    pub time: Option<String>,
    /// Weekday name, e.g. "mon" or "monday".
    pub day_of_week: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_interval_secs() -> u64 {
    86_400
}

fn default_true() -> bool {
    true
}

impl ScheduleConfig {
    pub fn to_schedule(&self) -> Result<Schedule> {
        let time = self
            .time
            .as_deref()
            .map(|raw| {
                NaiveTime::parse_from_str(raw, "%H:%M")
                    .with_context(|| format!("schedule {}: invalid time {raw:?}", self.id))
            })
            .transpose()?;
        let day_of_week = self
            .day_of_week
            .as_deref()
            .map(|raw| {
                Weekday::from_str(raw)
                    .map_err(|_| anyhow::anyhow!("schedule {}: invalid weekday {raw:?}", self.id))
            })
            .transpose()?;
        Ok(Schedule {
            id: self.id.clone(),
            kind: self.kind,
            interval: Duration::from_secs(self.interval_secs),
            time,
            day_of_week,
            enabled: self.enabled,
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

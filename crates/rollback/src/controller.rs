use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use taskvault_core::{BackupKind, EngineError, Result, Table};
use taskvault_storage::kv::{get_json, put_json, KvStore};
use taskvault_storage::{FlagStore, RowStore, SnapshotStore};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{RollbackConfig, RollbackConfigUpdate};

const POINTS_KEY: &str = "rollback_points";
const CONFIG_KEY: &str = "rollback_config";

/// Cadence of the monitoring tick, clamped to the configured window.
const CHECK_INTERVAL: StdDuration = StdDuration::from_secs(15);

/// Host-application state captured alongside a rollback point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub user_count: u64,
    pub data_count: u64,
    pub schema_version: i64,
    pub environment: String,
}

/// A labeled, restorable checkpoint: a full backup plus the feature-flag
/// state and environment metadata taken at the same instant. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub version: String,
    pub description: String,
    pub backup_id: Uuid,
    pub feature_flags: BTreeMap<String, bool>,
    pub environment: EnvironmentSnapshot,
}

/// Fire-and-forget signals to the host application. No acknowledgment
/// contract: the quiesce pause is a best-effort delay, not a confirmed
/// quiescent state.
pub trait HostSignals: Send + Sync {
    fn pause_writes(&self);
    fn clear_caches(&self);
    fn request_restart(&self);
}

#[derive(Debug, Clone)]
pub enum RollbackEvent {
    ThresholdBreached {
        metric: &'static str,
        value: f64,
        threshold: f64,
    },
    CooldownSuppressed {
        remaining: StdDuration,
    },
    RollbackStarted {
        point_id: Uuid,
        automatic: bool,
    },
    RollbackCompleted {
        point_id: Uuid,
        automatic: bool,
    },
    RollbackFailed {
        point_id: Uuid,
        automatic: bool,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Stopped,
    Monitoring,
    RollingBack,
}

/// Live health figures computed over the current monitoring window.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub availability: f64,
    pub window_started: DateTime<Utc>,
}

#[derive(Debug)]
struct Counters {
    window_started: DateTime<Utc>,
    errors: u64,
    total: u64,
    response_ms_sum: f64,
    downtime: StdDuration,
}

impl Counters {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_started: now,
            errors: 0,
            total: 0,
            response_ms_sum: 0.0,
            downtime: StdDuration::ZERO,
        }
    }

    fn metrics(&self, now: DateTime<Utc>) -> HealthMetrics {
        let elapsed = (now - self.window_started)
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        let availability = if elapsed > StdDuration::ZERO {
            (1.0 - self.downtime.as_secs_f64() / elapsed.as_secs_f64()).clamp(0.0, 1.0)
        } else {
            1.0
        };
        HealthMetrics {
            total_requests: self.total,
            error_count: self.errors,
            error_rate: if self.total > 0 {
                self.errors as f64 / self.total as f64
            } else {
                0.0
            },
            avg_response_time_ms: if self.total > 0 {
                self.response_ms_sum / self.total as f64
            } else {
                0.0
            },
            availability,
            window_started: self.window_started,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wraps the snapshot store to create labeled rollback points, watch live
/// health metrics pushed by the host, and revert to the most recent point
/// when thresholds are breached and the cooldown has elapsed.
pub struct RollbackController {
    /// Handed to the monitoring task so it never keeps the controller alive.
    weak: Weak<RollbackController>,
    snapshots: Arc<SnapshotStore>,
    kv: Arc<dyn KvStore>,
    rows: Arc<dyn RowStore>,
    flags: Arc<dyn FlagStore>,
    host: Arc<dyn HostSignals>,
    environment: String,
    config: Mutex<RollbackConfig>,
    counters: Mutex<Counters>,
    last_auto_rollback: Mutex<Option<DateTime<Utc>>>,
    rolling_back: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<RollbackEvent>,
}

/// Marks the controller as rolling back for the guard's lifetime.
struct RollingBackGuard<'a>(&'a AtomicBool);

impl<'a> RollingBackGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for RollingBackGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RollbackController {
    /// Loads persisted config (falling back to `fallback`) and starts
    /// monitoring when automatic rollback is already enabled.
    pub async fn open(
        snapshots: Arc<SnapshotStore>,
        kv: Arc<dyn KvStore>,
        rows: Arc<dyn RowStore>,
        flags: Arc<dyn FlagStore>,
        host: Arc<dyn HostSignals>,
        environment: String,
        fallback: RollbackConfig,
    ) -> Result<Arc<Self>> {
        let config: RollbackConfig = get_json(kv.as_ref(), CONFIG_KEY)
            .await?
            .unwrap_or(fallback);
        let (events, _) = broadcast::channel(64);
        let controller = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            snapshots,
            kv,
            rows,
            flags,
            host,
            environment,
            config: Mutex::new(config.clone()),
            counters: Mutex::new(Counters::new(Utc::now())),
            last_auto_rollback: Mutex::new(None),
            rolling_back: AtomicBool::new(false),
            monitor: Mutex::new(None),
            events,
        });
        if config.auto_rollback_enabled {
            controller.start_monitoring();
        }
        Ok(controller)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RollbackEvent> {
        self.events.subscribe()
    }

    /// Takes a full backup (never incremental), snapshots every feature
    /// flag, captures environment metadata, and registers the point.
    pub async fn create_rollback_point(&self, description: &str) -> Result<RollbackPoint> {
        let backup_id = self.snapshots.perform_backup(BackupKind::Full).await?;
        let feature_flags = self
            .flags
            .all_flags()
            .await?
            .into_iter()
            .map(|f| (f.key, f.enabled))
            .collect();
        let environment = EnvironmentSnapshot {
            user_count: self.rows.count(Table::Users).await?,
            data_count: self.rows.count(Table::Issues).await?,
            schema_version: self.rows.schema_version().await?,
            environment: self.environment.clone(),
        };
        let point = RollbackPoint {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            version: self.snapshots.app_version().to_owned(),
            description: description.to_owned(),
            backup_id,
            feature_flags,
            environment,
        };

        let mut points = self.load_points().await?;
        points.insert(0, point.clone());
        self.save_points(&points).await?;
        info!(point_id = %point.id, backup_id = %backup_id, "rollback point created");
        Ok(point)
    }

    /// Registered points, newest first.
    pub async fn rollback_points(&self) -> Result<Vec<RollbackPoint>> {
        let mut points = self.load_points().await?;
        points.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(points)
    }

    /// Removes a point from the registry. Its backup stays subject to the
    /// snapshot store's retention policy. Unknown ids are a no-op.
    pub async fn delete_rollback_point(&self, point_id: Uuid) -> Result<()> {
        let mut points = self.load_points().await?;
        points.retain(|p| p.id != point_id);
        self.save_points(&points).await
    }

    /// Reverts the system to `point_id`: quiesce broadcast and grace pause,
    /// restore the backup, reapply the flag snapshot, clear caches, then ask
    /// the host to restart. An error while restoring or reapplying flags
    /// aborts the remaining steps and propagates; there is no automatic
    /// rollback of a failed rollback.
    pub async fn rollback_to(&self, point_id: Uuid) -> Result<()> {
        let point = self
            .find_point(point_id)
            .await?
            .ok_or(EngineError::RollbackPointNotFound(point_id))?;
        self.execute_rollback(&point, false).await
    }

    /// Dry validation: the point's backup must still be listed in the
    /// snapshot index. Performs no restore.
    pub async fn verify_point(&self, point_id: Uuid) -> Result<bool> {
        let point = self
            .find_point(point_id)
            .await?
            .ok_or(EngineError::RollbackPointNotFound(point_id))?;
        let listed = self.snapshots.list_backups().await?;
        Ok(listed.iter().any(|e| e.id == point.backup_id))
    }

    // --- live health accounting, pushed by the host ---

    pub fn record_request(&self, success: bool, response_time_ms: f64) {
        let mut counters = lock(&self.counters);
        counters.total += 1;
        if !success {
            counters.errors += 1;
        }
        counters.response_ms_sum += response_time_ms;
    }

    pub fn record_downtime(&self, duration: StdDuration) {
        lock(&self.counters).downtime += duration;
    }

    pub fn metrics(&self) -> HealthMetrics {
        lock(&self.counters).metrics(Utc::now())
    }

    pub fn state(&self) -> MonitorState {
        if self.rolling_back.load(Ordering::Acquire) {
            MonitorState::RollingBack
        } else if lock(&self.monitor).is_some() {
            MonitorState::Monitoring
        } else {
            MonitorState::Stopped
        }
    }

    pub fn config(&self) -> RollbackConfig {
        lock(&self.config).clone()
    }

    /// Applies a partial update, persists the result, and starts or stops
    /// monitoring as `auto_rollback_enabled` flips.
    pub async fn update_config(&self, update: RollbackConfigUpdate) -> Result<RollbackConfig> {
        let (config, was_enabled) = {
            let mut current = lock(&self.config);
            let was_enabled = current.auto_rollback_enabled;
            current.apply(update);
            (current.clone(), was_enabled)
        };
        put_json(self.kv.as_ref(), CONFIG_KEY, &config).await?;

        if config.auto_rollback_enabled && !was_enabled {
            self.start_monitoring();
        } else if !config.auto_rollback_enabled && was_enabled {
            self.stop_monitoring();
        }
        Ok(config)
    }

    /// Arms the periodic health evaluation. Idempotent.
    pub fn start_monitoring(&self) {
        let mut monitor = lock(&self.monitor);
        if monitor.is_some() {
            return;
        }
        let period = CHECK_INTERVAL.min(StdDuration::from_secs(
            lock(&self.config).monitoring_window_secs.max(1),
        ));
        let weak = self.weak.clone();
        *monitor = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                // evaluation failures are reported, never fatal to the loop
                if let Err(e) = controller.check_thresholds().await {
                    warn!(error = %e, "health evaluation failed");
                }
            }
        }));
        info!("rollback monitoring started");
    }

    pub fn stop_monitoring(&self) {
        if let Some(handle) = lock(&self.monitor).take() {
            handle.abort();
            info!("rollback monitoring stopped");
        }
    }

    /// Evaluates the current window against the thresholds and attempts an
    /// automatic rollback to the most recent point when any is breached and
    /// the cooldown has elapsed. Returns whether a rollback was attempted.
    pub async fn check_thresholds(&self) -> Result<bool> {
        let config = self.config();
        if !config.auto_rollback_enabled {
            return Ok(false);
        }

        let now = Utc::now();
        let window = Duration::seconds(config.monitoring_window_secs as i64);
        let metrics = {
            let mut counters = lock(&self.counters);
            let metrics = counters.metrics(now);
            if now - counters.window_started >= window {
                *counters = Counters::new(now);
            }
            metrics
        };

        let breach = if metrics.total_requests > 0
            && metrics.error_rate > config.thresholds.error_rate
        {
            Some(("error_rate", metrics.error_rate, config.thresholds.error_rate))
        } else if metrics.total_requests > 0
            && metrics.avg_response_time_ms > config.thresholds.response_time_ms
        {
            Some((
                "response_time",
                metrics.avg_response_time_ms,
                config.thresholds.response_time_ms,
            ))
        } else if metrics.availability < config.thresholds.availability_target {
            Some((
                "availability",
                metrics.availability,
                config.thresholds.availability_target,
            ))
        } else {
            None
        };

        let Some((metric, value, threshold)) = breach else {
            return Ok(false);
        };
        warn!(metric, value, threshold, "health threshold breached");
        let _ = self.events.send(RollbackEvent::ThresholdBreached {
            metric,
            value,
            threshold,
        });

        let cooldown = Duration::seconds(config.cooldown_secs as i64);
        {
            let last = lock(&self.last_auto_rollback);
            if let Some(previous) = *last {
                let since = now - previous;
                if since < cooldown {
                    let remaining = (cooldown - since).to_std().unwrap_or(StdDuration::ZERO);
                    let _ = self
                        .events
                        .send(RollbackEvent::CooldownSuppressed { remaining });
                    return Ok(false);
                }
            }
        }

        let Some(point) = self.rollback_points().await?.into_iter().next() else {
            warn!("threshold breached but no rollback point exists");
            return Ok(false);
        };

        // The cooldown starts when the attempt starts: a failed attempt
        // still suppresses the next one until it elapses.
        *lock(&self.last_auto_rollback) = Some(now);

        if let Err(e) = self.execute_rollback(&point, true).await {
            error!(point_id = %point.id, error = %e, "automatic rollback failed");
        }
        Ok(true)
    }

    async fn execute_rollback(&self, point: &RollbackPoint, automatic: bool) -> Result<()> {
        let _state = RollingBackGuard::enter(&self.rolling_back);
        let _ = self.events.send(RollbackEvent::RollbackStarted {
            point_id: point.id,
            automatic,
        });
        info!(point_id = %point.id, backup_id = %point.backup_id, automatic, "rollback starting");

        let result = self.rollback_sequence(point).await;
        match &result {
            Ok(()) => {
                info!(point_id = %point.id, "rollback complete");
                let _ = self.events.send(RollbackEvent::RollbackCompleted {
                    point_id: point.id,
                    automatic,
                });
            }
            Err(e) => {
                error!(point_id = %point.id, error = %e, "rollback failed");
                let _ = self.events.send(RollbackEvent::RollbackFailed {
                    point_id: point.id,
                    automatic,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn rollback_sequence(&self, point: &RollbackPoint) -> Result<()> {
        let grace = StdDuration::from_millis(self.config().quiesce_grace_ms);
        self.host.pause_writes();
        tokio::time::sleep(grace).await;

        self.snapshots.restore_backup(point.backup_id).await?;

        for (key, enabled) in &point.feature_flags {
            self.flags.set_enabled(key, *enabled).await?;
        }

        self.host.clear_caches();
        self.host.request_restart();
        Ok(())
    }

    async fn find_point(&self, point_id: Uuid) -> Result<Option<RollbackPoint>> {
        Ok(self
            .load_points()
            .await?
            .into_iter()
            .find(|p| p.id == point_id))
    }

    async fn load_points(&self) -> Result<Vec<RollbackPoint>> {
        Ok(get_json(self.kv.as_ref(), POINTS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save_points(&self, points: &[RollbackPoint]) -> Result<()> {
        Ok(put_json(self.kv.as_ref(), POINTS_KEY, &points).await?)
    }
}

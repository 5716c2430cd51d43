use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use taskvault_core::BackupKind;
use taskvault_storage::SnapshotStore;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A named recurring backup policy.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: String,
    pub kind: BackupKind,
    /// Used when no wall-clock `time` is set: next run = now + interval.
    pub interval: StdDuration,
    /// Wall-clock time of day (UTC) the schedule should fire at.
    pub time: Option<NaiveTime>,
    /// Restricts a `time`-based schedule to one weekday.
    pub day_of_week: Option<Weekday>,
    pub enabled: bool,
}

/// Completion report for one scheduled run, emitted whether the backup
/// succeeded or failed.
#[derive(Debug, Clone)]
pub struct ScheduleEvent {
    pub schedule_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub backup_id: Option<Uuid>,
}

/// Next fire instant for `schedule`, relative to `now`. With a wall-clock
/// `time`, the next occurrence today or tomorrow; a `day_of_week` advances
/// further to the next matching weekday (at least one full day ahead when
/// today's slot has already passed).
pub fn calculate_next_run(schedule: &Schedule, now: DateTime<Utc>) -> DateTime<Utc> {
    match schedule.time {
        Some(time) => {
            let mut candidate = now.date_naive().and_time(time).and_utc();
            if candidate <= now {
                candidate += Duration::days(1);
            }
            if let Some(day) = schedule.day_of_week {
                while candidate.weekday() != day {
                    candidate += Duration::days(1);
                }
            }
            candidate
        }
        None => now + Duration::from_std(schedule.interval).unwrap_or_else(|_| Duration::days(365)),
    }
}

struct Entry {
    schedule: Schedule,
    handle: Option<JoinHandle<()>>,
}

/// Runs named schedules against the snapshot store. Each enabled schedule
/// owns one self-rescheduling task: sleep until the computed instant, run
/// the backup, enforce retention, emit a completion event, re-arm. Disabling
/// a schedule cancels its pending task without disturbing the others.
pub struct ScheduleRunner {
    store: Arc<SnapshotStore>,
    entries: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<ScheduleEvent>,
}

impl ScheduleRunner {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.events.subscribe()
    }

    /// Registers (or replaces) a schedule, arming it when enabled.
    pub async fn add_schedule(&self, schedule: Schedule) {
        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.remove(&schedule.id) {
            abort_entry(old);
        }
        let handle = schedule.enabled.then(|| self.arm(schedule.clone()));
        info!(schedule = %schedule.id, enabled = schedule.enabled, "schedule registered");
        entries.insert(schedule.id.clone(), Entry { schedule, handle });
    }

    pub async fn remove_schedule(&self, id: &str) {
        if let Some(entry) = self.entries.lock().await.remove(id) {
            abort_entry(entry);
        }
    }

    /// Disabling cancels the pending task; re-enabling computes a fresh next
    /// run and arms a new one.
    pub async fn set_enabled(&self, id: &str, enabled: bool) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
            }
            entry.schedule.enabled = enabled;
            if enabled {
                entry.handle = Some(self.arm(entry.schedule.clone()));
            }
        }
    }

    pub async fn schedules(&self) -> Vec<Schedule> {
        self.entries
            .lock()
            .await
            .values()
            .map(|e| e.schedule.clone())
            .collect()
    }

    /// Cancels every pending task and clears all schedules.
    pub async fn destroy(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            abort_entry(entry);
        }
    }

    fn arm(&self, schedule: Schedule) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = calculate_next_run(&schedule, now);
                let delay = (next - now).to_std().unwrap_or(StdDuration::ZERO);
                tokio::time::sleep(delay).await;
                run_scheduled(&store, &events, &schedule).await;
            }
        })
    }
}

/// One scheduled fire. Failures are reported through the event channel and
/// never propagate into the scheduling loop.
async fn run_scheduled(
    store: &SnapshotStore,
    events: &broadcast::Sender<ScheduleEvent>,
    schedule: &Schedule,
) {
    let timestamp = Utc::now();
    let event = match store.perform_backup(schedule.kind).await {
        Ok(backup_id) => {
            info!(schedule = %schedule.id, backup_id = %backup_id, "scheduled backup created");
            if let Err(e) = store.clean_old_backups().await {
                warn!(schedule = %schedule.id, error = %e, "retention cleanup failed");
            }
            ScheduleEvent {
                schedule_id: schedule.id.clone(),
                success: true,
                error: None,
                timestamp,
                backup_id: Some(backup_id),
            }
        }
        Err(e) => {
            error!(schedule = %schedule.id, error = %e, "scheduled backup failed");
            ScheduleEvent {
                schedule_id: schedule.id.clone(),
                success: false,
                error: Some(e.to_string()),
                timestamp,
                backup_id: None,
            }
        }
    };
    let _ = events.send(event);
}

fn abort_entry(entry: Entry) {
    if let Some(handle) = entry.handle {
        handle.abort();
    }
}

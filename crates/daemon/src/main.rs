use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use taskvault_core::BackupKind;
use taskvault_daemon::config::{self, Config};
use taskvault_daemon::{build_router, AppState, LoggingHostSignals};
use taskvault_rollback::{RollbackController, RollbackEvent};
use taskvault_scheduler::ScheduleRunner;
use taskvault_storage::{
    KvFlagStore, RetentionPolicy, SnapshotOptions, SnapshotStore, SqliteKvStore, SqliteRowStore,
};
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let (cfg, mode) = parse_args()?;

    let root = env::var("TASKVAULT_ROOT")
        .ok()
        .or_else(|| cfg.storage.root.clone())
        .unwrap_or_else(|| "./data".to_owned());

    let listen = env::var("TASKVAULT_LISTEN")
        .ok()
        .or_else(|| cfg.server.listen.clone())
        .unwrap_or_else(|| "127.0.0.1:8090".to_owned());

    let root = PathBuf::from(root);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create data directory {}", root.display()))?;

    let kv = Arc::new(SqliteKvStore::new(root.join("vault.db"))?);
    let rows = Arc::new(SqliteRowStore::new(root.join("rows.db"))?);

    let options = SnapshotOptions {
        chunk_size: cfg
            .storage
            .chunk_size
            .unwrap_or(taskvault_core::chunk::DEFAULT_CHUNK_SIZE),
        retention: RetentionPolicy {
            max_backups: cfg.storage.max_backups.unwrap_or(10),
            retention_days: cfg.storage.retention_days.unwrap_or(7),
        },
        app_version: env!("CARGO_PKG_VERSION").to_owned(),
    };
    let snapshots = Arc::new(SnapshotStore::open(kv.clone(), rows.clone(), options).await?);

    match mode.as_deref() {
        Some("backup-once") => {
            let id = snapshots.perform_backup(BackupKind::Full).await?;
            let removed = snapshots.clean_old_backups().await?;
            info!(backup_id = %id, pruned = removed.len(), "one-shot backup complete");
            Ok(())
        }
        None | Some("serve") => run_service(cfg, snapshots, kv, rows, &listen).await,
        Some(other) => bail!("unknown mode: {other} (expected `serve` or `backup-once`)"),
    }
}

/// Parse CLI args, returning the loaded config and optional subcommand.
fn parse_args() -> Result<(Config, Option<String>)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut mode: Option<String> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other => {
                mode = Some(other.to_owned());
            }
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, mode))
}

async fn run_service(
    cfg: Config,
    snapshots: Arc<SnapshotStore>,
    kv: Arc<SqliteKvStore>,
    rows: Arc<SqliteRowStore>,
    listen: &str,
) -> Result<()> {
    let flags = Arc::new(KvFlagStore::new(kv.clone()));
    let environment = cfg
        .rollback
        .environment
        .clone()
        .unwrap_or_else(|| "local".to_owned());
    let controller = RollbackController::open(
        snapshots.clone(),
        kv,
        rows,
        flags,
        Arc::new(LoggingHostSignals),
        environment,
        cfg.rollback.config.clone().unwrap_or_default(),
    )
    .await?;

    let runner = Arc::new(ScheduleRunner::new(snapshots.clone()));
    for schedule in &cfg.schedules {
        runner.add_schedule(schedule.to_schedule()?).await;
    }

    tokio::spawn(log_schedule_events(runner.subscribe()));
    tokio::spawn(log_rollback_events(controller.subscribe()));

    let state = AppState {
        snapshots,
        controller,
        runner,
        api_token: env::var("TASKVAULT_API_TOKEN")
            .ok()
            .or_else(|| cfg.security.api_token.clone()),
        csrf_token: env::var("TASKVAULT_CSRF_TOKEN")
            .ok()
            .or_else(|| cfg.security.csrf_token.clone()),
    };

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address: {listen}"))?;
    let app = build_router(state);

    info!(%addr, "starting taskvault daemon");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn log_schedule_events(
    mut events: tokio::sync::broadcast::Receiver<taskvault_scheduler::ScheduleEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.success => {
                info!(schedule = %event.schedule_id, backup_id = ?event.backup_id, "schedule completed")
            }
            Ok(event) => {
                error!(schedule = %event.schedule_id, error = ?event.error, "schedule failed")
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "schedule event stream lagged")
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_rollback_events(mut events: tokio::sync::broadcast::Receiver<RollbackEvent>) {
    loop {
        match events.recv().await {
            Ok(RollbackEvent::ThresholdBreached {
                metric,
                value,
                threshold,
            }) => warn!(metric, value, threshold, "health threshold breached"),
            Ok(RollbackEvent::CooldownSuppressed { remaining }) => {
                warn!(?remaining, "automatic rollback suppressed by cooldown")
            }
            Ok(RollbackEvent::RollbackStarted { point_id, automatic }) => {
                warn!(%point_id, automatic, "rollback started")
            }
            Ok(RollbackEvent::RollbackCompleted { point_id, automatic }) => {
                info!(%point_id, automatic, "rollback completed")
            }
            Ok(RollbackEvent::RollbackFailed {
                point_id,
                automatic,
                error,
            }) => error!(%point_id, automatic, %error, "rollback failed"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "rollback event stream lagged")
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

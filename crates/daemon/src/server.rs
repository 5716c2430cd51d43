use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use taskvault_core::{BackupIndexEntry, BackupKind, BackupRecord, EngineError};
use taskvault_rollback::{
    HealthMetrics, MonitorState, RollbackConfig, RollbackConfigUpdate, RollbackController,
    RollbackPoint,
};
use taskvault_scheduler::ScheduleRunner;
use taskvault_storage::SnapshotStore;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub snapshots: Arc<SnapshotStore>,
    pub controller: Arc<RollbackController>,
    pub runner: Arc<ScheduleRunner>,
    pub api_token: Option<String>,
    pub csrf_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/backups", get(list_backups).post(trigger_backup))
        .route(
            "/api/v1/backups/{id}",
            get(backup_detail).delete(delete_backup),
        )
        .route("/api/v1/backups/{id}/restore", post(restore_backup))
        .route("/api/v1/backups/{id}/export", get(export_backup))
        .route(
            "/api/v1/rollback/points",
            get(list_points).post(create_point),
        )
        .route("/api/v1/rollback/points/{id}", axum::routing::delete(delete_point))
        .route("/api/v1/rollback/points/{id}/rollback", post(rollback_point))
        .route("/api/v1/rollback/points/{id}/verify", post(verify_point))
        .route(
            "/api/v1/rollback/config",
            get(get_rollback_config).put(put_rollback_config),
        )
        .route("/api/v1/rollback/metrics", get(rollback_metrics))
        .route("/api/v1/health/samples", post(ingest_sample))
        .route("/api/v1/schedules", get(list_schedules))
        .route("/api/v1/schedules/{id}", put(update_schedule))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn require_csrf(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    if let Some(expected) = &state.csrf_token {
        let provided = headers
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != expected {
            return Err(StatusCode::FORBIDDEN);
        }
    }
    Ok(())
}

fn engine_status(err: EngineError) -> StatusCode {
    match err {
        EngineError::BackupInProgress => StatusCode::CONFLICT,
        EngineError::BackupNotFound(_) | EngineError::RollbackPointNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        EngineError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_id(raw: &str) -> Result<Uuid, StatusCode> {
    Uuid::parse_str(raw).map_err(|_| StatusCode::BAD_REQUEST)
}

// --- backups ---

async fn list_backups(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<BackupIndexEntry>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let entries = state.snapshots.list_backups().await.map_err(engine_status)?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct TriggerBackupRequest {
    kind: BackupKind,
}

async fn trigger_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TriggerBackupRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = state
        .snapshots
        .perform_backup(request.kind)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!({ "backup_id": id })))
}

async fn backup_detail(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BackupRecord>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let record = state
        .snapshots
        .get_backup(id)
        .await
        .map_err(engine_status)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(record))
}

async fn delete_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    state
        .snapshots
        .delete_backup(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn restore_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    require_csrf(&state, &headers)?;
    let id = parse_id(&id)?;
    state
        .snapshots
        .restore_backup(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!({ "restored": id })))
}

async fn export_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let chunks = state
        .snapshots
        .backup_chunks(id)
        .await
        .map_err(engine_status)?;

    // Build tar archive, one JSON file per chunk
    let mut tar_data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_data);
        for chunk in &chunks {
            let bytes = serde_json::to_vec_pretty(chunk)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            let mut hdr = tar::Header::new_gnu();
            hdr.set_size(bytes.len() as u64);
            hdr.set_mode(0o644);
            hdr.set_cksum();
            builder
                .append_data(&mut hdr, format!("chunk_{}.json", chunk.seq), Cursor::new(bytes))
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }
        builder
            .finish()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    }

    // Compress with zstd
    let compressed = zstd::encode_all(Cursor::new(&tar_data), 3)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut response = compressed.into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "application/zstd".parse().unwrap());
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=backup-{id}.tar.zst")
            .parse()
            .unwrap(),
    );
    Ok(response)
}

// --- rollback points ---

async fn list_points(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<RollbackPoint>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let points = state
        .controller
        .rollback_points()
        .await
        .map_err(engine_status)?;
    Ok(Json(points))
}

#[derive(Debug, Deserialize)]
struct CreatePointRequest {
    description: String,
}

async fn create_point(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreatePointRequest>,
) -> Result<Json<RollbackPoint>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let point = state
        .controller
        .create_rollback_point(&request.description)
        .await
        .map_err(engine_status)?;
    Ok(Json(point))
}

async fn delete_point(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    state
        .controller
        .delete_rollback_point(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn rollback_point(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    require_csrf(&state, &headers)?;
    let id = parse_id(&id)?;
    state
        .controller
        .rollback_to(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(serde_json::json!({ "rolled_back_to": id })))
}

async fn verify_point(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let backup_present = state
        .controller
        .verify_point(id)
        .await
        .map_err(engine_status)?;
    Ok(Json(
        serde_json::json!({ "point_id": id, "backup_present": backup_present }),
    ))
}

// --- rollback config & health ---

async fn get_rollback_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RollbackConfig>, StatusCode> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.controller.config()))
}

async fn put_rollback_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<RollbackConfigUpdate>,
) -> Result<Json<RollbackConfig>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let config = state
        .controller
        .update_config(update)
        .await
        .map_err(engine_status)?;
    Ok(Json(config))
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    state: MonitorState,
    metrics: HealthMetrics,
    last_backup_at: Option<chrono::DateTime<chrono::Utc>>,
}

async fn rollback_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsResponse>, StatusCode> {
    require_api_auth(&state, &headers)?;
    Ok(Json(MetricsResponse {
        state: state.controller.state(),
        metrics: state.controller.metrics(),
        last_backup_at: state.snapshots.last_backup_at(),
    }))
}

/// One pushed health sample: a request outcome, downtime, or both.
#[derive(Debug, Deserialize)]
struct SampleRequest {
    success: Option<bool>,
    #[serde(default)]
    response_time_ms: f64,
    downtime_ms: Option<u64>,
}

async fn ingest_sample(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(sample): Json<SampleRequest>,
) -> Result<StatusCode, StatusCode> {
    require_api_auth(&state, &headers)?;
    if let Some(success) = sample.success {
        state
            .controller
            .record_request(success, sample.response_time_ms);
    }
    if let Some(downtime_ms) = sample.downtime_ms {
        state
            .controller
            .record_downtime(Duration::from_millis(downtime_ms));
    }
    Ok(StatusCode::NO_CONTENT)
}

// --- schedules ---

#[derive(Debug, Serialize)]
struct ScheduleView {
    id: String,
    kind: BackupKind,
    interval_secs: u64,
    time: Option<String>,
    day_of_week: Option<String>,
    enabled: bool,
}

async fn list_schedules(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ScheduleView>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let schedules = state
        .runner
        .schedules()
        .await
        .into_iter()
        .map(|s| ScheduleView {
            id: s.id,
            kind: s.kind,
            interval_secs: s.interval.as_secs(),
            time: s.time.map(|t| t.format("%H:%M").to_string()),
            day_of_week: s.day_of_week.map(|d| d.to_string()),
            enabled: s.enabled,
        })
        .collect();
    Ok(Json(schedules))
}

#[derive(Debug, Deserialize)]
struct UpdateScheduleRequest {
    enabled: bool,
}

async fn update_schedule(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateScheduleRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let known = state.runner.schedules().await.iter().any(|s| s.id == id);
    if !known {
        return Err(StatusCode::NOT_FOUND);
    }
    state.runner.set_enabled(&id, request.enabled).await;
    Ok(Json(
        serde_json::json!({ "id": id, "enabled": request.enabled }),
    ))
}

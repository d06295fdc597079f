/**
 * API REST VEILLEUR - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Expose l'API sécurisée du kernel pour le dashboard et les outils admin.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key (header x-api-key)
 * - Routes : /health, /devices, /scheduler, /maintenance
 * - Les mots de passe SSH ne sortent jamais de l'API (vue dédiée)
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - VEILLEUR_API_KEY vide = API fermée (fail-closed)
 */
use crate::config::WolConf;
use crate::history::HistoryStore;
use crate::maintenance::MaintenanceService;
use crate::models::{CollectionHistoryEntry, Device, TriggerSource};
use crate::power::PowerController;
use crate::registry::{DeviceRegistry, DeviceSpec};
use crate::scheduler::{MetricsScheduler, SchedulerConfigPatch};
use crate::store::{AdaptiveSeries, EnergySummary, PowerStats, SampleStore, StoreError};
use crate::wol::{wake_device, WolError};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub store: Arc<SampleStore>,
    pub history: Arc<HistoryStore>,
    pub scheduler: MetricsScheduler,
    pub maintenance: MaintenanceService,
    pub power: Arc<PowerController>,
    pub wol_conf: Option<WolConf>,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("VEILLEUR_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("SECURITY: VEILLEUR_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/devices", get(list_devices).post(create_device))
        .route(
            "/devices/{id}",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/devices/{id}/wake", post(wake))
        .route("/devices/{id}/shutdown", post(shutdown_device))
        .route("/devices/{id}/sleep", post(sleep_device))
        .route("/devices/{id}/metrics", get(device_metrics))
        .route("/devices/{id}/metrics/latest", get(device_latest))
        .route("/devices/{id}/energy", get(device_energy))
        .route("/devices/{id}/power-stats", get(device_power_stats))
        .route("/devices/{id}/history", get(device_history))
        .route("/devices/{id}/history/success-rate", get(device_success_rate))
        .route("/scheduler", get(scheduler_status))
        .route("/scheduler/run", post(scheduler_run))
        .route("/scheduler/start", post(scheduler_start))
        .route("/scheduler/stop", post(scheduler_stop))
        .route("/scheduler/config", patch(scheduler_patch_config))
        .route("/maintenance", get(maintenance_status))
        .route("/maintenance/checkpoint", post(maintenance_checkpoint))
        .route("/maintenance/optimize", post(maintenance_optimize))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// ========================
// Vues
// ========================

/// Représentation API d'un appareil : le mot de passe SSH ne sort jamais.
#[derive(Serialize)]
struct DeviceView {
    id: String,
    name: String,
    address: Option<String>,
    mac: Option<String>,
    ssh_user: Option<String>,
    ssh_port: u16,
    eligible: bool,
    power_idle_w: f64,
    power_max_w: f64,
    power_alert_w: Option<f64>,
    created_at: String,
}

fn to_view(d: &Device) -> DeviceView {
    DeviceView {
        id: d.id.clone(),
        name: d.name.clone(),
        address: d.address.clone(),
        mac: d.mac.clone(),
        ssh_user: d.ssh_user.clone(),
        ssh_port: d.ssh_port,
        eligible: d.is_eligible(),
        power_idle_w: d.power_idle_w,
        power_max_w: d.power_max_w,
        power_alert_w: d.power_alert_w,
        created_at: format_ts(d.created_at),
    }
}

fn format_ts(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}

#[derive(Serialize)]
struct SchedulerView {
    running: bool,
    last_run: Option<i64>,
    next_run: Option<i64>,
    total_collections: u64,
    success_count: u64,
    failure_count: u64,
    in_flight: Vec<String>,
    config: SchedulerConfigView,
}

#[derive(Serialize)]
struct SchedulerConfigView {
    enabled: bool,
    interval_secs: u64,
    max_concurrent: usize,
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SinceParams {
    since: i64,
}

fn store_error(e: StoreError) -> StatusCode {
    warn!("store error on API path: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn load_device(app: &AppState, id: &str) -> Result<Device, StatusCode> {
    app.registry
        .get(id)
        .await
        .map_err(store_error)?
        .ok_or(StatusCode::NOT_FOUND)
}

// ========================
// Appareils
// ========================

async fn list_devices(State(app): State<AppState>) -> Result<Json<Vec<DeviceView>>, StatusCode> {
    let devices = app.registry.list().await.map_err(store_error)?;
    Ok(Json(devices.iter().map(to_view).collect()))
}

async fn create_device(
    State(app): State<AppState>,
    Json(spec): Json<DeviceSpec>,
) -> Result<(StatusCode, Json<DeviceView>), StatusCode> {
    let device = app.registry.create(spec).await.map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(to_view(&device))))
}

async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    let device = load_device(&app, &id).await?;
    Ok(Json(to_view(&device)))
}

async fn update_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<DeviceSpec>,
) -> Result<Json<DeviceView>, StatusCode> {
    let updated = app.registry.update(&id, spec).await.map_err(store_error)?;
    match updated {
        Some(device) => Ok(Json(to_view(&device))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn delete_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if app.registry.remove(&id).await.map_err(store_error)? {
        Ok(Json(serde_json::json!({ "status": "deleted" })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// ========================
// Contrôle d'alimentation
// ========================

async fn wake(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let device = load_device(&app, &id).await?;
    match wake_device(&device, app.wol_conf.as_ref()).await {
        Ok(()) => Ok(Json(serde_json::json!({ "ok": true }))),
        Err(WolError::MissingMac(_)) | Err(WolError::InvalidMac(_)) => {
            Err(StatusCode::BAD_REQUEST)
        }
        Err(e) => {
            warn!("wake failed for {id}: {e}");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn shutdown_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let device = load_device(&app, &id).await?;
    match app.power.shutdown(&device).await {
        Ok(()) => Ok(Json(serde_json::json!({ "ok": true }))),
        Err(crate::power::PowerError::NotEligible(_)) => Err(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("shutdown failed for {id}: {e}");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn sleep_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let device = load_device(&app, &id).await?;
    match app.power.sleep(&device).await {
        Ok(()) => Ok(Json(serde_json::json!({ "ok": true }))),
        Err(crate::power::PowerError::NotEligible(_)) => Err(StatusCode::BAD_REQUEST),
        Err(e) => {
            warn!("sleep failed for {id}: {e}");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

// ========================
// Métriques
// ========================

async fn device_metrics(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(range): Query<RangeParams>,
) -> Result<Json<AdaptiveSeries>, StatusCode> {
    if range.end < range.start {
        return Err(StatusCode::BAD_REQUEST);
    }
    let series =
        app.store.adaptive_range(&id, range.start, range.end).await.map_err(store_error)?;
    Ok(Json(series))
}

async fn device_latest(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::MetricsSample>, StatusCode> {
    let latest = app.store.latest(&id).await.map_err(store_error)?;
    latest.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn device_energy(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(range): Query<RangeParams>,
) -> Result<Json<EnergySummary>, StatusCode> {
    if range.end < range.start {
        return Err(StatusCode::BAD_REQUEST);
    }
    let summary =
        app.store.energy_consumption(&id, range.start, range.end).await.map_err(store_error)?;
    Ok(Json(summary))
}

async fn device_power_stats(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(range): Query<RangeParams>,
) -> Result<Json<PowerStats>, StatusCode> {
    if range.end < range.start {
        return Err(StatusCode::BAD_REQUEST);
    }
    let stats = app.store.power_stats(&id, range.start, range.end).await.map_err(store_error)?;
    Ok(Json(stats))
}

async fn device_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<CollectionHistoryEntry>>, StatusCode> {
    let limit = params.limit.unwrap_or(50).min(500);
    let entries = app.history.recent(&id, limit).await.map_err(store_error)?;
    Ok(Json(entries))
}

async fn device_success_rate(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SinceParams>,
) -> Result<Json<crate::history::SuccessRate>, StatusCode> {
    let rate = app.history.success_rate(&id, params.since).await.map_err(store_error)?;
    Ok(Json(rate))
}

// ========================
// Scheduler
// ========================

async fn scheduler_status(State(app): State<AppState>) -> Json<SchedulerView> {
    let state = app.scheduler.state();
    let config = app.scheduler.config();
    Json(SchedulerView {
        running: state.running,
        last_run: state.last_run,
        next_run: state.next_run,
        total_collections: state.total_collections,
        success_count: state.success_count,
        failure_count: state.failure_count,
        in_flight: state.in_flight.into_iter().collect(),
        config: SchedulerConfigView {
            enabled: config.enabled,
            interval_secs: config.interval.as_secs(),
            max_concurrent: config.max_concurrent,
        },
    })
}

/// Déclenche un cycle et rend la main : la garde anti-réentrance absorbe
/// les déclenchements concurrents.
async fn scheduler_run(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let scheduler = app.scheduler.clone();
    tokio::spawn(async move { scheduler.run_now(TriggerSource::Ui).await });
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "triggered": true })))
}

async fn scheduler_start(State(app): State<AppState>) -> Json<serde_json::Value> {
    app.scheduler.start();
    Json(serde_json::json!({ "running": app.scheduler.state().running }))
}

async fn scheduler_stop(State(app): State<AppState>) -> Json<serde_json::Value> {
    app.scheduler.stop();
    Json(serde_json::json!({ "running": false }))
}

async fn scheduler_patch_config(
    State(app): State<AppState>,
    Json(patch): Json<SchedulerConfigPatch>,
) -> Json<serde_json::Value> {
    app.scheduler.update_config(patch);
    let config = app.scheduler.config();
    Json(serde_json::json!({
        "enabled": config.enabled,
        "interval_secs": config.interval.as_secs(),
        "max_concurrent": config.max_concurrent,
    }))
}

// ========================
// Maintenance
// ========================

async fn maintenance_status(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "active": app.maintenance.is_active() }))
}

async fn maintenance_checkpoint(
    State(app): State<AppState>,
) -> Result<Json<crate::store::CheckpointReport>, StatusCode> {
    app.maintenance.trigger_checkpoint().await.map(Json).map_err(store_error)
}

async fn maintenance_optimize(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    app.maintenance.trigger_optimize().await.map_err(store_error)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

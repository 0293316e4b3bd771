//! API Routes

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{analytics_routes, ws_routes};
use crate::auth::{AuthUser, LoginRequest};
use crate::camera_config::{CameraSettingsRequest, CameraSettingsResponse};
use crate::counting::CounterStats;
use crate::error::{Error, Result};
use crate::export;
use crate::models::{ApiResponse, SystemStatus};
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & realtime surfaces (no bearer: consumed by dashboards
        // and probes before login)
        .route("/health", get(super::health_check))
        .route("/ws", get(ws_routes::ws_endpoint))
        .route("/video_feed", get(ws_routes::video_feed))
        // Auth
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        // Camera settings
        .route("/api/camera/settings", get(get_camera_settings))
        .route("/api/camera/settings", post(create_camera_settings))
        .route("/api/camera/settings/{id}", put(update_camera_settings))
        .route("/api/camera/switch", post(switch_camera))
        // System & stats
        .route("/api/system/status", get(system_status))
        .route("/api/stats/current", get(current_stats))
        // Events
        .route("/api/events", get(list_events))
        .route("/api/events/clear", post(clear_events))
        .route("/api/reset", post(reset_counters))
        // Analytics
        .route("/api/analytics/day", get(analytics_routes::day))
        .route("/api/analytics/week", get(analytics_routes::week))
        .route("/api/analytics/month", get(analytics_routes::month))
        .route("/api/analytics/hourly", get(analytics_routes::hourly))
        .route("/api/analytics/daily", get(analytics_routes::daily))
        .route("/api/analytics/monthly", get(analytics_routes::monthly))
        .route(
            "/api/analytics/peak-hour-avg",
            get(analytics_routes::peak_hour_avg),
        )
        .route(
            "/api/analytics/weekday-stats",
            get(analytics_routes::weekday_stats),
        )
        .route("/api/analytics/averages", get(analytics_routes::averages))
        .route(
            "/api/analytics/growth-trend",
            get(analytics_routes::growth_trend),
        )
        .route(
            "/api/analytics/predict-peak",
            get(analytics_routes::predict_peak),
        )
        // Export
        .route("/api/export", post(export_data))
        // Re-ID gallery
        .route("/api/reid/persons", get(list_persons))
        .route("/api/reid/persons/{id}", get(get_person))
        .route("/api/reid/clear", post(clear_gallery))
        .route("/api/reid/cleanup", post(cleanup_gallery))
        .with_state(state)
}

// ========================================
// Auth Handlers
// ========================================

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    let token = state.auth.login(&req.username, &req.password)?;
    Ok(Json(token))
}

async fn me(user: AuthUser) -> impl IntoResponse {
    Json(json!({ "username": user.username }))
}

// ========================================
// Camera Settings Handlers
// ========================================

async fn get_camera_settings(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<impl IntoResponse> {
    match state.settings_repo.get_active().await? {
        Some(settings) => Ok(Json(ApiResponse::success(CameraSettingsResponse::from(
            settings,
        )))),
        None => Err(Error::NotFound("no camera settings configured".to_string())),
    }
}

async fn create_camera_settings(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<CameraSettingsRequest>,
) -> Result<impl IntoResponse> {
    state.config_service.validate(&req)?;
    let settings = state.settings_repo.create(&req).await?;
    let config = state.config_service.worker_config(&settings)?;

    // Settings are saved either way; the response reports whether the new
    // source actually delivered.
    state.worker.reconfigure(config, false).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CameraSettingsResponse::from(settings))),
    ))
}

async fn update_camera_settings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    _user: AuthUser,
    Json(req): Json<CameraSettingsRequest>,
) -> Result<impl IntoResponse> {
    state.config_service.validate(&req)?;
    let settings = state.settings_repo.update(id, &req).await?;
    let config = state.config_service.worker_config(&settings)?;

    state.worker.reconfigure(config, false).await?;

    Ok(Json(ApiResponse::success(CameraSettingsResponse::from(
        settings,
    ))))
}

#[derive(Debug, Deserialize)]
struct CameraSwitchRequest {
    /// `webcam` for the local device stream, `camera` for the configured
    /// IP camera.
    source: String,
}

async fn switch_camera(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<CameraSwitchRequest>,
) -> Result<impl IntoResponse> {
    let Some(mut settings) = state.settings_repo.get_active().await? else {
        return Err(Error::NotFound("no camera settings configured".to_string()));
    };

    match req.source.as_str() {
        "webcam" => {
            settings.source_kind = "device".to_string();
            settings.address = "0".to_string();
        }
        "camera" | "dahua" => {}
        other => {
            return Err(Error::Validation(format!(
                "unknown source '{other}', expected webcam or camera"
            )))
        }
    }

    let config = state.config_service.worker_config(&settings)?;
    match state.worker.reconfigure(config, false).await {
        Ok(()) => Ok(Json(json!({
            "success": true,
            "message": format!("switched to {}", req.source)
        }))),
        Err(e) => {
            tracing::warn!(source = %req.source, error = %e, "Camera switch failed, previous source kept");
            Ok(Json(json!({
                "success": false,
                "message": format!("could not switch to {}: {e}", req.source)
            })))
        }
    }
}

// ========================================
// System Handlers
// ========================================

async fn system_status(State(state): State<AppState>, _user: AuthUser) -> impl IntoResponse {
    let status = state.worker.status();
    Json(SystemStatus {
        camera_online: super::camera_online(status.camera_status),
        fps: status.fps,
        active_tracks: status.active_tracks,
        model_loaded: status.model_loaded,
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
        config_id: status.config_id,
        dropped_store_writes: status.dropped_store_writes,
        ws_connections: state.hub.connection_count(),
    })
}

async fn current_stats(State(state): State<AppState>, _user: AuthUser) -> impl IntoResponse {
    Json(state.worker.status())
}

// ========================================
// Event Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct EventQuery {
    limit: Option<i64>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

async fn list_events(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<EventQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);

    let events = match (query.start_date, query.end_date) {
        (Some(start), Some(end)) => {
            let mut events = state.store.range(start, end).await?;
            events.reverse();
            events.truncate(limit as usize);
            events
        }
        _ => state.store.recent(limit).await?,
    };

    Ok(Json(ApiResponse::success(events)))
}

async fn clear_events(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<impl IntoResponse> {
    let deleted = state.store.clear_all().await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("{deleted} events cleared")
    })))
}

#[derive(Debug, Deserialize, Default)]
struct ResetQuery {
    #[serde(default)]
    clear_gallery: bool,
}

async fn reset_counters(
    State(state): State<AppState>,
    _user: AuthUser,
    query: Query<ResetQuery>,
) -> Result<impl IntoResponse> {
    let clear_gallery = query.clear_gallery;
    let stats: CounterStats = state.worker.reset(clear_gallery).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Counters reset successfully",
        "new_stats": stats
    })))
}

// ========================================
// Export Handler
// ========================================

async fn export_data(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<export::ExportRequest>,
) -> Result<impl IntoResponse> {
    if req.format != "csv" {
        return Err(Error::Validation(format!(
            "format '{}' is produced by the external report generator; this endpoint serves csv",
            req.format
        )));
    }

    let start = req.start_date.unwrap_or(DateTime::UNIX_EPOCH);
    let end = req.end_date.unwrap_or_else(Utc::now);
    let events = state.store.range(start, end).await?;
    let (in_count, out_count) = events.iter().fold((0, 0), |(i, o), e| match e.direction {
        crate::counting::Direction::In => (i + 1, o),
        crate::counting::Direction::Out => (i, o + 1),
    });

    let body = export::to_csv(&events, in_count, out_count);
    let filename = export::csv_filename(Utc::now());

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    ))
}

// ========================================
// Re-ID Gallery Handlers
// ========================================

async fn list_persons(State(state): State<AppState>, _user: AuthUser) -> Result<impl IntoResponse> {
    let persons = state.worker.gallery_summaries().await?;
    Ok(Json(ApiResponse::success(persons)))
}

async fn get_person(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _user: AuthUser,
) -> Result<impl IntoResponse> {
    match state.worker.gallery_person(id.clone()).await? {
        Some(person) => Ok(Json(ApiResponse::success(person))),
        None => Err(Error::NotFound(format!("person {id}"))),
    }
}

async fn clear_gallery(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<impl IntoResponse> {
    state.worker.clear_gallery().await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    max_age_days: Option<i64>,
}

async fn cleanup_gallery(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<CleanupQuery>,
) -> Result<impl IntoResponse> {
    let max_age_days = query.max_age_days.unwrap_or(7).max(0);
    let removed = state.worker.cleanup_gallery(max_age_days).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

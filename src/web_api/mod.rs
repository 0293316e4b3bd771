//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes
//! - Request validation
//! - Response formatting

mod analytics_routes;
mod routes;
mod ws_routes;

pub use routes::create_router;

use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::frame_source::CameraStatus;
use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let vps_status = match state.config.stream_proxy_url.as_deref() {
        Some(url) => Some(probe_stream_proxy(url).await),
        None => None,
    };

    let status = state.worker.status();
    let response = HealthResponse {
        ok: true,
        stream_mode: state.config.stream_mode().to_string(),
        vps_status,
        camera_status: status.camera_status.as_str().to_string(),
        model_loaded: status.model_loaded,
        uptime_sec: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    Json(response)
}

/// Quick reachability probe of the restreamer.
async fn probe_stream_proxy(url: &str) -> String {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(_) => return "unreachable".to_string(),
    };
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() || response.status().is_redirection() => {
            "ok".to_string()
        }
        Ok(response) => format!("http {}", response.status().as_u16()),
        Err(_) => "unreachable".to_string(),
    }
}

pub(crate) fn camera_online(status: CameraStatus) -> bool {
    status == CameraStatus::Online
}

//! Shared models and types.
//!
//! Types used across multiple modules to avoid circular dependencies.

use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    /// `direct` or `proxied`
    pub stream_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vps_status: Option<String>,
    pub camera_status: String,
    pub model_loaded: bool,
    pub uptime_sec: u64,
    pub version: String,
}

/// System status response (worker snapshot plus process uptime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub camera_online: bool,
    pub fps: f64,
    pub active_tracks: usize,
    pub model_loaded: bool,
    pub uptime_seconds: f64,
    pub config_id: Option<i64>,
    pub dropped_store_writes: u64,
    pub ws_connections: u64,
}

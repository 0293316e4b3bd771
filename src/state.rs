//! Application state
//!
//! Holds all shared components and state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use sqlx::sqlite::SqlitePool;

use crate::auth::AuthService;
use crate::camera_config::{CameraConfigService, CameraSettingsRepository};
use crate::cv_worker::WorkerHandle;
use crate::event_store::EventStore;
use crate::realtime_hub::RealtimeHub;

/// Application configuration, from `PC_`-prefixed environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Server bind host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Inference sidecar base URL (YOLO + ByteTrack).
    pub detector_url: String,
    /// Restreamer base URL fronting RTSP/device cameras. Optional; direct
    /// snapshot URLs work without it.
    pub stream_proxy_url: Option<String>,
    /// Re-ID gallery snapshot file.
    pub gallery_path: PathBuf,
    /// Admin login name.
    pub admin_username: String,
    /// Admin password (hashed at startup when no hash is provided).
    pub admin_password: Option<String>,
    /// Pre-hashed admin password (bcrypt), takes precedence.
    pub admin_password_hash: Option<String>,
    /// JWT signing secret. Random per boot when unset.
    pub jwt_secret: Option<String>,
    /// Idle WebSocket subscriptions are dropped after this many seconds.
    pub ws_idle_timeout_sec: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("PC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("people_counter.db")),
            host: std::env::var("PC_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PC_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            detector_url: std::env::var("PC_DETECTOR_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string()),
            stream_proxy_url: std::env::var("PC_STREAM_PROXY_URL").ok(),
            gallery_path: std::env::var("PC_REID_GALLERY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/reid_gallery.json")),
            admin_username: std::env::var("PC_ADMIN_USERNAME")
                .unwrap_or_else(|_| "admin".to_string()),
            admin_password: std::env::var("PC_ADMIN_PASSWORD").ok(),
            admin_password_hash: std::env::var("PC_ADMIN_PASSWORD_HASH").ok(),
            jwt_secret: std::env::var("PC_JWT_SECRET").ok(),
            ws_idle_timeout_sec: std::env::var("PC_WS_IDLE_TIMEOUT_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    /// `proxied` when a restreamer fronts the cameras, `direct` otherwise.
    pub fn stream_mode(&self) -> &'static str {
        if self.stream_proxy_url.is_some() {
            "proxied"
        } else {
            "direct"
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database pool
    pub pool: SqlitePool,
    /// Application config
    pub config: AppConfig,
    /// Event persistence
    pub store: EventStore,
    /// Camera settings table
    pub settings_repo: CameraSettingsRepository,
    /// Settings validation / effective-config assembly
    pub config_service: CameraConfigService,
    /// WebSocket distribution
    pub hub: Arc<RealtimeHub>,
    /// The capture/detect/count pipeline
    pub worker: WorkerHandle,
    /// Login + token verification
    pub auth: Arc<AuthService>,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

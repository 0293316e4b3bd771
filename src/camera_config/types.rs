//! Camera settings data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::frame_source::SourceKind;

/// Persisted counting configuration (one active row at a time).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CameraSettings {
    pub id: i64,
    /// Stored as TEXT, one of `device` / `rtsp` / `proxied_path`.
    pub source_kind: String,
    /// Camera IP, device index, or full HTTP URL depending on the kind.
    pub address: String,
    pub port: i64,
    pub username: String,
    pub password: String,
    pub channel: i64,
    pub subtype: i64,
    /// Pixels from the left; NULL means frame-width / 2 at startup.
    pub line_x: Option<i64>,
    /// `L->R` or `R->L`.
    pub direction_in: String,
    pub hysteresis_px: i64,
    pub area_change_threshold: f64,
    pub max_age_sec: f64,
    pub cleanup_interval_sec: f64,
    pub confidence_threshold: f64,
    pub iou_threshold: f64,
    pub resize_width: i64,
    pub model_name: String,
    pub reid_enabled: bool,
    pub reid_similarity_threshold: f64,
    pub reid_max_persons: i64,
    pub reid_update_embeddings: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CameraSettings {
    pub fn kind(&self) -> SourceKind {
        match self.source_kind.as_str() {
            "device" => SourceKind::Device,
            "proxied_path" => SourceKind::ProxiedPath,
            _ => SourceKind::Rtsp,
        }
    }
}

/// Settings as returned by the API: the password never leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettingsResponse {
    pub id: i64,
    pub source_kind: String,
    pub address: String,
    pub port: i64,
    pub username: String,
    pub channel: i64,
    pub subtype: i64,
    pub line_x: Option<i64>,
    pub direction_in: String,
    pub hysteresis_px: i64,
    pub area_change_threshold: f64,
    pub max_age_sec: f64,
    pub cleanup_interval_sec: f64,
    pub confidence_threshold: f64,
    pub iou_threshold: f64,
    pub resize_width: i64,
    pub model_name: String,
    pub reid_enabled: bool,
    pub reid_similarity_threshold: f64,
    pub reid_max_persons: i64,
    pub reid_update_embeddings: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<CameraSettings> for CameraSettingsResponse {
    fn from(s: CameraSettings) -> Self {
        Self {
            id: s.id,
            source_kind: s.source_kind,
            address: s.address,
            port: s.port,
            username: s.username,
            channel: s.channel,
            subtype: s.subtype,
            line_x: s.line_x,
            direction_in: s.direction_in,
            hysteresis_px: s.hysteresis_px,
            area_change_threshold: s.area_change_threshold,
            max_age_sec: s.max_age_sec,
            cleanup_interval_sec: s.cleanup_interval_sec,
            confidence_threshold: s.confidence_threshold,
            iou_threshold: s.iou_threshold,
            resize_width: s.resize_width,
            model_name: s.model_name,
            reid_enabled: s.reid_enabled,
            reid_similarity_threshold: s.reid_similarity_threshold,
            reid_max_persons: s.reid_max_persons,
            reid_update_embeddings: s.reid_update_embeddings,
            is_active: s.is_active,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

fn default_port() -> i64 {
    554
}
fn default_channel() -> i64 {
    1
}
fn default_direction_in() -> String {
    "L->R".to_string()
}
fn default_hysteresis_px() -> i64 {
    5
}
fn default_max_age_sec() -> f64 {
    5.0
}
fn default_cleanup_interval_sec() -> f64 {
    1.0
}
fn default_confidence_threshold() -> f64 {
    0.45
}
fn default_iou_threshold() -> f64 {
    0.5
}
fn default_resize_width() -> i64 {
    960
}
fn default_model_name() -> String {
    "yolov8n.pt".to_string()
}
fn default_reid_similarity_threshold() -> f64 {
    0.65
}
fn default_reid_max_persons() -> i64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_source_kind() -> String {
    "rtsp".to_string()
}

/// Create/update request body. All tuning fields have the shipping
/// defaults; an empty password on update keeps the stored one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettingsRequest {
    #[serde(default = "default_source_kind")]
    pub source_kind: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: i64,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_channel")]
    pub channel: i64,
    #[serde(default)]
    pub subtype: i64,
    #[serde(default)]
    pub line_x: Option<i64>,
    #[serde(default = "default_direction_in")]
    pub direction_in: String,
    #[serde(default = "default_hysteresis_px")]
    pub hysteresis_px: i64,
    #[serde(default)]
    pub area_change_threshold: f64,
    #[serde(default = "default_max_age_sec")]
    pub max_age_sec: f64,
    #[serde(default = "default_cleanup_interval_sec")]
    pub cleanup_interval_sec: f64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f64,
    #[serde(default = "default_resize_width")]
    pub resize_width: i64,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub reid_enabled: bool,
    #[serde(default = "default_reid_similarity_threshold")]
    pub reid_similarity_threshold: f64,
    #[serde(default = "default_reid_max_persons")]
    pub reid_max_persons: i64,
    #[serde(default = "default_true")]
    pub reid_update_embeddings: bool,
}

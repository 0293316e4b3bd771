//! Camera settings validation and effective-config assembly.

use std::path::PathBuf;
use std::time::Duration;

use super::types::{CameraSettings, CameraSettingsRequest};
use crate::counting::{DirectionMapping, EngineConfig};
use crate::cv_worker::WorkerConfig;
use crate::detector::DetectorConfig;
use crate::error::{Error, Result};
use crate::frame_source::SourceKind;
use crate::reid::GalleryConfig;

/// Stateless service over camera settings.
#[derive(Clone)]
pub struct CameraConfigService {
    /// Restreamer base URL fronting RTSP cameras and local devices.
    stream_proxy_url: Option<String>,
    detector_url: String,
    gallery_path: PathBuf,
}

impl CameraConfigService {
    pub fn new(
        stream_proxy_url: Option<String>,
        detector_url: String,
        gallery_path: PathBuf,
    ) -> Self {
        Self {
            stream_proxy_url: stream_proxy_url.map(|u| u.trim_end_matches('/').to_string()),
            detector_url,
            gallery_path,
        }
    }

    pub fn stream_proxy_url(&self) -> Option<&str> {
        self.stream_proxy_url.as_deref()
    }

    /// Reject invalid settings before anything is persisted. The running
    /// configuration stays untouched on rejection.
    pub fn validate(&self, req: &CameraSettingsRequest) -> Result<()> {
        match req.source_kind.as_str() {
            "device" | "rtsp" | "proxied_path" => {}
            other => {
                return Err(Error::Validation(format!(
                    "unknown source_kind '{other}', expected device, rtsp or proxied_path"
                )))
            }
        }
        if req.address.trim().is_empty() {
            return Err(Error::Validation("address must not be empty".to_string()));
        }
        if req.source_kind == "proxied_path" && !req.address.starts_with("http") {
            return Err(Error::Validation(
                "proxied_path address must be an http(s) URL".to_string(),
            ));
        }
        if !(1..=65535).contains(&req.port) {
            return Err(Error::Validation(format!("port {} out of range", req.port)));
        }
        if let Some(line_x) = req.line_x {
            if line_x <= 0 {
                return Err(Error::Validation(format!("line_x {line_x} must be positive")));
            }
        }
        if req.direction_in != "L->R" && req.direction_in != "R->L" {
            return Err(Error::Validation(format!(
                "direction_in '{}' must be 'L->R' or 'R->L'",
                req.direction_in
            )));
        }
        if req.hysteresis_px < 0 {
            return Err(Error::Validation("hysteresis_px must be >= 0".to_string()));
        }
        if !(0.0..=1.0).contains(&req.area_change_threshold) {
            return Err(Error::Validation(
                "area_change_threshold must be in [0, 1]".to_string(),
            ));
        }
        if req.max_age_sec <= 0.0 || req.cleanup_interval_sec <= 0.0 {
            return Err(Error::Validation(
                "max_age_sec and cleanup_interval_sec must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&req.confidence_threshold)
            || !(0.0..=1.0).contains(&req.iou_threshold)
        {
            return Err(Error::Validation(
                "confidence_threshold and iou_threshold must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&req.reid_similarity_threshold) {
            return Err(Error::Validation(
                "reid_similarity_threshold must be in [0, 1]".to_string(),
            ));
        }
        if req.reid_max_persons <= 0 {
            return Err(Error::Validation("reid_max_persons must be positive".to_string()));
        }
        if req.resize_width < 0 {
            return Err(Error::Validation("resize_width must be >= 0".to_string()));
        }
        Ok(())
    }

    /// RTSP URL for an IP camera, Dahua path layout. Cameras reached via
    /// the restreamer on localhost use its plain path instead.
    pub fn rtsp_url(settings: &CameraSettings) -> String {
        if settings.address == "localhost" || settings.address == "127.0.0.1" {
            format!("rtsp://{}:{}/cam", settings.address, settings.port)
        } else {
            format!(
                "rtsp://{}:{}@{}:{}/cam/realmonitor?channel={}&subtype={}",
                settings.username,
                settings.password,
                settings.address,
                settings.port,
                settings.channel,
                settings.subtype
            )
        }
    }

    /// The HTTP URL frames are fetched from, plus a credential-masked copy
    /// for logs and status output.
    pub fn frame_url(&self, settings: &CameraSettings) -> Result<(String, String)> {
        match settings.kind() {
            SourceKind::ProxiedPath => Ok((settings.address.clone(), settings.address.clone())),
            SourceKind::Device => {
                let proxy = self.stream_proxy_url.as_deref().ok_or_else(|| {
                    Error::Validation(
                        "device sources require PC_STREAM_PROXY_URL to be configured".to_string(),
                    )
                })?;
                let url = format!("{proxy}/api/frame.jpeg?src={}", settings.address);
                Ok((url.clone(), url))
            }
            SourceKind::Rtsp => {
                let proxy = self.stream_proxy_url.as_deref().ok_or_else(|| {
                    Error::Validation(
                        "rtsp sources require PC_STREAM_PROXY_URL to be configured".to_string(),
                    )
                })?;
                let rtsp = Self::rtsp_url(settings);
                let url = format!("{proxy}/api/frame.jpeg?src={}", encode_query_value(&rtsp));
                let masked = if settings.password.is_empty() {
                    url.clone()
                } else {
                    url.replace(&encode_query_value(&settings.password), "***")
                };
                Ok((url, masked))
            }
        }
    }

    /// Assemble the worker configuration for the active settings row.
    pub fn worker_config(&self, settings: &CameraSettings) -> Result<WorkerConfig> {
        let (frame_url, masked_url) = self.frame_url(settings)?;
        let direction_in = if settings.direction_in == "R->L" {
            DirectionMapping::RightToLeftIn
        } else {
            DirectionMapping::LeftToRightIn
        };

        Ok(WorkerConfig {
            config_id: Some(settings.id),
            frame_url,
            masked_url,
            line_x: settings.line_x.map(|x| x as f32),
            engine: EngineConfig {
                // Placeholder until the first frame reveals the width.
                line_x: settings.line_x.unwrap_or(0) as f32,
                hysteresis_px: settings.hysteresis_px as f32,
                area_change_threshold: settings.area_change_threshold as f32,
                direction_in,
                max_age: Duration::from_secs_f64(settings.max_age_sec),
                cleanup_interval: Duration::from_secs_f64(settings.cleanup_interval_sec),
            },
            detector_url: self.detector_url.clone(),
            detector: DetectorConfig {
                confidence_threshold: settings.confidence_threshold as f32,
                iou_threshold: settings.iou_threshold as f32,
                resize_width: settings.resize_width as u32,
                model_name: settings.model_name.clone(),
            },
            reid: settings.reid_enabled.then(|| GalleryConfig {
                similarity_threshold: settings.reid_similarity_threshold as f32,
                max_persons: settings.reid_max_persons as usize,
                update_embeddings: settings.reid_update_embeddings,
            }),
            gallery_path: self.gallery_path.clone(),
        })
    }
}

/// Percent-encode a URL query value (unreserved characters pass through).
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

//! Detector - Person Detection + Tracking Adapter
//!
//! ## Responsibilities
//!
//! - Define the per-frame observation contract: person-class boxes in
//!   original-frame pixel coordinates with a stable track id
//! - Talk to the inference sidecar (YOLO + ByteTrack) over HTTP
//! - Filter observations below the configured confidence threshold
//!
//! The adapter is stateless from the engine's viewpoint; track identity is
//! the sidecar's concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// One tracked person box for a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub track_id: i64,
    /// `(x1, y1, x2, y2)` in pixels of the original frame.
    pub bbox: (f32, f32, f32, f32),
    pub confidence: f32,
}

/// Detection tuning passed along with each frame.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Frames are downscaled to this width before inference; boxes come
    /// back mapped to original coordinates. 0 disables resizing.
    pub resize_width: u32,
    pub model_name: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.45,
            iou_threshold: 0.5,
            resize_width: 960,
            model_name: "yolov8n.pt".to_string(),
        }
    }
}

/// Common interface for detector+tracker backends.
#[async_trait]
pub trait PersonDetector: Send {
    /// Detect and track persons in one JPEG frame.
    async fn process(&mut self, jpeg: &[u8]) -> Result<Vec<Observation>>;

    /// Whether the backend has its model loaded and is ready to serve.
    async fn healthy(&self) -> bool;

    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    observations: Vec<WireObservation>,
}

#[derive(Debug, Deserialize)]
struct WireObservation {
    track_id: i64,
    bbox: [f32; 4],
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct SidecarHealth {
    model_loaded: bool,
}

/// HTTP client for the inference sidecar.
pub struct HttpDetector {
    client: reqwest::Client,
    base_url: String,
    config: DetectorConfig,
}

impl HttpDetector {
    pub fn new(base_url: String, config: DetectorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: DetectorConfig) {
        self.config = config;
    }

    /// Drop observations under the confidence threshold. The sidecar
    /// filters too; this guards against mismatched settings.
    fn filter(&self, observations: Vec<Observation>) -> Vec<Observation> {
        observations
            .into_iter()
            .filter(|o| o.confidence >= self.config.confidence_threshold)
            .collect()
    }
}

#[async_trait]
impl PersonDetector for HttpDetector {
    async fn process(&mut self, jpeg: &[u8]) -> Result<Vec<Observation>> {
        let url = format!(
            "{}/detect?conf={}&iou={}&resize_width={}&model={}",
            self.base_url,
            self.config.confidence_threshold,
            self.config.iou_threshold,
            self.config.resize_width,
            self.config.model_name,
        );

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "detector sidecar returned {}",
                response.status()
            )));
        }

        let parsed: DetectResponse = response.json().await?;
        let observations = parsed
            .observations
            .into_iter()
            .map(|w| Observation {
                track_id: w.track_id,
                bbox: (w.bbox[0], w.bbox[1], w.bbox[2], w.bbox[3]),
                confidence: w.confidence,
            })
            .collect();
        Ok(self.filter(observations))
    }

    async fn healthy(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<SidecarHealth>()
                .await
                .map(|h| h.model_loaded)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn name(&self) -> &str {
        "http-sidecar"
    }
}

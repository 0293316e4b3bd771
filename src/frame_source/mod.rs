//! FrameSource - Camera Frame Ingestion
//!
//! ## Responsibilities
//!
//! - Lazy, possibly-infinite stream of timestamped JPEG frames
//! - Open/close lifecycle; a closed source is not restartable, a new one
//!   is opened after reconfiguration
//! - Capped exponential backoff guidance for reconnects
//!
//! Cameras are consumed as JPEG-over-HTTP: RTSP cameras and local devices
//! sit behind the restreamer, which exposes per-camera snapshot paths;
//! cameras with a native snapshot URL are fetched directly. The source is
//! thread-confined to the CV worker.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reconnect backoff: base doubles per consecutive failure, capped.
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Per-frame fetch timeout.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Camera health as surfaced in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Offline,
    Initializing,
    Online,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Offline => "offline",
            CameraStatus::Initializing => "initializing",
            CameraStatus::Online => "online",
        }
    }
}

/// What kind of endpoint the configured address describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Local capture device, served through the restreamer.
    Device,
    /// IP camera spoken to via its RTSP path on the restreamer.
    #[default]
    Rtsp,
    /// Direct HTTP path (native snapshot URL or restreamer path).
    ProxiedPath,
}

/// One fetched frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Bytes,
    pub captured_at: DateTime<Utc>,
}

/// Outcome of a single fetch attempt.
#[derive(Debug)]
pub enum FrameResult {
    Frame(Frame),
    /// The stream ended (finite sources only).
    EndOfStream,
    /// Read failed; the worker backs off and retries.
    TransientError(String),
}

/// Contract for frame producers.
#[async_trait]
pub trait FrameSource: Send {
    /// Connect and verify the source yields a frame.
    async fn open(&mut self) -> Result<()>;

    /// Fetch the next frame. Must respect a per-frame timeout.
    async fn next_frame(&mut self) -> FrameResult;

    /// Release the underlying connection. The source is dead afterwards.
    async fn close(&mut self);

    /// Where the frames come from, credentials masked.
    fn describe(&self) -> String;
}

/// Backoff delay after `failures` consecutive open/read failures.
pub fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(8);
    Duration::from_millis((BACKOFF_BASE_MS << exp).min(BACKOFF_CAP_MS))
}

/// JPEG-over-HTTP source: polls a snapshot URL once per frame.
pub struct HttpFrameSource {
    client: reqwest::Client,
    url: String,
    masked_url: String,
    open: bool,
}

impl HttpFrameSource {
    pub fn new(url: String, masked_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FRAME_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            client,
            url,
            masked_url,
            open: false,
        }
    }

    async fn fetch(&self) -> std::result::Result<Bytes, String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("snapshot endpoint returned {}", response.status()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| format!("body read failed: {e}"))?;
        if body.len() < 4 || body[0] != 0xFF || body[1] != 0xD8 {
            return Err("response is not a JPEG".to_string());
        }
        Ok(body)
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn open(&mut self) -> Result<()> {
        match self.fetch().await {
            Ok(_) => {
                self.open = true;
                tracing::info!(source = %self.masked_url, "Frame source opened");
                Ok(())
            }
            Err(reason) => Err(Error::CameraUnreachable(format!(
                "{}: {}",
                self.masked_url, reason
            ))),
        }
    }

    async fn next_frame(&mut self) -> FrameResult {
        if !self.open {
            return FrameResult::TransientError("source not open".to_string());
        }
        match self.fetch().await {
            Ok(jpeg) => FrameResult::Frame(Frame {
                jpeg,
                captured_at: Utc::now(),
            }),
            Err(reason) => FrameResult::TransientError(reason),
        }
    }

    async fn close(&mut self) {
        self.open = false;
        tracing::info!(source = %self.masked_url, "Frame source closed");
    }

    fn describe(&self) -> String {
        self.masked_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(20), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn next_frame_before_open_is_transient_error() {
        let mut source = HttpFrameSource::new(
            "http://127.0.0.1:1/frame.jpg".to_string(),
            "http://127.0.0.1:1/frame.jpg".to_string(),
        );
        match source.next_frame().await {
            FrameResult::TransientError(_) => {}
            other => panic!("expected transient error, got {other:?}"),
        }
    }
}

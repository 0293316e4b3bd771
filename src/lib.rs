//! gatecount - Real-Time Line-Crossing People Counter
//!
//! ## Architecture
//!
//! 1. FrameSource - JPEG frame ingestion from the camera/restreamer
//! 2. Detector - person detection + tracking adapter (inference sidecar)
//! 3. Counting - the line-crossing engine (per-track state, dedup)
//! 4. Re-ID - short-horizon person gallery against double counting
//! 5. EventStore - append-only crossing events (SQLite)
//! 6. Analytics - period/hourly/weekday rollups, trends, peak prediction
//! 7. RealtimeHub - WebSocket distribution with per-subscriber buffers
//! 8. CvWorker - the single task driving capture -> detect -> count
//! 9. CameraConfig - persisted settings and hot reconfiguration
//! 10. WebAPI - REST + WebSocket control plane
//!
//! ## Design Principles
//!
//! - All mutable pipeline state lives on the CV worker task
//! - Events are durable before they are broadcast
//! - A slow dashboard can never stall capture

pub mod analytics;
pub mod auth;
pub mod camera_config;
pub mod counting;
pub mod cv_worker;
pub mod detector;
pub mod event_store;
pub mod export;
pub mod frame_source;
pub mod realtime_hub;
pub mod reid;
pub mod web_api;

pub mod error;
pub mod models;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;

//! CameraConfig - Counting Configuration
//!
//! ## Responsibilities
//!
//! - Persist camera/line/tuning settings (single active row)
//! - Validate reconfiguration requests before anything changes
//! - Assemble the effective worker configuration, including the HTTP
//!   frame URL with credentials masked for logging

mod repository;
mod service;
mod types;

pub use repository::CameraSettingsRepository;
pub use service::CameraConfigService;
pub use types::{CameraSettings, CameraSettingsRequest, CameraSettingsResponse};

//! Export - Event Data Export
//!
//! ## Responsibilities
//!
//! - Render an event range as CSV with summary totals
//!
//! XLSX and PDF rendering belong to the external report generator; the
//! API rejects those formats with a structured validation error.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::event_store::CrossingEvent;

/// Export request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportRequest {
    /// `csv`, `excel` or `pdf`; only `csv` is rendered in-process.
    pub format: String,
    #[serde(default)]
    pub include_charts: bool,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

/// Render events as CSV. The summary block at the end mirrors what the
/// dashboards display.
pub fn to_csv(events: &[CrossingEvent], in_count: i64, out_count: i64) -> String {
    let mut out = String::from("id,timestamp,track_id,person_id,direction\n");
    for event in events {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            event.id,
            event.timestamp.to_rfc3339(),
            event.track_id,
            event.person_id.as_deref().unwrap_or(""),
            event.direction.as_str(),
        ));
    }
    out.push('\n');
    out.push_str("total_in,total_out,total_events\n");
    out.push_str(&format!("{},{},{}\n", in_count, out_count, in_count + out_count));
    out
}

/// Attachment filename with a creation stamp.
pub fn csv_filename(now: DateTime<Utc>) -> String {
    format!("people_counter_{}.csv", now.format("%Y%m%d_%H%M%S"))
}

//! Analytics routes.
//!
//! Thin handlers over the analytics module: parse query parameters, pick
//! defaults, delegate. `now` is taken once per request.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use serde::Deserialize;

use crate::analytics::{self, PeriodKind};
use crate::auth::AuthUser;
use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct AnchorQuery {
    /// Anchor instant; defaults to now.
    date: Option<DateTime<Utc>>,
}

impl AnchorQuery {
    fn anchor(&self) -> DateTime<Local> {
        self.date
            .map(|d| d.with_timezone(&Local))
            .unwrap_or_else(Local::now)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RangeQuery {
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DaysQuery {
    days: Option<i64>,
}

impl DaysQuery {
    fn days(&self) -> i64 {
        self.days.unwrap_or(30).clamp(1, 365)
    }
}

pub async fn day(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<AnchorQuery>,
) -> Result<impl IntoResponse> {
    let stats = analytics::period(&state.store, PeriodKind::Day, query.anchor()).await?;
    Ok(Json(stats))
}

pub async fn week(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<AnchorQuery>,
) -> Result<impl IntoResponse> {
    let stats = analytics::period(&state.store, PeriodKind::Week, query.anchor()).await?;
    Ok(Json(stats))
}

pub async fn month(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<AnchorQuery>,
) -> Result<impl IntoResponse> {
    let stats = analytics::period(&state.store, PeriodKind::Month, query.anchor()).await?;
    Ok(Json(stats))
}

pub async fn hourly(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<AnchorQuery>,
) -> Result<impl IntoResponse> {
    let buckets = analytics::hourly(&state.store, query.anchor().date_naive()).await?;
    Ok(Json(buckets))
}

pub async fn daily(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<RangeQuery>,
) -> Result<impl IntoResponse> {
    // Default: the current month, first to last day.
    let (start, end) = match (query.start_date, query.end_date) {
        (Some(s), Some(e)) => (
            s.with_timezone(&Local).date_naive(),
            e.with_timezone(&Local).date_naive(),
        ),
        _ => {
            let today = Local::now().date_naive();
            let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
                .expect("first of month");
            let last = crate::event_store::next_month(first).pred_opt().expect("last of month");
            (first, last)
        }
    };
    let buckets = analytics::daily_range(&state.store, start, end).await?;
    Ok(Json(buckets))
}

pub async fn monthly(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<RangeQuery>,
) -> Result<impl IntoResponse> {
    // Default: the current year, January to December.
    let (start, end) = match (query.start_date, query.end_date) {
        (Some(s), Some(e)) => {
            let s = s.with_timezone(&Local).date_naive();
            let e = e.with_timezone(&Local).date_naive();
            (
                NaiveDate::from_ymd_opt(s.year(), s.month(), 1).expect("month start"),
                NaiveDate::from_ymd_opt(e.year(), e.month(), 1).expect("month start"),
            )
        }
        _ => {
            let year = Local::now().year();
            (
                NaiveDate::from_ymd_opt(year, 1, 1).expect("january"),
                NaiveDate::from_ymd_opt(year, 12, 1).expect("december"),
            )
        }
    };
    let buckets = analytics::monthly_range(&state.store, start, end).await?;
    Ok(Json(buckets))
}

pub async fn peak_hour_avg(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<DaysQuery>,
) -> Result<impl IntoResponse> {
    let peak = analytics::peak_hour_avg(&state.store, query.days(), Local::now()).await?;
    Ok(Json(peak))
}

pub async fn weekday_stats(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<DaysQuery>,
) -> Result<impl IntoResponse> {
    let rows = analytics::weekday_stats(&state.store, query.days(), Local::now()).await?;
    Ok(Json(rows))
}

pub async fn averages(State(state): State<AppState>, _user: AuthUser) -> Result<impl IntoResponse> {
    let averages = analytics::averages(&state.store, Local::now()).await?;
    Ok(Json(averages))
}

pub async fn growth_trend(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<impl IntoResponse> {
    let trend = analytics::growth_trend(&state.store, Local::now()).await?;
    Ok(Json(trend))
}

pub async fn predict_peak(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<DaysQuery>,
) -> Result<impl IntoResponse> {
    let prediction = analytics::predict_peak(&state.store, query.days(), Local::now()).await?;
    Ok(Json(prediction))
}

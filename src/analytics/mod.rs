//! Analytics - Aggregated Visitor Statistics
//!
//! ## Responsibilities
//!
//! - Period (day/week/month), hourly, daily, monthly and weekday rollups
//! - Derived metrics: averages, growth trend, peak-hour average, and the
//!   heuristic next-peak prediction
//!
//! Every function is a pure query over the event store and takes the
//! reference `now` as an argument so tests can pin the clock. Period
//! boundaries follow the server-local time zone (see the event store
//! notes); empty data yields zero-filled structures, never errors.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::counting::Direction;
use crate::error::Result;
use crate::event_store::{local_day_bounds, DayBucket, EventStore, HourBucket, MonthBucket};

/// Weeks per month used for the per-week average, as in the dashboards.
const WEEKS_PER_MONTH: f64 = 4.3;
/// Relative change below this is reported as `stable`.
const STABLE_BAND_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Day,
    Week,
    Month,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Day => "day",
            PeriodKind::Week => "week",
            PeriodKind::Month => "month",
        }
    }
}

/// Totals for one calendar period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodStats {
    pub period: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub in_count: i64,
    pub out_count: i64,
    pub net_flow: i64,
    pub total_events: i64,
}

/// Activity for one weekday over the lookback window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeekdayStats {
    pub weekday: String,
    pub in_count: i64,
    pub out_count: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Averages {
    pub avg_per_day: f64,
    pub avg_per_week: f64,
    pub avg_per_month: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowthTrend {
    pub week_change_percent: f64,
    pub month_change_percent: f64,
    pub trend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakHourAverage {
    pub peak_hour: Option<u32>,
    pub avg_count: f64,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakPrediction {
    pub predicted_hour: Option<u32>,
    pub hours_until: i64,
    pub expected_count: f64,
    pub confidence: f64,
}

/// The bundle pushed over the hub every 30 s and on subscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub day: PeriodStats,
    pub hourly: Vec<HourBucket>,
    pub averages: Averages,
    pub growth: GrowthTrend,
}

/// Local calendar boundaries of the period containing `anchor`, as UTC
/// instants. Day = [00:00, 24:00); week = Monday..Sunday; month = 1st..1st.
fn period_bounds(kind: PeriodKind, anchor: DateTime<Local>) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = anchor.date_naive();
    match kind {
        PeriodKind::Day => local_day_bounds(date),
        PeriodKind::Week => {
            let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
            let (start, _) = local_day_bounds(monday);
            let (_, end) = local_day_bounds(monday + Duration::days(6));
            (start, end)
        }
        PeriodKind::Month => {
            let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month");
            let next = crate::event_store::next_month(first);
            let (start, _) = local_day_bounds(first);
            let (end, _) = local_day_bounds(next);
            (start, end)
        }
    }
}

/// Totals for the day/week/month containing `anchor`.
pub async fn period(
    store: &EventStore,
    kind: PeriodKind,
    anchor: DateTime<Local>,
) -> Result<PeriodStats> {
    let (start, end) = period_bounds(kind, anchor);
    let (in_count, out_count) = store.counts_by_direction(start, end).await?;
    Ok(PeriodStats {
        period: kind.as_str().to_string(),
        start_date: start,
        end_date: end,
        in_count,
        out_count,
        net_flow: in_count - out_count,
        total_events: in_count + out_count,
    })
}

/// 24 zero-filled hourly buckets for one local day.
pub async fn hourly(store: &EventStore, day: NaiveDate) -> Result<Vec<HourBucket>> {
    store.aggregate_by_hour(day).await
}

/// Zero-filled daily buckets for an inclusive date range.
pub async fn daily_range(
    store: &EventStore,
    start_day: NaiveDate,
    end_day: NaiveDate,
) -> Result<Vec<DayBucket>> {
    store.aggregate_by_day(start_day, end_day).await
}

/// Zero-filled monthly buckets for an inclusive month range.
pub async fn monthly_range(
    store: &EventStore,
    start_month: NaiveDate,
    end_month: NaiveDate,
) -> Result<Vec<MonthBucket>> {
    store.aggregate_by_month(start_month, end_month).await
}

/// Activity by weekday over the last `days`. Always 7 rows, Monday first.
pub async fn weekday_stats(
    store: &EventStore,
    days: i64,
    now: DateTime<Local>,
) -> Result<Vec<WeekdayStats>> {
    let end = now.with_timezone(&Utc);
    let start = end - Duration::days(days);
    let events = store.range(start, end).await?;

    let mut totals = [(0i64, 0i64); 7];
    for event in events {
        let weekday = event.timestamp.with_timezone(&Local).weekday();
        let slot = &mut totals[weekday.num_days_from_monday() as usize];
        match event.direction {
            Direction::In => slot.0 += 1,
            Direction::Out => slot.1 += 1,
        }
    }

    const NAMES: [&str; 7] = [
        "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
    ];
    Ok(NAMES
        .iter()
        .zip(totals)
        .map(|(name, (in_count, out_count))| WeekdayStats {
            weekday: name.to_string(),
            in_count,
            out_count,
            total: in_count + out_count,
        })
        .collect())
}

/// Average visitors per day / week / month. Each average requires at least
/// one full period of history; with less it reports 0.
pub async fn averages(store: &EventStore, now: DateTime<Local>) -> Result<Averages> {
    let Some(earliest) = store.earliest().await? else {
        return Ok(Averages::default());
    };
    let history_days = (now.with_timezone(&Utc) - earliest).num_days();
    let end = now.with_timezone(&Utc);

    let week = store.counts_by_direction(end - Duration::days(7), end).await?;
    let month = store.counts_by_direction(end - Duration::days(30), end).await?;
    let week_total = (week.0 + week.1) as f64;
    let month_total = (month.0 + month.1) as f64;

    Ok(Averages {
        avg_per_day: if history_days >= 1 { round1(week_total / 7.0) } else { 0.0 },
        avg_per_week: if history_days >= 7 {
            round1(month_total / WEEKS_PER_MONTH)
        } else {
            0.0
        },
        avg_per_month: if history_days >= 30 { round1(month_total) } else { 0.0 },
    })
}

/// Percent change against the preceding equal-length periods.
pub async fn growth_trend(store: &EventStore, now: DateTime<Local>) -> Result<GrowthTrend> {
    let end = now.with_timezone(&Utc);

    let this_week_start = end - Duration::days(7);
    let last_week_start = end - Duration::days(14);
    let this_week = store.counts_by_direction(this_week_start, end).await?;
    let last_week = store
        .counts_by_direction(last_week_start, this_week_start)
        .await?;
    let week_change = percent_change(this_week.0 + this_week.1, last_week.0 + last_week.1);

    let date = now.date_naive();
    let this_month_first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month");
    let last_month_first = if this_month_first.month() == 1 {
        NaiveDate::from_ymd_opt(this_month_first.year() - 1, 12, 1)
    } else {
        NaiveDate::from_ymd_opt(this_month_first.year(), this_month_first.month() - 1, 1)
    }
    .expect("first of month");
    let (this_month_start, _) = local_day_bounds(this_month_first);
    let (last_month_start, _) = local_day_bounds(last_month_first);

    let this_month = store.counts_by_direction(this_month_start, end).await?;
    let last_month = store
        .counts_by_direction(last_month_start, this_month_start)
        .await?;
    let month_change = percent_change(this_month.0 + this_month.1, last_month.0 + last_month.1);

    let trend = if week_change.abs() < STABLE_BAND_PERCENT {
        "stable"
    } else if week_change > 0.0 {
        "up"
    } else {
        "down"
    };

    Ok(GrowthTrend {
        week_change_percent: round1(week_change),
        month_change_percent: round1(month_change),
        trend: trend.to_string(),
    })
}

/// Hourly totals over the lookback window, summed per hour-of-day.
/// Returns `(totals[24], observed_days)`.
async fn hour_profile(
    store: &EventStore,
    days: i64,
    now: DateTime<Local>,
) -> Result<([i64; 24], i64)> {
    let end = now.with_timezone(&Utc);
    let start = end - Duration::days(days);
    let events = store.range(start, end).await?;

    let mut totals = [0i64; 24];
    let mut seen_days = std::collections::HashSet::new();
    for event in events {
        let local = event.timestamp.with_timezone(&Local);
        totals[local.hour() as usize] += 1;
        seen_days.insert(local.date_naive());
    }
    Ok((totals, seen_days.len() as i64))
}

/// The busiest hour of day averaged over the last `days`.
pub async fn peak_hour_avg(
    store: &EventStore,
    days: i64,
    now: DateTime<Local>,
) -> Result<PeakHourAverage> {
    let (totals, _) = hour_profile(store, days, now).await?;
    let peak = totals
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)
        .filter(|(_, count)| **count > 0);

    let Some((peak_hour, &peak_count)) = peak else {
        return Ok(PeakHourAverage {
            peak_hour: None,
            avg_count: 0.0,
            total_count: 0,
        });
    };

    let num_days = days.max(1);
    Ok(PeakHourAverage {
        peak_hour: Some(peak_hour as u32),
        avg_count: round2(peak_count as f64 / num_days as f64),
        total_count: peak_count,
    })
}

/// Heuristic prediction of the next peak hour from the historical profile.
pub async fn predict_peak(
    store: &EventStore,
    days: i64,
    now: DateTime<Local>,
) -> Result<PeakPrediction> {
    let (totals, observed_days) = hour_profile(store, days, now).await?;
    let peak = totals
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)
        .filter(|(_, count)| **count > 0);

    let Some((peak_hour, &peak_count)) = peak else {
        return Ok(PeakPrediction {
            predicted_hour: None,
            hours_until: 0,
            expected_count: 0.0,
            confidence: 0.0,
        });
    };

    let current_hour = now.hour() as i64;
    let hours_until = (peak_hour as i64 + 24 - current_hour) % 24;

    let mean = totals.iter().sum::<i64>() as f64 / 24.0;
    let peak_to_mean = if mean > 0.0 { peak_count as f64 / mean } else { 0.0 };
    let coverage = (observed_days as f64 / days.max(1) as f64).min(1.0);
    let confidence = (100.0 * coverage * peak_to_mean).clamp(0.0, 100.0);

    Ok(PeakPrediction {
        predicted_hour: Some(peak_hour as u32),
        hours_until,
        expected_count: round1(peak_count as f64 / days.max(1) as f64),
        confidence: round1(confidence),
    })
}

/// Everything the dashboards poll for, in one message.
pub async fn snapshot(store: &EventStore, now: DateTime<Local>) -> Result<AnalyticsSnapshot> {
    Ok(AnalyticsSnapshot {
        day: period(store, PeriodKind::Day, now).await?,
        hourly: hourly(store, now.date_naive()).await?,
        averages: averages(store, now).await?,
        growth: growth_trend(store, now).await?,
    })
}

fn percent_change(current: i64, previous: i64) -> f64 {
    if previous <= 0 {
        0.0
    } else {
        (current - previous) as f64 / previous as f64 * 100.0
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::NewEvent;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePool;

    async fn store() -> EventStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = EventStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    fn local(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, 0, 0).earliest().unwrap()
    }

    async fn insert(store: &EventStore, at: DateTime<Local>, direction: Direction) {
        store
            .insert(&NewEvent {
                timestamp: at.with_timezone(&Utc),
                track_id: 1,
                person_id: None,
                direction,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_store_yields_zero_structures() {
        let store = store().await;
        let now = local(2024, 3, 20, 15);

        let day = period(&store, PeriodKind::Day, now).await.unwrap();
        assert_eq!(day.total_events, 0);
        assert_eq!(day.net_flow, 0);

        assert_eq!(hourly(&store, now.date_naive()).await.unwrap().len(), 24);

        let avg = averages(&store, now).await.unwrap();
        assert_eq!(avg.avg_per_day, 0.0);

        let peak = peak_hour_avg(&store, 30, now).await.unwrap();
        assert_eq!(peak.peak_hour, None);
        assert_eq!(peak.total_count, 0);

        let prediction = predict_peak(&store, 30, now).await.unwrap();
        assert_eq!(prediction.predicted_hour, None);
        assert_eq!(prediction.confidence, 0.0);

        let trend = growth_trend(&store, now).await.unwrap();
        assert_eq!(trend.trend, "stable");
    }

    #[tokio::test]
    async fn day_period_counts_only_that_day() {
        let store = store().await;
        let now = local(2024, 3, 20, 15);
        insert(&store, local(2024, 3, 20, 9), Direction::In).await;
        insert(&store, local(2024, 3, 20, 10), Direction::Out).await;
        insert(&store, local(2024, 3, 19, 9), Direction::In).await;

        let day = period(&store, PeriodKind::Day, now).await.unwrap();
        assert_eq!(day.in_count, 1);
        assert_eq!(day.out_count, 1);
        assert_eq!(day.net_flow, 0);
        assert_eq!(day.total_events, 2);
    }

    #[tokio::test]
    async fn week_period_starts_on_monday() {
        let store = store().await;
        // 2024-03-20 is a Wednesday; that week is Mar 18 (Mon) .. Mar 24.
        let now = local(2024, 3, 20, 15);
        insert(&store, local(2024, 3, 18, 9), Direction::In).await;
        insert(&store, local(2024, 3, 17, 9), Direction::In).await; // previous week

        let week = period(&store, PeriodKind::Week, now).await.unwrap();
        assert_eq!(week.in_count, 1);

        let start_local = week.start_date.with_timezone(&Local);
        assert_eq!(start_local.weekday(), chrono::Weekday::Mon);
        assert_eq!(start_local.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 18).unwrap());
    }

    #[tokio::test]
    async fn weekday_stats_has_seven_rows_monday_first() {
        let store = store().await;
        let now = local(2024, 3, 20, 15);
        insert(&store, local(2024, 3, 18, 9), Direction::In).await; // Monday
        insert(&store, local(2024, 3, 19, 9), Direction::Out).await; // Tuesday

        let rows = weekday_stats(&store, 30, now).await.unwrap();
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[0].weekday, "Monday");
        assert_eq!(rows[0].in_count, 1);
        assert_eq!(rows[1].out_count, 1);
        assert_eq!(rows[6].weekday, "Sunday");
        assert_eq!(rows[6].total, 0);
    }

    #[tokio::test]
    async fn averages_require_enough_history() {
        let store = store().await;
        let now = local(2024, 3, 20, 15);
        // Only a few hours of history: per-day average must stay 0 until a
        // full day of data exists.
        insert(&store, local(2024, 3, 20, 9), Direction::In).await;
        let avg = averages(&store, now).await.unwrap();
        assert_eq!(avg.avg_per_day, 0.0);
        assert_eq!(avg.avg_per_week, 0.0);
        assert_eq!(avg.avg_per_month, 0.0);

        // A week of history unlocks the daily average.
        insert(&store, local(2024, 3, 12, 9), Direction::In).await;
        let avg = averages(&store, now).await.unwrap();
        assert!(avg.avg_per_day > 0.0);
        assert!(avg.avg_per_week > 0.0);
        assert_eq!(avg.avg_per_month, 0.0);
    }

    #[tokio::test]
    async fn growth_trend_compares_adjacent_weeks() {
        let store = store().await;
        let now = local(2024, 3, 20, 15);
        // Last week: 2 events. This week: 4 events -> +100%.
        for day in [8, 9] {
            insert(&store, local(2024, 3, day, 12), Direction::In).await;
        }
        for day in [15, 16, 17, 18] {
            insert(&store, local(2024, 3, day, 12), Direction::In).await;
        }

        let trend = growth_trend(&store, now).await.unwrap();
        assert_eq!(trend.week_change_percent, 100.0);
        assert_eq!(trend.trend, "up");
    }

    #[tokio::test]
    async fn small_change_is_stable() {
        let store = store().await;
        let now = local(2024, 3, 20, 15);
        for day in [8, 9, 10] {
            insert(&store, local(2024, 3, day, 12), Direction::In).await;
        }
        for day in [15, 16, 17] {
            insert(&store, local(2024, 3, day, 12), Direction::In).await;
        }
        let trend = growth_trend(&store, now).await.unwrap();
        assert_eq!(trend.week_change_percent, 0.0);
        assert_eq!(trend.trend, "stable");
    }

    #[tokio::test]
    async fn peak_hour_and_prediction_line_up() {
        let store = store().await;
        let now = local(2024, 3, 20, 15);
        // Hour 18 is the consistent peak across three days.
        for day in [17, 18, 19] {
            insert(&store, local(2024, 3, day, 18), Direction::In).await;
            insert(&store, local(2024, 3, day, 18), Direction::Out).await;
            insert(&store, local(2024, 3, day, 10), Direction::In).await;
        }

        let peak = peak_hour_avg(&store, 30, now).await.unwrap();
        assert_eq!(peak.peak_hour, Some(18));
        assert_eq!(peak.total_count, 6);

        let prediction = predict_peak(&store, 30, now).await.unwrap();
        assert_eq!(prediction.predicted_hour, Some(18));
        assert_eq!(prediction.hours_until, 3);
        assert!(prediction.confidence > 0.0);
        assert!(prediction.confidence <= 100.0);
    }

    #[tokio::test]
    async fn prediction_at_peak_hour_is_zero_hours_until() {
        let store = store().await;
        let now = local(2024, 3, 20, 18);
        insert(&store, local(2024, 3, 19, 18), Direction::In).await;
        let prediction = predict_peak(&store, 30, now).await.unwrap();
        assert_eq!(prediction.predicted_hour, Some(18));
        assert_eq!(prediction.hours_until, 0);
    }
}

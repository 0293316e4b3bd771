//! EventStore - Crossing Event Persistence
//!
//! ## Responsibilities
//!
//! - Append-only `events` table with strictly monotonic ids
//! - Recent/range queries for the API
//! - Hour/day/month/weekday aggregation with zero-filled gaps
//! - Administrative clear
//!
//! Writes come from the CV worker only; reads run concurrently from
//! request handlers. Inserts are retried with capped exponential backoff;
//! a write that exhausts its retries is reported to the caller, who still
//! broadcasts the event with a placeholder id.
//!
//! Period boundaries are evaluated in the server-local time zone (pinned
//! per deployment via `TZ`); timestamps are stored in UTC. Bucketing runs
//! in-process over a time-bounded scan so it does not depend on the SQLite
//! build's date functions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, Row};

use crate::counting::Direction;
use crate::error::{Error, Result};

/// Insert retry policy.
const INSERT_ATTEMPTS: u32 = 3;
const INSERT_BACKOFF_BASE_MS: u64 = 100;
const INSERT_BACKOFF_CAP_MS: u64 = 2_000;

/// Current schema version recorded in `meta`.
const SCHEMA_VERSION: i64 = 1;

/// A stored crossing event. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossingEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub track_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    pub direction: Direction,
}

/// An event awaiting persistence.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub track_id: i64,
    pub person_id: Option<String>,
    pub direction: Direction,
}

/// One aggregation bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourBucket {
    pub hour: u32,
    pub in_count: i64,
    pub out_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayBucket {
    pub date: NaiveDate,
    pub in_count: i64,
    pub out_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthBucket {
    /// `YYYY-MM`.
    pub month: String,
    pub in_count: i64,
    pub out_count: i64,
}

#[derive(FromRow)]
struct EventRow {
    id: i64,
    timestamp: DateTime<Utc>,
    track_id: i64,
    person_id: Option<String>,
    direction: String,
}

impl EventRow {
    fn into_event(self) -> CrossingEvent {
        let direction = match self.direction.as_str() {
            "OUT" => Direction::Out,
            _ => Direction::In,
        };
        CrossingEvent {
            id: self.id,
            timestamp: self.timestamp,
            track_id: self.track_id,
            person_id: self.person_id,
            direction,
        }
    }
}

/// EventStore instance.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the events and meta tables and their indices.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                track_id INTEGER NOT NULL,
                person_id TEXT,
                direction TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp DESC)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_direction ON events (direction)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS meta (schema_version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;
        let have: Option<i64> = sqlx::query("SELECT schema_version FROM meta LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get(0));
        if have.is_none() {
            sqlx::query("INSERT INTO meta (schema_version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Insert one event, retrying transient failures. Returns the assigned
    /// id; the transaction is durable before this returns.
    pub async fn insert(&self, event: &NewEvent) -> Result<i64> {
        let mut last_err = None;
        for attempt in 0..INSERT_ATTEMPTS {
            if attempt > 0 {
                let backoff = (INSERT_BACKOFF_BASE_MS << (attempt - 1)).min(INSERT_BACKOFF_CAP_MS);
                let jitter = rand::thread_rng().gen_range(0..50);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }

            match sqlx::query(
                "INSERT INTO events (timestamp, track_id, person_id, direction) VALUES (?, ?, ?, ?)",
            )
            .bind(event.timestamp)
            .bind(event.track_id)
            .bind(&event.person_id)
            .bind(event.direction.as_str())
            .execute(&self.pool)
            .await
            {
                Ok(result) => return Ok(result.last_insert_rowid()),
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Event insert failed");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::Database(last_err.expect("at least one attempt")))
    }

    /// Newest events first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<CrossingEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, timestamp, track_id, person_id, direction
             FROM events ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    /// Events with `start <= timestamp <= end`, oldest first.
    pub async fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CrossingEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, timestamp, track_id, person_id, direction
             FROM events WHERE timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    /// `(in, out)` totals for the window, end exclusive.
    pub async fn counts_by_direction(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(i64, i64)> {
        let rows = sqlx::query(
            "SELECT direction, COUNT(*) AS n FROM events
             WHERE timestamp >= ? AND timestamp < ? GROUP BY direction",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut in_count = 0;
        let mut out_count = 0;
        for row in rows {
            let direction: String = row.get("direction");
            let n: i64 = row.get("n");
            match direction.as_str() {
                "IN" => in_count = n,
                "OUT" => out_count = n,
                _ => {}
            }
        }
        Ok((in_count, out_count))
    }

    /// Per-hour totals for one local day. Always 24 buckets.
    pub async fn aggregate_by_hour(&self, day: NaiveDate) -> Result<Vec<HourBucket>> {
        let (start, end) = local_day_bounds(day);
        let events = self.range(start, end - chrono::Duration::milliseconds(1)).await?;

        let mut buckets: Vec<HourBucket> = (0..24)
            .map(|hour| HourBucket {
                hour,
                in_count: 0,
                out_count: 0,
            })
            .collect();
        for event in events {
            let hour = event.timestamp.with_timezone(&Local).hour() as usize;
            match event.direction {
                Direction::In => buckets[hour].in_count += 1,
                Direction::Out => buckets[hour].out_count += 1,
            }
        }
        Ok(buckets)
    }

    /// Per-day totals for an inclusive local date range, gaps zero-filled.
    pub async fn aggregate_by_day(
        &self,
        start_day: NaiveDate,
        end_day: NaiveDate,
    ) -> Result<Vec<DayBucket>> {
        let (start, _) = local_day_bounds(start_day);
        let (_, end) = local_day_bounds(end_day);
        let events = self.range(start, end - chrono::Duration::milliseconds(1)).await?;

        let mut buckets: BTreeMap<NaiveDate, (i64, i64)> = BTreeMap::new();
        let mut day = start_day;
        while day <= end_day {
            buckets.insert(day, (0, 0));
            day = day.succ_opt().unwrap_or(day);
            if day == NaiveDate::MAX {
                break;
            }
        }
        for event in events {
            let date = event.timestamp.with_timezone(&Local).date_naive();
            if let Some(bucket) = buckets.get_mut(&date) {
                match event.direction {
                    Direction::In => bucket.0 += 1,
                    Direction::Out => bucket.1 += 1,
                }
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(date, (in_count, out_count))| DayBucket {
                date,
                in_count,
                out_count,
            })
            .collect())
    }

    /// Per-month totals for an inclusive month range, gaps zero-filled.
    /// `start_month` / `end_month` are the first days of the months.
    pub async fn aggregate_by_month(
        &self,
        start_month: NaiveDate,
        end_month: NaiveDate,
    ) -> Result<Vec<MonthBucket>> {
        let (start, _) = local_day_bounds(start_month);
        let end_excl_month = next_month(end_month);
        let (end, _) = local_day_bounds(end_excl_month);
        let events = self.range(start, end - chrono::Duration::milliseconds(1)).await?;

        let mut buckets: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        let mut month = start_month;
        while month <= end_month {
            buckets.insert(format!("{:04}-{:02}", month.year(), month.month()), (0, 0));
            month = next_month(month);
        }
        for event in events {
            let local = event.timestamp.with_timezone(&Local);
            let key = format!("{:04}-{:02}", local.year(), local.month());
            if let Some(bucket) = buckets.get_mut(&key) {
                match event.direction {
                    Direction::In => bucket.0 += 1,
                    Direction::Out => bucket.1 += 1,
                }
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(month, (in_count, out_count))| MonthBucket {
                month,
                in_count,
                out_count,
            })
            .collect())
    }

    /// Timestamp of the oldest stored event, if any.
    pub async fn earliest(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT timestamp FROM events ORDER BY timestamp ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Delete every stored event.
    pub async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events").execute(&self.pool).await?;
        tracing::info!(deleted = result.rows_affected(), "Event store cleared");
        Ok(result.rows_affected())
    }
}

/// `[00:00, 24:00)` of a local calendar day as UTC instants.
pub fn local_day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_local = day.and_hms_opt(0, 0, 0).expect("midnight exists");
    let next = day.succ_opt().unwrap_or(day);
    let end_local = next.and_hms_opt(0, 0, 0).expect("midnight exists");
    let start = Local
        .from_local_datetime(&start_local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&start_local));
    let end = Local
        .from_local_datetime(&end_local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&end_local));
    (start, end)
}

/// First day of the month after `month`.
pub fn next_month(month: NaiveDate) -> NaiveDate {
    let (year, m) = if month.month() == 12 {
        (month.year() + 1, 1)
    } else {
        (month.year(), month.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, m, 1).expect("valid month start")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> EventStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = EventStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    fn local_ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn event_at(ts: DateTime<Utc>, track_id: i64, direction: Direction) -> NewEvent {
        NewEvent {
            timestamp: ts,
            track_id,
            person_id: None,
            direction,
        }
    }

    #[tokio::test]
    async fn insert_assigns_strictly_increasing_ids() {
        let store = store().await;
        let mut last = 0;
        for i in 0..5 {
            let id = store
                .insert(&event_at(Utc::now(), i, Direction::In))
                .await
                .unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let store = store().await;
        let base = local_ts(2024, 3, 15, 10, 0);
        for i in 0..3 {
            store
                .insert(&event_at(base + chrono::Duration::minutes(i), i, Direction::In))
                .await
                .unwrap();
        }
        let events = store.recent(2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp > events[1].timestamp);
    }

    #[tokio::test]
    async fn range_is_inclusive_on_both_ends() {
        let store = store().await;
        let a = local_ts(2024, 3, 15, 10, 0);
        let b = local_ts(2024, 3, 15, 11, 0);
        store.insert(&event_at(a, 1, Direction::In)).await.unwrap();
        store.insert(&event_at(b, 2, Direction::Out)).await.unwrap();

        let events = store.range(a, b).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].track_id, 1);
    }

    #[tokio::test]
    async fn hourly_has_24_zero_filled_buckets() {
        let store = store().await;
        let day = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        store
            .insert(&event_at(local_ts(2024, 3, 15, 8, 30), 1, Direction::In))
            .await
            .unwrap();
        store
            .insert(&event_at(local_ts(2024, 3, 15, 8, 45), 2, Direction::Out))
            .await
            .unwrap();
        // Different day, must not leak in.
        store
            .insert(&event_at(local_ts(2024, 3, 16, 8, 0), 3, Direction::In))
            .await
            .unwrap();

        let buckets = store.aggregate_by_hour(day).await.unwrap();
        assert_eq!(buckets.len(), 24);
        assert_eq!(buckets[8].in_count, 1);
        assert_eq!(buckets[8].out_count, 1);
        assert_eq!(buckets[9].in_count, 0);
    }

    #[tokio::test]
    async fn daily_range_zero_fills_gaps() {
        let store = store().await;
        store
            .insert(&event_at(local_ts(2024, 3, 15, 12, 0), 1, Direction::In))
            .await
            .unwrap();
        store
            .insert(&event_at(local_ts(2024, 3, 17, 12, 0), 2, Direction::Out))
            .await
            .unwrap();

        let start = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 17).unwrap();
        let buckets = store.aggregate_by_day(start, end).await.unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].in_count, 1);
        assert_eq!(buckets[1].in_count, 0);
        assert_eq!(buckets[1].out_count, 0);
        assert_eq!(buckets[2].out_count, 1);
    }

    #[tokio::test]
    async fn monthly_range_zero_fills_gaps() {
        let store = store().await;
        store
            .insert(&event_at(local_ts(2024, 1, 10, 12, 0), 1, Direction::In))
            .await
            .unwrap();
        store
            .insert(&event_at(local_ts(2024, 3, 10, 12, 0), 2, Direction::In))
            .await
            .unwrap();

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let buckets = store.aggregate_by_month(start, end).await.unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].month, "2024-01");
        assert_eq!(buckets[1].in_count, 0);
        assert_eq!(buckets[2].in_count, 1);
    }

    #[tokio::test]
    async fn clear_all_empties_the_table() {
        let store = store().await;
        store
            .insert(&event_at(Utc::now(), 1, Direction::In))
            .await
            .unwrap();
        let deleted = store.clear_all().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn person_id_roundtrips() {
        let store = store().await;
        store
            .insert(&NewEvent {
                timestamp: Utc::now(),
                track_id: 5,
                person_id: Some("P0001".to_string()),
                direction: Direction::In,
            })
            .await
            .unwrap();
        let events = store.recent(1).await.unwrap();
        assert_eq!(events[0].person_id.as_deref(), Some("P0001"));
    }
}

//! Data models shared by the ingest, analysis and alarm jobs.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

// ---

/// Longest window an alarm definition may aggregate over.
pub const MAX_ALARM_WINDOW_SECS: i64 = 366 * 86_400;

/// Earliest timestamp any resumable job starts from when nothing has been
/// persisted yet.
pub fn epoch() -> DateTime<Utc> {
    // ---
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// One raw sample. `(sensor_id, time)` is the natural key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub sensor_id: i32,
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// A completed on→off→on interval of the power signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cycle {
    // ---
    pub start_time: DateTime<Utc>,
    pub on_duration: Duration,
    pub off_duration: Duration,
}

impl Cycle {
    // ---
    /// Time of the on-edge that closed this cycle.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + self.on_duration + self.off_duration
    }
}

/// Converts a duration to fractional seconds for storage.
pub fn duration_to_secs(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

/// Inverse of [`duration_to_secs`], rounded to the millisecond.
pub fn secs_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

/// Rollup bucket width. Buckets are always aligned in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    // ---
    pub fn step(self) -> Duration {
        match self {
            Granularity::Hourly => Duration::hours(1),
            Granularity::Daily => Duration::days(1),
        }
    }

    /// Floor `t` to the start of its bucket (top of the hour, or UTC midnight).
    pub fn truncate(self, t: DateTime<Utc>) -> DateTime<Utc> {
        // ---
        let secs = t.timestamp();
        let width = self.step().num_seconds();
        // Flooring a representable timestamp always stays representable.
        DateTime::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `date_trunc` field name for this granularity.
    pub fn sql_unit(self) -> &'static str {
        match self {
            Granularity::Hourly => "hour",
            Granularity::Daily => "day",
        }
    }

    /// Name of the table holding this granularity's rows.
    pub fn table(self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Per (bucket, sensor) statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, sqlx::FromRow)]
pub struct AggregateRow {
    // ---
    pub bucket: DateTime<Utc>,
    pub sensor_id: i32,
    pub samples: i64,
    pub min_value: f64,
    pub avg_value: f64,
    pub max_value: f64,
}

/// Aggregate function applied to raw values inside an alarm window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateKind {
    Count,
    Avg,
    Min,
    Max,
}

impl AggregateKind {
    // ---
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateKind::Count => "COUNT",
            AggregateKind::Avg => "AVG",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
        }
    }

    /// Applies the aggregate the way SQL does: `COUNT` of nothing is zero,
    /// every other aggregate of nothing is absent.
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        // ---
        if values.is_empty() {
            return match self {
                AggregateKind::Count => Some(0.0),
                _ => None,
            };
        }
        let value = match self {
            AggregateKind::Count => values.len() as f64,
            AggregateKind::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregateKind::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregateKind::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        Some(value)
    }
}

impl FromStr for AggregateKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COUNT" => Ok(AggregateKind::Count),
            "AVG" => Ok(AggregateKind::Avg),
            "MIN" => Ok(AggregateKind::Min),
            "MAX" => Ok(AggregateKind::Max),
            other => Err(anyhow!("unknown aggregate '{}'", other)),
        }
    }
}

/// Health of one alarm definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Unknown,
    Startup,
    TooLow,
    TooHigh,
    Healthy,
}

impl AlarmState {
    // ---
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmState::Unknown => "UNKNOWN",
            AlarmState::Startup => "STARTUP",
            AlarmState::TooLow => "TOO_LOW",
            AlarmState::TooHigh => "TOO_HIGH",
            AlarmState::Healthy => "HEALTHY",
        }
    }

    /// Parses a stored state. Anything unrecognised reads as `Unknown`.
    pub fn from_stored(s: &str) -> Self {
        // ---
        match s.trim() {
            "UNKNOWN" => AlarmState::Unknown,
            "STARTUP" => AlarmState::Startup,
            "TOO_LOW" => AlarmState::TooLow,
            "TOO_HIGH" => AlarmState::TooHigh,
            "HEALTHY" => AlarmState::Healthy,
            other => {
                tracing::warn!("Unrecognised stored alarm state '{}', treating as UNKNOWN", other);
                AlarmState::Unknown
            }
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alarm row exactly as stored in the `alarms` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AlarmRow {
    // ---
    pub id: String,
    pub sensor_id: Option<i32>,
    pub aggregate: String,
    pub window_secs: i64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub message: String,
    pub state: String,
}

/// Validated alarm definition, rebuilt from storage on every evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmDefinition {
    // ---
    pub id: String,
    pub aggregate: AggregateKind,
    pub window: Duration,
    pub sensor_id: Option<i32>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub message: String,
}

impl TryFrom<&AlarmRow> for AlarmDefinition {
    type Error = anyhow::Error;

    fn try_from(row: &AlarmRow) -> Result<Self> {
        // ---
        let aggregate = row.aggregate.parse::<AggregateKind>()?;

        if row.window_secs <= 0 || row.window_secs > MAX_ALARM_WINDOW_SECS {
            bail!(
                "window must be between 1s and {}s, got {}s",
                MAX_ALARM_WINDOW_SECS,
                row.window_secs
            );
        }
        let window = Duration::try_seconds(row.window_secs)
            .ok_or_else(|| anyhow!("window of {}s is out of range", row.window_secs))?;
        if let (Some(min), Some(max)) = (row.min_value, row.max_value) {
            if min > max {
                bail!("min threshold {} exceeds max threshold {}", min, max);
            }
        }

        Ok(AlarmDefinition {
            id: row.id.clone(),
            aggregate,
            window,
            sensor_id: row.sensor_id,
            min: row.min_value,
            max: row.max_value,
            message: row.message.clone(),
        })
    }
}

/// Outbound message produced on an alarm transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    // ---
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

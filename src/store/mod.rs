//! Storage gateway for the analytics core.
//!
//! Every job talks to persistence through the [`Store`] trait so the same
//! algorithms run against PostgreSQL in production and against the
//! in-process [`MemoryStore`] in tests and dry runs. Connection management
//! and query timeouts belong to the implementation, not to the jobs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{AggregateKind, AggregateRow, AlarmRow, AlarmState, Cycle, Granularity, Reading};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// Shared handle to whichever store the process was started with.
pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    // ---
    /// Cheap connectivity check run before each scheduler tick.
    async fn ping(&self) -> Result<()>;

    /// Insert readings, silently skipping `(sensor_id, time)` keys that
    /// already exist. Returns the number of rows actually written.
    async fn insert_readings(&self, readings: &[Reading]) -> Result<u64>;

    /// Up to `limit` readings for one sensor with `time >= since`, ordered
    /// by time.
    async fn readings_since(
        &self,
        sensor_id: i32,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reading>>;

    /// Per (bucket, sensor) statistics over readings with
    /// `start <= time < end`, ordered by bucket then sensor.
    async fn rollup(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRow>>;

    /// End of the most recent cycle, if any cycle has been recorded.
    async fn last_cycle_end(&self) -> Result<Option<DateTime<Utc>>>;

    /// Append cycles. Returns the number of rows written.
    async fn append_cycles(&self, cycles: &[Cycle]) -> Result<u64>;

    /// Start of the newest bucket already stored for `granularity`.
    async fn last_bucket(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>>;

    /// Insert rollup rows, skipping `(bucket, sensor_id)` pairs already stored.
    async fn insert_aggregates(&self, granularity: Granularity, rows: &[AggregateRow])
        -> Result<u64>;

    /// Aggregate raw values with `start <= time <= end`, optionally for one
    /// sensor. `None` means there was no data for an aggregate that needs it.
    async fn aggregate(
        &self,
        kind: AggregateKind,
        sensor_id: Option<i32>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<f64>>;

    /// Every alarm definition together with its persisted state.
    async fn load_alarms(&self) -> Result<Vec<AlarmRow>>;

    async fn update_alarm_state(&self, id: &str, state: AlarmState) -> Result<()>;

    /// Feed (topic) names keyed by sensor id.
    async fn sensor_feeds(&self) -> Result<HashMap<i32, String>>;

    /// Delete up to `limit` readings older than `cutoff`. Returns rows deleted.
    async fn prune_readings(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64>;
}

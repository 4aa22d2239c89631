//! In-process [`Store`] used by the test suite and by `DATABASE_URL=memory://`
//! dry runs. Mirrors the conflict semantics of the PostgreSQL schema.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::Store;
use crate::{AggregateKind, AggregateRow, AlarmRow, AlarmState, Cycle, Granularity, Reading};

// ---

#[derive(Debug, Default)]
struct Tables {
    raw: BTreeMap<(i32, DateTime<Utc>), f64>,
    cycles: BTreeMap<DateTime<Utc>, Cycle>,
    hourly: BTreeMap<(DateTime<Utc>, i32), AggregateRow>,
    daily: BTreeMap<(DateTime<Utc>, i32), AggregateRow>,
    alarms: BTreeMap<String, AlarmRow>,
    sensors: HashMap<i32, String>,
    offline: bool,
}

impl Tables {
    // ---
    fn check_online(&self) -> Result<()> {
        if self.offline {
            bail!("store is offline");
        }
        Ok(())
    }

    fn buckets(&mut self, granularity: Granularity) -> &mut BTreeMap<(DateTime<Utc>, i32), AggregateRow> {
        match granularity {
            Granularity::Hourly => &mut self.hourly,
            Granularity::Daily => &mut self.daily,
        }
    }
}

/// Running statistics for one (bucket, sensor) group.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    samples: i64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    // ---
    fn new(value: f64) -> Self {
        Self { samples: 1, sum: value, min: value, max: value }
    }

    fn add(&mut self, value: f64) {
        self.samples += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the database connection.
    pub async fn set_offline(&self, offline: bool) {
        self.tables.lock().await.offline = offline;
    }

    /// Insert or replace an alarm definition row.
    pub async fn put_alarm(&self, row: AlarmRow) {
        self.tables.lock().await.alarms.insert(row.id.clone(), row);
    }

    pub async fn put_sensor(&self, feed: &str, sensor_id: i32) {
        self.tables.lock().await.sensors.insert(sensor_id, feed.to_string());
    }

    /// Raw readings ordered by time.
    pub async fn readings(&self) -> Vec<Reading> {
        // ---
        let tables = self.tables.lock().await;
        let mut rows: Vec<Reading> = tables
            .raw
            .iter()
            .map(|(&(sensor_id, time), &value)| Reading { sensor_id, time, value })
            .collect();
        rows.sort_by_key(|r| (r.time, r.sensor_id));
        rows
    }

    pub async fn cycles(&self) -> Vec<Cycle> {
        self.tables.lock().await.cycles.values().copied().collect()
    }

    pub async fn aggregates(&self, granularity: Granularity) -> Vec<AggregateRow> {
        self.tables.lock().await.buckets(granularity).values().copied().collect()
    }

    /// Stored state string for an alarm, as the evaluator would read it.
    pub async fn alarm_state(&self, id: &str) -> Option<String> {
        self.tables.lock().await.alarms.get(id).map(|row| row.state.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ---
    async fn ping(&self) -> Result<()> {
        self.tables.lock().await.check_online()
    }

    async fn insert_readings(&self, readings: &[Reading]) -> Result<u64> {
        // ---
        let mut tables = self.tables.lock().await;
        tables.check_online()?;

        let mut written = 0;
        for r in readings {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                tables.raw.entry((r.sensor_id, r.time))
            {
                slot.insert(r.value);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn readings_since(
        &self,
        sensor_id: i32,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reading>> {
        // ---
        let tables = self.tables.lock().await;
        tables.check_online()?;

        Ok(tables
            .raw
            .range((sensor_id, since)..)
            .take_while(|(&(id, _), _)| id == sensor_id)
            .take(limit.max(0) as usize)
            .map(|(&(sensor_id, time), &value)| Reading { sensor_id, time, value })
            .collect())
    }

    async fn rollup(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRow>> {
        // ---
        let tables = self.tables.lock().await;
        tables.check_online()?;

        let mut groups: BTreeMap<(DateTime<Utc>, i32), Accumulator> = BTreeMap::new();
        let in_range = tables.raw.iter().filter(|(&(_, time), _)| time >= start && time < end);
        for (&(sensor_id, time), &value) in in_range {
            groups
                .entry((granularity.truncate(time), sensor_id))
                .and_modify(|acc| acc.add(value))
                .or_insert_with(|| Accumulator::new(value));
        }

        Ok(groups
            .into_iter()
            .map(|((bucket, sensor_id), acc)| AggregateRow {
                bucket,
                sensor_id,
                samples: acc.samples,
                min_value: acc.min,
                avg_value: acc.sum / acc.samples as f64,
                max_value: acc.max,
            })
            .collect())
    }

    async fn last_cycle_end(&self) -> Result<Option<DateTime<Utc>>> {
        // ---
        let tables = self.tables.lock().await;
        tables.check_online()?;
        Ok(tables.cycles.values().next_back().map(Cycle::end_time))
    }

    async fn append_cycles(&self, cycles: &[Cycle]) -> Result<u64> {
        // ---
        let mut tables = self.tables.lock().await;
        tables.check_online()?;

        let mut written = 0;
        for cycle in cycles {
            if !tables.cycles.contains_key(&cycle.start_time) {
                tables.cycles.insert(cycle.start_time, *cycle);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn last_bucket(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>> {
        // ---
        let mut tables = self.tables.lock().await;
        tables.check_online()?;
        Ok(tables.buckets(granularity).keys().map(|&(bucket, _)| bucket).max())
    }

    async fn insert_aggregates(
        &self,
        granularity: Granularity,
        rows: &[AggregateRow],
    ) -> Result<u64> {
        // ---
        let mut tables = self.tables.lock().await;
        tables.check_online()?;

        let buckets = tables.buckets(granularity);
        let mut written = 0;
        for row in rows {
            let key = (row.bucket, row.sensor_id);
            if !buckets.contains_key(&key) {
                buckets.insert(key, *row);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn aggregate(
        &self,
        kind: AggregateKind,
        sensor_id: Option<i32>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        // ---
        let tables = self.tables.lock().await;
        tables.check_online()?;

        let values: Vec<f64> = tables
            .raw
            .iter()
            .filter(|(&(id, time), _)| {
                time >= start && time <= end && sensor_id.map_or(true, |want| want == id)
            })
            .map(|(_, &value)| value)
            .collect();
        Ok(kind.apply(&values))
    }

    async fn load_alarms(&self) -> Result<Vec<AlarmRow>> {
        // ---
        let tables = self.tables.lock().await;
        tables.check_online()?;
        Ok(tables.alarms.values().cloned().collect())
    }

    async fn update_alarm_state(&self, id: &str, state: AlarmState) -> Result<()> {
        // ---
        let mut tables = self.tables.lock().await;
        tables.check_online()?;
        if let Some(row) = tables.alarms.get_mut(id) {
            row.state = state.as_str().to_string();
        }
        Ok(())
    }

    async fn sensor_feeds(&self) -> Result<HashMap<i32, String>> {
        // ---
        let tables = self.tables.lock().await;
        tables.check_online()?;
        Ok(tables.sensors.clone())
    }

    async fn prune_readings(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        // ---
        let mut tables = self.tables.lock().await;
        tables.check_online()?;

        let doomed: Vec<(i32, DateTime<Utc>)> = tables
            .raw
            .keys()
            .filter(|&&(_, time)| time < cutoff)
            .take(limit.max(0) as usize)
            .copied()
            .collect();
        for key in &doomed {
            tables.raw.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}

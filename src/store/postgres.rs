//! PostgreSQL implementation of [`Store`] backed by an sqlx connection pool.
//!
//! Batch writes bind one array per column and expand them with `UNNEST`, so
//! each batch is a single round trip regardless of its size.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::Store;
use crate::models::{duration_to_secs, secs_to_duration};
use crate::{AggregateKind, AggregateRow, AlarmRow, AlarmState, Cycle, Granularity, Reading};

/// Upper bound on rows per cycle insert statement.
const CYCLE_CHUNK: usize = 500;

// ---

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    // ---
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_readings(&self, readings: &[Reading]) -> Result<u64> {
        // ---
        if readings.is_empty() {
            return Ok(0);
        }
        let sensor_ids: Vec<i32> = readings.iter().map(|r| r.sensor_id).collect();
        let times: Vec<DateTime<Utc>> = readings.iter().map(|r| r.time).collect();
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO raw (sensor_id, time, value)
            SELECT * FROM UNNEST($1::INT4[], $2::TIMESTAMPTZ[], $3::FLOAT8[])
            ON CONFLICT (sensor_id, time) DO NOTHING
            "#,
        )
        .bind(&sensor_ids)
        .bind(&times)
        .bind(&values)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn readings_since(
        &self,
        sensor_id: i32,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reading>> {
        // ---
        let rows = sqlx::query_as::<_, Reading>(
            r#"
            SELECT sensor_id, time, value
            FROM   raw
            WHERE  sensor_id = $1 AND time >= $2
            ORDER BY time
            LIMIT  $3
            "#,
        )
        .bind(sensor_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn rollup(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRow>> {
        // ---
        let sql = format!(
            r#"
            SELECT date_trunc('{}', time AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS bucket,
                   sensor_id,
                   COUNT(*)::INT8 AS samples,
                   MIN(value)     AS min_value,
                   AVG(value)     AS avg_value,
                   MAX(value)     AS max_value
            FROM   raw
            WHERE  time >= $1 AND time < $2
            GROUP BY 1, 2
            ORDER BY 1, 2
            "#,
            granularity.sql_unit()
        );

        let rows = sqlx::query_as::<_, AggregateRow>(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn last_cycle_end(&self) -> Result<Option<DateTime<Utc>>> {
        // ---
        let row: Option<(DateTime<Utc>, f64, f64)> = sqlx::query_as(
            r#"
            SELECT start_time, on_duration, off_duration
            FROM   cycles
            ORDER BY start_time DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(start_time, on, off)| {
            Cycle {
                start_time,
                on_duration: secs_to_duration(on),
                off_duration: secs_to_duration(off),
            }
            .end_time()
        }))
    }

    async fn append_cycles(&self, cycles: &[Cycle]) -> Result<u64> {
        // ---
        if cycles.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for chunk in cycles.chunks(CYCLE_CHUNK) {
            let starts: Vec<DateTime<Utc>> = chunk.iter().map(|c| c.start_time).collect();
            let on: Vec<f64> = chunk.iter().map(|c| duration_to_secs(c.on_duration)).collect();
            let off: Vec<f64> = chunk.iter().map(|c| duration_to_secs(c.off_duration)).collect();

            let result = sqlx::query(
                r#"
                INSERT INTO cycles (start_time, on_duration, off_duration)
                SELECT * FROM UNNEST($1::TIMESTAMPTZ[], $2::FLOAT8[], $3::FLOAT8[])
                ON CONFLICT (start_time) DO NOTHING
                "#,
            )
            .bind(&starts)
            .bind(&on)
            .bind(&off)
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn last_bucket(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>> {
        // ---
        let sql = format!("SELECT MAX(bucket) FROM {}", granularity.table());
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(last)
    }

    async fn insert_aggregates(
        &self,
        granularity: Granularity,
        rows: &[AggregateRow],
    ) -> Result<u64> {
        // ---
        if rows.is_empty() {
            return Ok(0);
        }
        let buckets: Vec<DateTime<Utc>> = rows.iter().map(|r| r.bucket).collect();
        let sensor_ids: Vec<i32> = rows.iter().map(|r| r.sensor_id).collect();
        let samples: Vec<i64> = rows.iter().map(|r| r.samples).collect();
        let mins: Vec<f64> = rows.iter().map(|r| r.min_value).collect();
        let avgs: Vec<f64> = rows.iter().map(|r| r.avg_value).collect();
        let maxs: Vec<f64> = rows.iter().map(|r| r.max_value).collect();

        let sql = format!(
            r#"
            INSERT INTO {} (bucket, sensor_id, samples, min_value, avg_value, max_value)
            SELECT * FROM UNNEST($1::TIMESTAMPTZ[], $2::INT4[], $3::INT8[],
                                 $4::FLOAT8[], $5::FLOAT8[], $6::FLOAT8[])
            ON CONFLICT (bucket, sensor_id) DO NOTHING
            "#,
            granularity.table()
        );

        let result = sqlx::query(&sql)
            .bind(&buckets)
            .bind(&sensor_ids)
            .bind(&samples)
            .bind(&mins)
            .bind(&avgs)
            .bind(&maxs)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn aggregate(
        &self,
        kind: AggregateKind,
        sensor_id: Option<i32>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        // ---
        let mut sql = format!(
            "SELECT {}(value)::FLOAT8 FROM raw WHERE time BETWEEN $1 AND $2",
            kind.as_str()
        );
        if sensor_id.is_some() {
            sql.push_str(" AND sensor_id = $3");
        }
        tracing::debug!("Executing {} with ({}, {}, {:?})", sql, start, end, sensor_id);

        let mut query = sqlx::query_scalar::<_, Option<f64>>(&sql).bind(start).bind(end);
        if let Some(sensor_id) = sensor_id {
            query = query.bind(sensor_id);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn load_alarms(&self) -> Result<Vec<AlarmRow>> {
        // ---
        let rows = sqlx::query_as::<_, AlarmRow>(
            r#"
            SELECT id, sensor_id, aggregate, window_secs, min_value, max_value, message, state
            FROM   alarms
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn update_alarm_state(&self, id: &str, state: AlarmState) -> Result<()> {
        // ---
        sqlx::query("UPDATE alarms SET state = $1 WHERE id = $2")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sensor_feeds(&self) -> Result<HashMap<i32, String>> {
        // ---
        let rows: Vec<(String, i32)> = sqlx::query_as("SELECT feed, sensor_id FROM sensors")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(feed, id)| (id, feed)).collect())
    }

    async fn prune_readings(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        // ---
        let result = sqlx::query(
            r#"
            DELETE FROM raw
            WHERE ctid IN (SELECT ctid FROM raw WHERE time < $1 LIMIT $2)
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

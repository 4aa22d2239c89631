//! Database schema management for `humidscope`.
//!
//! Ensures required tables and indexes exist before any job runs.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::{Context, Result};
use sqlx::PgPool;

// ---

/// Statements run, in order, inside one transaction.
const SCHEMA: &[&str] = &[
    // Raw readings; the primary key makes re-delivered readings no-ops
    r#"
    CREATE TABLE IF NOT EXISTS raw (
        sensor_id   INTEGER          NOT NULL,
        time        TIMESTAMPTZ      NOT NULL,
        value       DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (sensor_id, time)
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_raw_time
        ON raw (time);
    "#,
    // Closed duty cycles, durations in seconds
    r#"
    CREATE TABLE IF NOT EXISTS cycles (
        start_time    TIMESTAMPTZ      PRIMARY KEY,
        on_duration   DOUBLE PRECISION NOT NULL CHECK (on_duration >= 0),
        off_duration  DOUBLE PRECISION NOT NULL CHECK (off_duration >= 0)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hourly (
        bucket      TIMESTAMPTZ      NOT NULL,
        sensor_id   INTEGER          NOT NULL,
        samples     BIGINT           NOT NULL,
        min_value   DOUBLE PRECISION NOT NULL,
        avg_value   DOUBLE PRECISION NOT NULL,
        max_value   DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (bucket, sensor_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily (
        bucket      TIMESTAMPTZ      NOT NULL,
        sensor_id   INTEGER          NOT NULL,
        samples     BIGINT           NOT NULL,
        min_value   DOUBLE PRECISION NOT NULL,
        avg_value   DOUBLE PRECISION NOT NULL,
        max_value   DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (bucket, sensor_id)
    );
    "#,
    // Alarm definitions and their last evaluated state
    r#"
    CREATE TABLE IF NOT EXISTS alarms (
        id           TEXT             PRIMARY KEY,
        sensor_id    INTEGER,
        aggregate    TEXT             NOT NULL,
        window_secs  BIGINT           NOT NULL,
        min_value    DOUBLE PRECISION,
        max_value    DOUBLE PRECISION,
        message      TEXT             NOT NULL,
        state        TEXT             NOT NULL DEFAULT 'STARTUP'
    );
    "#,
    // Transport feed name to sensor id
    r#"
    CREATE TABLE IF NOT EXISTS sensors (
        feed        TEXT    PRIMARY KEY,
        sensor_id   INTEGER NOT NULL UNIQUE
    );
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for (i, statement) in SCHEMA.iter().enumerate() {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("schema statement {} failed", i + 1))?;
    }

    tx.commit().await?;
    Ok(())
}

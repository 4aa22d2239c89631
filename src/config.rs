//! Configuration loader for the `humidscope` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Alarm definitions are not configuration: they live
//! in the `alarms` table and are re-read on every evaluation.
use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::cycles::CycleConfig;

/// Parse an optional environment variable of type `$ty` with a default value.
macro_rules! parse_env {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional whole-seconds environment variable into a [`Duration`].
macro_rules! parse_env_secs {
    ($lookup:expr, $var_name:expr, $default:expr) => {
        Duration::from_secs(parse_env!($lookup, $var_name, u64, $default))
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($lookup:expr, $var_name:expr) => {
        $lookup($var_name)
            .ok_or_else(|| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Upper bound for `RETENTION_DAYS`.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// `DATABASE_URL` value that selects the in-process store.
pub const MEMORY_DB_URL: &str = "memory://";

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string, or `memory://`.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// How long a job waits for a pooled connection before failing its tick.
    pub db_acquire_timeout: Duration,

    /// Port for the health/ingest HTTP listener.
    pub http_port: u16,

    /// Readings buffered between ingest ticks before new ones are dropped.
    pub ingest_queue_capacity: usize,

    pub ingest_interval: Duration,
    pub alarm_interval: Duration,
    pub delivery_interval: Duration,

    /// Interval for cycle detection and the hourly rollup.
    pub analysis_interval: Duration,

    pub daily_interval: Duration,
    pub prune_interval: Duration,

    /// Duty-cycle detector tuning.
    pub cycles: CycleConfig,

    /// Days of raw readings to keep.
    pub retention_days: u32,

    pub notify_sender: String,
    pub notify_recipients: Vec<String>,

    /// Make every job due immediately at startup.
    pub run_all_on_start: bool,

    /// Pause after a failed connectivity check.
    pub fallback_delay: Duration,
}

/// Load configuration from the process environment.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string (`memory://` for an in-process store)
///
/// Everything else is optional; see [`load_with`] for the full list and defaults.
pub fn load_from_env() -> Result<Config> {
    load_with(|name| env::var(name).ok())
}

/// Load configuration through an arbitrary variable lookup.
///
/// Optional variables and defaults:
/// - `DB_POOL_MAX` (5), `DB_ACQUIRE_TIMEOUT_SECS` (10), `HTTP_PORT` (8080)
/// - `INGEST_QUEUE_CAPACITY` (10000)
/// - `INGEST_INTERVAL_SECS` (60), `ALARM_INTERVAL_SECS` (300),
///   `DELIVERY_INTERVAL_SECS` (60), `ANALYSIS_INTERVAL_SECS` (3600),
///   `DAILY_INTERVAL_SECS` (86400), `PRUNE_INTERVAL_SECS` (86400)
/// - `CYCLE_SENSOR_ID` (3), `CYCLE_THRESHOLD` (200), `CYCLE_MAX_GAP_SECS` (120)
/// - `RETENTION_DAYS` (90)
/// - `NOTIFY_SENDER` (`humidscope@localhost`), `NOTIFY_RECIPIENTS` (comma separated)
/// - `RUN_ALL_ON_START` (false), `FALLBACK_DELAY_SECS` (60)
pub fn load_with<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    // ---
    let db_url = require_env!(lookup, "DATABASE_URL");
    let db_pool_max = parse_env!(lookup, "DB_POOL_MAX", u32, 5);
    let db_acquire_timeout = parse_env_secs!(lookup, "DB_ACQUIRE_TIMEOUT_SECS", 10);
    let http_port = parse_env!(lookup, "HTTP_PORT", u16, 8080);
    let ingest_queue_capacity = parse_env!(lookup, "INGEST_QUEUE_CAPACITY", usize, 10_000);

    let ingest_interval = parse_env_secs!(lookup, "INGEST_INTERVAL_SECS", 60);
    let alarm_interval = parse_env_secs!(lookup, "ALARM_INTERVAL_SECS", 300);
    let delivery_interval = parse_env_secs!(lookup, "DELIVERY_INTERVAL_SECS", 60);
    let analysis_interval = parse_env_secs!(lookup, "ANALYSIS_INTERVAL_SECS", 3_600);
    let daily_interval = parse_env_secs!(lookup, "DAILY_INTERVAL_SECS", 86_400);
    let prune_interval = parse_env_secs!(lookup, "PRUNE_INTERVAL_SECS", 86_400);

    let cycle_sensor_id = parse_env!(lookup, "CYCLE_SENSOR_ID", i32, 3);
    let cycle_threshold = parse_env!(lookup, "CYCLE_THRESHOLD", f64, 200.0);
    let cycle_max_gap = parse_env!(lookup, "CYCLE_MAX_GAP_SECS", i64, 120);

    let retention_days = parse_env!(lookup, "RETENTION_DAYS", u32, 90);
    let notify_sender = lookup("NOTIFY_SENDER").unwrap_or_else(|| "humidscope@localhost".to_string());
    let notify_recipients = lookup("NOTIFY_RECIPIENTS")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let run_all_on_start = lookup("RUN_ALL_ON_START")
        .map(|v| parse_flag("RUN_ALL_ON_START", &v))
        .transpose()?
        .unwrap_or(false);
    let fallback_delay = parse_env_secs!(lookup, "FALLBACK_DELAY_SECS", 60);

    if !cycle_threshold.is_finite() {
        bail!("Invalid CYCLE_THRESHOLD: {} is not a finite number", cycle_threshold);
    }
    if cycle_max_gap <= 0 {
        bail!("Invalid CYCLE_MAX_GAP_SECS: must be positive");
    }
    let cycle_max_gap = chrono::Duration::try_seconds(cycle_max_gap)
        .ok_or_else(|| anyhow!("Invalid CYCLE_MAX_GAP_SECS: {} is out of range", cycle_max_gap))?;
    if retention_days > MAX_RETENTION_DAYS {
        bail!("Invalid RETENTION_DAYS: must be at most {}", MAX_RETENTION_DAYS);
    }
    for (name, interval) in [
        ("INGEST_INTERVAL_SECS", ingest_interval),
        ("ALARM_INTERVAL_SECS", alarm_interval),
        ("DELIVERY_INTERVAL_SECS", delivery_interval),
        ("ANALYSIS_INTERVAL_SECS", analysis_interval),
        ("DAILY_INTERVAL_SECS", daily_interval),
        ("PRUNE_INTERVAL_SECS", prune_interval),
    ] {
        if interval.is_zero() {
            bail!("Invalid {}: must be positive", name);
        }
    }

    Ok(Config {
        db_url,
        db_pool_max,
        db_acquire_timeout,
        http_port,
        ingest_queue_capacity,
        ingest_interval,
        alarm_interval,
        delivery_interval,
        analysis_interval,
        daily_interval,
        prune_interval,
        cycles: CycleConfig {
            sensor_id: cycle_sensor_id,
            threshold: cycle_threshold,
            max_gap: cycle_max_gap,
        },
        retention_days,
        notify_sender,
        notify_recipients,
        run_all_on_start,
        fallback_delay,
    })
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    // ---
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(anyhow!("Invalid {}: '{}' is not a boolean", name, other)),
    }
}

/// Replace the password portion of a connection URL with `****`.
pub fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // A colon that belongs to the scheme separator is not a password
            if !db_url[colon_pos..].starts_with("://") {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}

impl Config {
    /// Whether the in-process store was requested.
    pub fn uses_memory_store(&self) -> bool {
        self.db_url == MEMORY_DB_URL
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL           : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX            : {}", self.db_pool_max);
        tracing::info!("  DB_ACQUIRE_TIMEOUT     : {:?}", self.db_acquire_timeout);
        tracing::info!("  HTTP_PORT              : {}", self.http_port);
        tracing::info!("  INGEST_QUEUE_CAPACITY  : {}", self.ingest_queue_capacity);
        tracing::info!("  INGEST_INTERVAL        : {:?}", self.ingest_interval);
        tracing::info!("  ALARM_INTERVAL         : {:?}", self.alarm_interval);
        tracing::info!("  DELIVERY_INTERVAL      : {:?}", self.delivery_interval);
        tracing::info!("  ANALYSIS_INTERVAL      : {:?}", self.analysis_interval);
        tracing::info!("  DAILY_INTERVAL         : {:?}", self.daily_interval);
        tracing::info!("  PRUNE_INTERVAL         : {:?}", self.prune_interval);
        tracing::info!("  CYCLE_SENSOR_ID        : {}", self.cycles.sensor_id);
        tracing::info!("  CYCLE_THRESHOLD        : {}", self.cycles.threshold);
        tracing::info!("  CYCLE_MAX_GAP          : {}s", self.cycles.max_gap.num_seconds());
        tracing::info!("  RETENTION_DAYS         : {}", self.retention_days);
        tracing::info!("  NOTIFY_SENDER          : {}", self.notify_sender);
        tracing::info!("  NOTIFY_RECIPIENTS      : {}", self.notify_recipients.join(", "));
        tracing::info!("  RUN_ALL_ON_START       : {}", self.run_all_on_start);
        tracing::info!("  FALLBACK_DELAY         : {:?}", self.fallback_delay);
    }
}

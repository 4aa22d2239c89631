//! Application entry point for the `humidscope` service.
//!
//! This binary orchestrates the full startup sequence for the analytics core:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool and creating the schema
//!   (or, with `DATABASE_URL=memory://`, an in-process store)
//! - Serving the health and ingest routes via the `routes` gateway (EMBP pattern)
//! - Running the job scheduler until the process is interrupted
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `HUMIDSCOPE_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `HUMIDSCOPE_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See [`humidscope::config`] for the remaining tuning variables.
use std::collections::HashMap;
use std::future::IntoFuture;
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Result;
use chrono::Utc;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use humidscope::routes::{self, HttpState};
use humidscope::{
    config, ingest, schema, AppContext, Config, LogNotifier, MemoryStore, Outbox, PgStore,
    Scheduler, SharedStore,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let store = open_store(&cfg).await?;

    // Feed names are resolved once; new sensors need a restart
    let feeds: HashMap<String, i32> = store
        .sensor_feeds()
        .await?
        .into_iter()
        .map(|(id, feed)| (feed, id))
        .collect();
    tracing::info!("Loaded {} sensor feed mappings", feeds.len());

    let (ingest, batcher) = ingest::channel(cfg.ingest_queue_capacity);
    let app = routes::router(HttpState { ingest, feeds: Arc::new(feeds) });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let notifier = Box::new(LogNotifier::new(cfg.notify_sender.clone()));
    let ctx = AppContext { store, outbox: Outbox::new(), config: cfg };
    let scheduler = Scheduler::new(ctx, batcher, notifier, Utc::now());

    tokio::select! {
        served = axum::serve(listener, app).into_future() => served?,
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
    }

    Ok(())
}

/// Connect to the configured store, creating the schema when it is PostgreSQL.
async fn open_store(cfg: &Config) -> Result<SharedStore> {
    // ---
    if cfg.uses_memory_store() {
        tracing::warn!("Using in-process store; nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }

    tracing::info!("Attempting to connect to database: {}", config::mask_db_url(&cfg.db_url));

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .acquire_timeout(cfg.db_acquire_timeout)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database '{}': {}",
                config::mask_db_url(&cfg.db_url),
                e
            )
        })?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;
    Ok(Arc::new(PgStore::new(pool)))
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `HUMIDSCOPE_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, else the `HUMIDSCOPE_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("HUMIDSCOPE_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to HUMIDSCOPE_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("HUMIDSCOPE_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}

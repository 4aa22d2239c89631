//! Analytics and alarm core for the humidscope sensor pipeline.
//!
//! Readings arrive through an [`IngestHandle`] and are flushed to the store in
//! batches. Periodic jobs derive duty cycles from the power signal, roll raw
//! readings up into hourly and daily aggregates, and evaluate alarm
//! definitions, queueing a [`Notification`] whenever an alarm changes state.
//! All jobs are sequenced by a single [`Scheduler`].
//!
//! Modules follow the Explicit Module Boundary Pattern (EMBP): siblings
//! import shared types from the crate root rather than from each other.

pub mod alarm;
pub mod config;
pub mod cycles;
pub mod ingest;
pub mod models;
pub mod notify;
pub mod retention;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod summary;

pub use config::Config;
pub use ingest::{IngestBatcher, IngestHandle};
pub use models::{
    AggregateKind, AggregateRow, AlarmDefinition, AlarmRow, AlarmState, Cycle, Granularity,
    Notification, Reading,
};
pub use notify::{LogNotifier, Notifier, Outbox};
pub use scheduler::{AppContext, Scheduler};
pub use store::{MemoryStore, PgStore, SharedStore, Store};

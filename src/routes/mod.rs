//! HTTP gateway: merges the per-endpoint subrouters and attaches shared state.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;

use crate::IngestHandle;

mod health;
mod readings;

// ---

/// State shared by the HTTP handlers.
#[derive(Debug, Clone)]
pub struct HttpState {
    // ---
    /// Producer side of the ingest queue.
    pub ingest: IngestHandle,

    /// Sensor ids keyed by feed (topic) name, loaded once at startup.
    pub feeds: Arc<HashMap<String, i32>>,
}

pub fn router(state: HttpState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(health::router())
        .with_state(state)
}

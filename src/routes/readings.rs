//! `POST /readings`: HTTP transport adapter in front of the ingest queue.
//!
//! Readings are queued, not written: they reach the store on the next ingest
//! tick. Readings that cannot be attributed to a sensor, or that the queue
//! refuses, are counted as dropped rather than failing the request.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::HttpState;

// ---

pub fn router() -> Router<HttpState> {
    // ---
    Router::new().route("/readings", post(handler))
}

/// One reading as posted by a sensor bridge.
#[derive(Debug, Deserialize)]
pub struct ReadingInput {
    // ---
    /// Sensor id; takes precedence over `feed` when both are given.
    sensor_id: Option<i32>,

    /// Feed/topic name resolved through the `sensors` table.
    feed: Option<String>,

    /// Sample time; defaults to the receive time.
    time: Option<DateTime<Utc>>,

    value: f64,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: usize,
    dropped: usize,
}

async fn handler(
    State(state): State<HttpState>,
    Json(inputs): Json<Vec<ReadingInput>>,
) -> impl IntoResponse {
    // ---
    let now = Utc::now();
    // Receive time is recorded to whole seconds
    let received = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);

    let mut accepted = 0;
    for input in &inputs {
        let sensor_id = match (input.sensor_id, input.feed.as_deref()) {
            (Some(id), _) => Some(id),
            (None, Some(feed)) => {
                let id = state.feeds.get(feed).copied();
                if id.is_none() {
                    warn!("Ignoring unknown feed {}", feed);
                }
                id
            }
            (None, None) => {
                warn!("Ignoring reading without sensor_id or feed");
                None
            }
        };

        if let Some(sensor_id) = sensor_id {
            if state.ingest.push(sensor_id, input.time.unwrap_or(received), input.value) {
                accepted += 1;
            }
        }
    }

    let dropped = inputs.len() - accepted;
    debug!("POST /readings - accepted {}, dropped {}", accepted, dropped);
    (StatusCode::ACCEPTED, Json(IngestResponse { accepted, dropped }))
}

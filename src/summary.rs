//! Hourly and daily rollups of raw readings.
//!
//! Each run resumes one bucket after the newest stored bucket and stops at the
//! start of the current (still filling) bucket, so every bucket is written
//! exactly once. Buckets are aligned in UTC. The grouping itself is done by
//! the store, so raw readings never leave it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::epoch;
use crate::{Granularity, Store};

// ---

/// Roll up every completed bucket of `granularity` not yet stored.
/// Returns the number of rows written.
pub async fn summarize(store: &dyn Store, granularity: Granularity, now: DateTime<Utc>) -> Result<u64> {
    // ---
    let start = match store.last_bucket(granularity).await? {
        Some(last) => last + granularity.step(),
        None => epoch(),
    };
    let end = granularity.truncate(now);

    if start >= end {
        info!("No completed {} buckets since {}", granularity, start);
        return Ok(0);
    }

    info!("Generating {} records between {} and {}", granularity, start, end);
    let rows = store.rollup(granularity, start, end).await?;

    let written = store.insert_aggregates(granularity, &rows).await?;
    info!("Wrote {} {} records", written, granularity);
    Ok(written)
}

//! Raw-reading retention.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::{Granularity, Store};

/// Rows removed per delete statement.
pub const PRUNE_BATCH: i64 = 5_000;

// ---

/// Oldest timestamp kept: UTC midnight `retention_days` before `now`.
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> Result<DateTime<Utc>> {
    // ---
    Duration::try_days(i64::from(retention_days))
        .and_then(|span| Granularity::Daily.truncate(now).checked_sub_signed(span))
        .ok_or_else(|| anyhow!("retention of {} days reaches before the calendar", retention_days))
}

/// Delete raw readings older than the retention horizon in bounded batches.
/// Returns the total number of rows deleted.
pub async fn prune_raw(store: &dyn Store, now: DateTime<Utc>, retention_days: u32) -> Result<u64> {
    // ---
    let oldest = retention_cutoff(now, retention_days)?;
    info!("Pruning raw records older than {}", oldest.to_rfc3339());

    let mut total = 0;
    loop {
        let deleted = store.prune_readings(oldest, PRUNE_BATCH).await?;
        total += deleted;
        if deleted < PRUNE_BATCH as u64 {
            break;
        }
    }

    info!("Pruned {} records", total);
    Ok(total)
}

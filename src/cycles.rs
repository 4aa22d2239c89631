//! Duty-cycle detection for the compressor power signal.
//!
//! Power readings are thresholded into on/off and scanned in time order. A
//! cycle is only recorded once the on-edge that closes it has been seen, and
//! any cycle that would span a gap in the data is thrown away. Each run picks
//! up at the end of the last recorded cycle, so repeated runs only ever append.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::models::epoch;
use crate::{Cycle, Store};

/// Readings fetched per store round trip.
pub const READING_PAGE: i64 = 10_000;

// ---

/// Tuning for the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleConfig {
    // ---
    /// Sensor carrying the power signal.
    pub sensor_id: i32,

    /// Readings at or above this value count as "on".
    pub threshold: f64,

    /// Longest tolerated spacing between consecutive readings.
    pub max_gap: Duration,
}

/// Incremental on/off edge tracker.
#[derive(Debug, Clone)]
pub struct CycleScanner {
    config: CycleConfig,
    was_on: bool,
    was_time: DateTime<Utc>,
    on_time: Option<DateTime<Utc>>,
    off_time: Option<DateTime<Utc>>,
}

impl CycleScanner {
    // ---
    pub fn new(config: CycleConfig, resume: DateTime<Utc>) -> Self {
        Self {
            config,
            was_on: false,
            was_time: resume,
            on_time: None,
            off_time: None,
        }
    }

    /// Feed the next reading. Returns the cycle closed by this reading, if
    /// any. Readings must arrive in time order; a reading older than its
    /// predecessor is rejected.
    pub fn feed(&mut self, time: DateTime<Utc>, power: f64) -> Result<Option<Cycle>> {
        // ---
        if time < self.was_time {
            bail!("reading at {} precedes previous reading at {}", time, self.was_time);
        }
        let is_on = power >= self.config.threshold;

        if time - self.was_time > self.config.max_gap {
            warn!("Data gap between {} and {}. Discarding cycles.", self.was_time, time);
            self.on_time = None;
            self.off_time = None;
            // Don't start the next cycle until an off->on edge is observed
            self.was_on = true;
        }

        let mut closed = None;
        if !self.was_on && is_on {
            debug!("Turned on at {}", time);
            if let (Some(on_time), Some(off_time)) = (self.on_time, self.off_time) {
                let cycle = Cycle {
                    start_time: on_time,
                    on_duration: off_time - on_time,
                    off_duration: time - off_time,
                };
                debug!(
                    "Closed cycle {},{},{}",
                    cycle.start_time.to_rfc3339(),
                    cycle.on_duration.num_seconds(),
                    cycle.off_duration.num_seconds()
                );
                closed = Some(cycle);
            }
            self.on_time = Some(time);
            self.off_time = None;
        } else if self.was_on && !is_on {
            debug!("Turned off at {}", time);
            self.off_time = Some(time);
        }

        self.was_time = time;
        self.was_on = is_on;
        Ok(closed)
    }
}

/// Scheduled job feeding a [`CycleScanner`] page by page, with resume-point
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct DutyCycleDetector {
    config: CycleConfig,
    page_size: i64,
}

impl DutyCycleDetector {
    // ---
    pub fn new(config: CycleConfig) -> Self {
        Self { config, page_size: READING_PAGE }
    }

    /// Override the number of readings fetched per query (at least 2).
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(2);
        self
    }

    /// Detect and append every cycle closed since the last recorded one.
    /// Returns the number of cycles written.
    ///
    /// Readings are pulled in time-ordered pages; cycles are only appended
    /// once the whole range has scanned cleanly.
    pub async fn run(&self, store: &dyn Store) -> Result<u64> {
        // ---
        let start = store.last_cycle_end().await?.unwrap_or_else(epoch);
        info!("Detecting cycles since {}", start);

        let mut scanner = CycleScanner::new(self.config, start);
        let mut cycles = Vec::new();
        let mut from = start;
        let mut seen: Option<DateTime<Utc>> = None;
        let mut scanned = 0;

        loop {
            let page = store.readings_since(self.config.sensor_id, from, self.page_size).await?;
            // Each page after the first starts with the last reading of the previous one
            for r in page.iter().filter(|r| seen.map_or(true, |last| r.time > last)) {
                if let Some(cycle) = scanner.feed(r.time, r.value)? {
                    cycles.push(cycle);
                }
                scanned += 1;
            }

            match page.last() {
                Some(last) if page.len() as i64 >= self.page_size => {
                    from = last.time;
                    seen = Some(last.time);
                }
                _ => break,
            }
        }

        let written = store.append_cycles(&cycles).await?;
        info!("Wrote {} cycle records from {} readings", written, scanned);
        Ok(written)
    }
}

//! Reading ingestion: a bounded queue between the transport and the store.
//!
//! Producers (transport callbacks, the HTTP adapter) call
//! [`IngestHandle::push`], which never blocks. The scheduler owns the single
//! [`IngestBatcher`] and flushes everything queued since the previous tick in
//! one batched insert.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, info, warn};

use crate::{Reading, Store};

// ---

/// Create a connected producer handle and batcher sharing a queue of
/// `capacity` readings.
pub fn channel(capacity: usize) -> (IngestHandle, IngestBatcher) {
    // ---
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngestHandle { tx }, IngestBatcher { rx })
}

/// Cloneable, non-blocking entry point for new readings.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Reading>,
}

impl IngestHandle {
    // ---
    /// Queue one reading. Returns `false` when the reading was dropped,
    /// either because its value is not a finite number or because the queue
    /// is full.
    pub fn push(&self, sensor_id: i32, time: DateTime<Utc>, value: f64) -> bool {
        // ---
        if !value.is_finite() {
            warn!("Dropping reading for sensor {} at {}: value {} is not a number", sensor_id, time, value);
            return false;
        }

        match self.tx.try_send(Reading { sensor_id, time, value }) {
            Ok(()) => {
                debug!("Queued {}, {}, {}", time, sensor_id, value);
                true
            }
            Err(TrySendError::Full(r)) => {
                warn!("Ingest queue full, dropping reading for sensor {} at {}", r.sensor_id, r.time);
                false
            }
            Err(TrySendError::Closed(r)) => {
                warn!("Ingest queue closed, dropping reading for sensor {} at {}", r.sensor_id, r.time);
                false
            }
        }
    }
}

/// Single consumer side of the ingest queue.
#[derive(Debug)]
pub struct IngestBatcher {
    rx: mpsc::Receiver<Reading>,
}

impl IngestBatcher {
    // ---
    /// Take everything currently queued without waiting for more.
    pub fn drain(&mut self) -> Vec<Reading> {
        // ---
        let mut batch = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(reading) => batch.push(reading),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }

    /// Drain the queue and write it as one batch. Readings whose key already
    /// exists are skipped by the store. Returns the number of rows written.
    ///
    /// A failed write loses the drained batch; the error is left to the
    /// scheduler.
    pub async fn flush(&mut self, store: &dyn Store) -> Result<u64> {
        // ---
        let batch = self.drain();
        if batch.is_empty() {
            debug!("Inserted 0 data points");
            return Ok(0);
        }

        debug!("Inserting {} queued readings", batch.len());
        let written = store.insert_readings(&batch).await?;
        info!("Inserted {} of {} data points", written, batch.len());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, 18, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_non_finite_values_are_dropped() {
        // ---
        let (handle, mut batcher) = channel(8);
        assert!(!handle.push(1, at(0), f64::NAN));
        assert!(!handle.push(1, at(1), f64::INFINITY));
        assert!(handle.push(1, at(2), 41.5));

        let batch = batcher.drain();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, 41.5);
    }

    #[test]
    fn test_full_queue_drops_newest() {
        // ---
        let (handle, mut batcher) = channel(2);
        assert!(handle.push(1, at(0), 1.0));
        assert!(handle.push(1, at(1), 2.0));
        assert!(!handle.push(1, at(2), 3.0));

        let values: Vec<f64> = batcher.drain().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);

        // Space is available again after the drain
        assert!(handle.push(1, at(3), 4.0));
    }

    #[test]
    fn test_flush_writes_batch_and_skips_duplicates() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let (handle, mut batcher) = channel(16);

            handle.push(1, at(0), 20.0);
            handle.push(2, at(0), 21.0);
            handle.push(1, at(60), 22.0);
            assert_eq!(batcher.flush(&store).await.unwrap(), 3);

            // Same key again plus one new reading
            handle.push(1, at(0), 99.0);
            handle.push(1, at(120), 23.0);
            assert_eq!(batcher.flush(&store).await.unwrap(), 1);

            let stored = store.readings().await;
            assert_eq!(stored.len(), 4);
            assert_eq!(stored[0].value, 20.0);
        });
    }

    #[test]
    fn test_empty_flush_does_not_touch_store() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.set_offline(true).await;
            let (_handle, mut batcher) = channel(4);

            // An offline store would fail any write
            assert_eq!(batcher.flush(&store).await.unwrap(), 0);
        });
    }

    #[test]
    fn test_failed_flush_propagates_error() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.set_offline(true).await;
            let (handle, mut batcher) = channel(4);

            handle.push(1, at(0), 1.0);
            assert!(batcher.flush(&store).await.is_err());
            assert!(batcher.drain().is_empty());
        });
    }
}

//! Job table and the single loop that runs it.
//!
//! Every analytic job runs on this one task, one after another, so no two
//! jobs ever touch the store at the same time. Before any due job runs, the
//! store gets a connectivity check; if that fails the whole tick is skipped
//! and retried after a fixed delay. A job that fails, or panics, is logged
//! and simply tried again on its next interval.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info};

use crate::alarm::AlarmEvaluator;
use crate::cycles::DutyCycleDetector;
use crate::ingest::IngestBatcher;
use crate::notify::{deliver_pending, Notifier, Outbox};
use crate::retention::prune_raw;
use crate::summary::summarize;
use crate::{Config, Granularity, SharedStore};

// ---

/// Process-wide handles shared by the jobs, built once in `main`.
#[derive(Clone)]
pub struct AppContext {
    pub store: SharedStore,
    pub outbox: Outbox,
    pub config: Config,
}

/// Scheduled jobs, in the order they run when due together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Ingest,
    Alarms,
    Delivery,
    Cycles,
    Hourly,
    Daily,
    Prune,
}

impl Job {
    // ---
    pub const ALL: [Job; 7] = [
        Job::Ingest,
        Job::Alarms,
        Job::Delivery,
        Job::Cycles,
        Job::Hourly,
        Job::Daily,
        Job::Prune,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Job::Ingest => "ingest",
            Job::Alarms => "alarms",
            Job::Delivery => "delivery",
            Job::Cycles => "cycles",
            Job::Hourly => "hourly_summary",
            Job::Daily => "daily_summary",
            Job::Prune => "prune_raw",
        }
    }

    fn interval(self, config: &Config) -> Duration {
        match self {
            Job::Ingest => config.ingest_interval,
            Job::Alarms => config.alarm_interval,
            Job::Delivery => config.delivery_interval,
            Job::Cycles | Job::Hourly => config.analysis_interval,
            Job::Daily => config.daily_interval,
            Job::Prune => config.prune_interval,
        }
    }
}

/// One row of the job table.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub job: Job,
    pub interval: Duration,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub runs: u64,
    pub failures: u64,
}

/// Outcome of one [`Scheduler::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs that ran, in order, with whether each succeeded.
    pub ran: Vec<(Job, bool)>,

    /// Whether the tick was skipped because the store was unreachable.
    pub store_unavailable: bool,

    /// How long to wait before the next tick.
    pub sleep: Duration,
}

fn advance(from: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    // ---
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|step| from.checked_add_signed(step))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct Scheduler {
    ctx: AppContext,
    batcher: IngestBatcher,
    detector: DutyCycleDetector,
    evaluator: AlarmEvaluator,
    notifier: Box<dyn Notifier>,
    jobs: Vec<JobEntry>,
}

impl Scheduler {
    // ---
    /// Build the job table. With `run_all_on_start` every job is due at
    /// `now`; otherwise each first runs one interval from `now`.
    pub fn new(
        ctx: AppContext,
        batcher: IngestBatcher,
        notifier: Box<dyn Notifier>,
        now: DateTime<Utc>,
    ) -> Self {
        // ---
        let jobs = Job::ALL
            .iter()
            .map(|&job| {
                let interval = job.interval(&ctx.config);
                let next_run = if ctx.config.run_all_on_start { now } else { advance(now, interval) };
                JobEntry { job, interval, next_run, last_run: None, runs: 0, failures: 0 }
            })
            .collect();

        Self {
            detector: DutyCycleDetector::new(ctx.config.cycles),
            evaluator: AlarmEvaluator::new(ctx.config.notify_recipients.clone()),
            ctx,
            batcher,
            notifier,
            jobs,
        }
    }

    pub fn jobs(&self) -> &[JobEntry] {
        &self.jobs
    }

    /// Due jobs at `now`, in declaration order.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<Job> {
        self.jobs.iter().filter(|e| e.next_run <= now).map(|e| e.job).collect()
    }

    /// Time until the earliest job is due, zero if one is already due.
    pub fn idle_time(&self, now: DateTime<Utc>) -> Duration {
        // ---
        self.jobs
            .iter()
            .map(|e| e.next_run)
            .min()
            .map(|next| (next - now).to_std().unwrap_or_default())
            .unwrap_or(Duration::ZERO)
    }

    /// Run every job due at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        // ---
        let due = self.due_jobs(now);
        if due.is_empty() {
            return TickReport { ran: Vec::new(), store_unavailable: false, sleep: self.idle_time(now) };
        }

        if let Err(e) = self.ctx.store.ping().await {
            error!("Store health check failed, skipping {} due job(s): {:#}", due.len(), e);
            return TickReport {
                ran: Vec::new(),
                store_unavailable: true,
                sleep: self.ctx.config.fallback_delay,
            };
        }

        let mut ran = Vec::with_capacity(due.len());
        for job in due {
            debug!("Running job {}", job.name());
            let outcome = AssertUnwindSafe(self.run_job(job, now))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow!("job panicked")));
            let ok = outcome.is_ok();
            if let Err(e) = outcome {
                error!("Job {} failed: {:#}", job.name(), e);
            }

            if let Some(entry) = self.jobs.iter_mut().find(|e| e.job == job) {
                entry.runs += 1;
                if !ok {
                    entry.failures += 1;
                }
                entry.last_run = Some(now);
                entry.next_run = advance(now, entry.interval);
            }
            ran.push((job, ok));
        }

        TickReport { ran, store_unavailable: false, sleep: self.idle_time(now) }
    }

    async fn run_job(&mut self, job: Job, now: DateTime<Utc>) -> Result<()> {
        // ---
        let store = Arc::clone(&self.ctx.store);
        match job {
            Job::Ingest => {
                self.batcher.flush(store.as_ref()).await?;
            }
            Job::Alarms => {
                self.evaluator.run(store.as_ref(), &self.ctx.outbox, now).await?;
            }
            Job::Delivery => {
                deliver_pending(&self.ctx.outbox, self.notifier.as_ref()).await;
            }
            Job::Cycles => {
                self.detector.run(store.as_ref()).await?;
            }
            Job::Hourly => {
                summarize(store.as_ref(), Granularity::Hourly, now).await?;
            }
            Job::Daily => {
                summarize(store.as_ref(), Granularity::Daily, now).await?;
            }
            Job::Prune => {
                prune_raw(store.as_ref(), now, self.ctx.config.retention_days).await?;
            }
        }
        Ok(())
    }

    /// Run forever: tick, then sleep until the next job is due.
    pub async fn run(mut self) {
        // ---
        info!("Starting scheduler with {} jobs", self.jobs.len());
        loop {
            let report = self.tick(Utc::now()).await;
            if !report.ran.is_empty() {
                debug!("Tick ran {} job(s)", report.ran.len());
            }
            if !report.sleep.is_zero() {
                tokio::time::sleep(report.sleep).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::{load_with, MEMORY_DB_URL};
    use crate::ingest;
    use crate::notify::LogNotifier;
    use crate::{AlarmRow, MemoryStore, Store};
    use chrono::TimeZone;

    fn config(run_all: bool) -> Config {
        // ---
        let run_all = if run_all { "true" } else { "false" };
        load_with(|name| match name {
            "DATABASE_URL" => Some(MEMORY_DB_URL.to_string()),
            "RUN_ALL_ON_START" => Some(run_all.to_string()),
            "FALLBACK_DELAY_SECS" => Some("15".to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 10, 30, 0).unwrap()
    }

    fn scheduler(store: Arc<MemoryStore>, run_all: bool) -> (Scheduler, ingest::IngestHandle, Outbox) {
        // ---
        let cfg = config(run_all);
        let (handle, batcher) = ingest::channel(cfg.ingest_queue_capacity);
        let outbox = Outbox::new();
        let ctx = AppContext { store, outbox: outbox.clone(), config: cfg };
        let sched = Scheduler::new(ctx, batcher, Box::new(LogNotifier::new("test@localhost")), start());
        (sched, handle, outbox)
    }

    #[tokio::test]
    async fn test_jobs_run_in_declaration_order() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (mut sched, _handle, _outbox) = scheduler(store, true);

        assert_eq!(sched.due_jobs(start()), Job::ALL.to_vec());

        let report = sched.tick(start()).await;
        let order: Vec<Job> = report.ran.iter().map(|(job, _)| *job).collect();
        assert_eq!(order, Job::ALL.to_vec());
        assert!(report.ran.iter().all(|(_, ok)| *ok));

        // Ingest and delivery are the most frequent at one minute
        assert_eq!(report.sleep, Duration::from_secs(60));
        assert!(sched.due_jobs(start()).is_empty());
    }

    #[tokio::test]
    async fn test_nothing_due_until_first_interval() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (mut sched, _handle, _outbox) = scheduler(store, false);

        let report = sched.tick(start()).await;
        assert!(report.ran.is_empty());
        assert_eq!(report.sleep, Duration::from_secs(60));

        let later = start() + chrono::Duration::seconds(60);
        assert_eq!(sched.due_jobs(later), vec![Job::Ingest, Job::Delivery]);
    }

    #[tokio::test]
    async fn test_unreachable_store_skips_tick() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true).await;
        let (mut sched, handle, _outbox) = scheduler(Arc::clone(&store), true);
        handle.push(1, start(), 42.0);

        let report = sched.tick(start()).await;
        assert!(report.store_unavailable);
        assert!(report.ran.is_empty());
        assert_eq!(report.sleep, Duration::from_secs(15));

        // Jobs stay due and the queued reading survives until the store is back
        store.set_offline(false).await;
        let report = sched.tick(start()).await;
        assert_eq!(report.ran.len(), Job::ALL.len());
        assert_eq!(store.readings().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_stop_the_others() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (mut sched, handle) = with_broken_alarms(Arc::clone(&store), false);
        handle.push(1, start(), 1.0);

        let report = sched.tick(start()).await;

        let failed: Vec<Job> = report.ran.iter().filter(|(_, ok)| !ok).map(|(job, _)| *job).collect();
        assert_eq!(failed, vec![Job::Alarms]);
        assert_eq!(report.ran.len(), Job::ALL.len());
        assert_eq!(store.readings().await.len(), 1);

        let alarms = sched.jobs().iter().find(|e| e.job == Job::Alarms).unwrap();
        assert_eq!(alarms.failures, 1);
        assert_eq!(alarms.next_run, start() + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_panicking_job_counts_as_failure() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (mut sched, handle) = with_broken_alarms(Arc::clone(&store), true);
        handle.push(1, start(), 1.0);

        let report = sched.tick(start()).await;

        let failed: Vec<Job> = report.ran.iter().filter(|(_, ok)| !ok).map(|(job, _)| *job).collect();
        assert_eq!(failed, vec![Job::Alarms]);
        assert_eq!(report.ran.len(), Job::ALL.len());
        assert_eq!(store.readings().await.len(), 1);

        // The loop carries on with the next tick
        let later = start() + chrono::Duration::minutes(5);
        let report = sched.tick(later).await;
        assert!(report.ran.contains(&(Job::Alarms, false)));
    }

    #[tokio::test]
    async fn test_oversized_alarm_window_does_not_stop_the_tick() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store
            .put_alarm(AlarmRow {
                id: "huge".to_string(),
                sensor_id: Some(1),
                aggregate: "AVG".to_string(),
                window_secs: 10_000_000_000_000,
                min_value: None,
                max_value: None,
                message: "never evaluated".to_string(),
                state: "STARTUP".to_string(),
            })
            .await;
        let (mut sched, _handle, _outbox) = scheduler(Arc::clone(&store), true);

        let report = sched.tick(start()).await;

        assert!(report.ran.iter().all(|(_, ok)| *ok), "failed jobs: {:?}", report.ran);
        assert_eq!(store.alarm_state("huge").await.as_deref(), Some("STARTUP"));
    }

    /// Healthy store except for the alarms table, which errors or panics.
    struct BrokenAlarms {
        inner: Arc<MemoryStore>,
        panic: bool,
    }

    fn with_broken_alarms(store: Arc<MemoryStore>, panic: bool) -> (Scheduler, ingest::IngestHandle) {
        // ---
        let (handle, batcher) = ingest::channel(16);
        let ctx = AppContext {
            store: Arc::new(BrokenAlarms { inner: store, panic }),
            outbox: Outbox::new(),
            config: config(true),
        };
        let sched = Scheduler::new(ctx, batcher, Box::new(LogNotifier::new("t@l")), start());
        (sched, handle)
    }

    #[async_trait::async_trait]
    impl Store for BrokenAlarms {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn insert_readings(&self, r: &[crate::Reading]) -> Result<u64> {
            self.inner.insert_readings(r).await
        }
        async fn readings_since(&self, s: i32, t: DateTime<Utc>, l: i64) -> Result<Vec<crate::Reading>> {
            self.inner.readings_since(s, t, l).await
        }
        async fn rollup(
            &self,
            g: Granularity,
            a: DateTime<Utc>,
            b: DateTime<Utc>,
        ) -> Result<Vec<crate::AggregateRow>> {
            self.inner.rollup(g, a, b).await
        }
        async fn last_cycle_end(&self) -> Result<Option<DateTime<Utc>>> {
            self.inner.last_cycle_end().await
        }
        async fn append_cycles(&self, c: &[crate::Cycle]) -> Result<u64> {
            self.inner.append_cycles(c).await
        }
        async fn last_bucket(&self, g: Granularity) -> Result<Option<DateTime<Utc>>> {
            self.inner.last_bucket(g).await
        }
        async fn insert_aggregates(&self, g: Granularity, r: &[crate::AggregateRow]) -> Result<u64> {
            self.inner.insert_aggregates(g, r).await
        }
        async fn aggregate(
            &self,
            k: crate::AggregateKind,
            s: Option<i32>,
            a: DateTime<Utc>,
            b: DateTime<Utc>,
        ) -> Result<Option<f64>> {
            self.inner.aggregate(k, s, a, b).await
        }
        async fn load_alarms(&self) -> Result<Vec<AlarmRow>> {
            if self.panic {
                panic!("alarms table is corrupt");
            }
            anyhow::bail!("alarms table is locked")
        }
        async fn update_alarm_state(&self, id: &str, s: crate::AlarmState) -> Result<()> {
            self.inner.update_alarm_state(id, s).await
        }
        async fn sensor_feeds(&self) -> Result<std::collections::HashMap<i32, String>> {
            self.inner.sensor_feeds().await
        }
        async fn prune_readings(&self, c: DateTime<Utc>, l: i64) -> Result<u64> {
            self.inner.prune_readings(c, l).await
        }
    }
}

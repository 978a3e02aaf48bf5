//! Single-flight ingestion scheduler.
//!
//! A [`CollectionScheduler`] owns two independent pieces of state: whether
//! an ingestion run is in progress, and whether a recurring schedule is
//! armed. Runs come from the schedule, from [`CollectionScheduler::start`]
//! (one immediate run), or on demand through [`CollectionScheduler::run`].
//! At most one run executes at a time; an attempt made while another run
//! is in progress returns [`RunOutcome::Skipped`] without touching the
//! statistics.
//!
//! Each run fetches one batch from the [`Collector`] and writes the points
//! one at a time. A failure part way through leaves the earlier points
//! stored; readers can observe a partially refreshed set of assets while a
//! run is in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::collector::Collector;
use crate::error::{PriceStoreError, Result};
use crate::point::now_ms;
use crate::store::StorageEngine;

/// Run counters, kept in memory only and reset on restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    /// Runs started (skipped attempts are not counted).
    pub total_runs: u64,
    /// Runs that stored their whole batch.
    pub successful_runs: u64,
    /// Runs that failed at any step.
    pub failed_runs: u64,
    /// Message of the most recent failure, cleared by a success.
    pub last_error: Option<String>,
    /// Completion time of the most recent successful run.
    pub last_run_at: Option<u64>,
}

/// Snapshot returned by [`CollectionScheduler::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    /// A run is in progress.
    pub is_collecting: bool,
    /// The recurring schedule is armed.
    pub is_scheduled: bool,
    /// Period of the armed schedule.
    pub period_ms: Option<u64>,
    /// Completion time of the most recent successful run.
    pub last_run_at: Option<u64>,
    /// Run counters.
    pub stats: CollectionStats,
}

/// Result of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Wall time the run took.
    pub duration_ms: u64,
    /// Points written.
    pub point_count: usize,
    /// Completion time.
    pub timestamp_ms: u64,
}

/// What a call to [`CollectionScheduler::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run stored its whole batch.
    Completed(RunSummary),
    /// Another run was in progress; nothing was done.
    Skipped,
}

/// An armed recurring schedule.
#[derive(Debug)]
struct Armed {
    period: Duration,
    handle: JoinHandle<()>,
}

/// Drives ingestion runs and keeps their statistics.
#[derive(Debug)]
pub struct CollectionScheduler {
    store: Arc<StorageEngine>,
    collector: Arc<dyn Collector>,
    running: AtomicBool,
    stats: Mutex<CollectionStats>,
    schedule: Mutex<Option<Armed>>,
}

/// Clears the run flag when the run ends, including by cancellation.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CollectionScheduler {
    /// Creates an idle, unarmed scheduler with zeroed statistics.
    pub fn new(store: Arc<StorageEngine>, collector: Arc<dyn Collector>) -> Self {
        Self {
            store,
            collector,
            running: AtomicBool::new(false),
            stats: Mutex::new(CollectionStats::default()),
            schedule: Mutex::new(None),
        }
    }

    /// Arms the recurring schedule and spawns one immediate run.
    ///
    /// Scheduled runs fire on multiples of `period` since the Unix epoch;
    /// ticks missed while the runtime was busy are skipped, not replayed.
    /// Failures of scheduled runs are recorded in the statistics and
    /// logged. Returns `false` without doing anything if the schedule is
    /// already armed.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PriceStoreError::InvalidArgument`] for a zero period.
    pub fn start(self: &Arc<Self>, period: Duration) -> Result<bool> {
        if period.is_zero() {
            return Err(PriceStoreError::invalid_argument("collection period must be non-zero"));
        }

        let mut schedule = lock(&self.schedule);
        if schedule.is_some() {
            tracing::debug!("collection schedule already armed");
            return Ok(false);
        }

        self.spawn_run();
        let handle = tokio::spawn(schedule_loop(Arc::downgrade(self), period));
        *schedule = Some(Armed { period, handle });

        tracing::info!(
            event = "schedule_armed",
            period_ms = duration_ms(period),
            "collection schedule armed"
        );
        Ok(true)
    }

    /// Disarms the recurring schedule.
    ///
    /// A run already in progress is not affected and completes normally.
    /// Returns `false` if the schedule was not armed.
    pub fn stop(&self) -> bool {
        let Some(armed) = lock(&self.schedule).take() else {
            return false;
        };
        armed.handle.abort();

        tracing::info!(event = "schedule_disarmed", "collection schedule disarmed");
        true
    }

    /// Performs one ingestion run unless another is in progress.
    ///
    /// # Errors
    ///
    /// Returns the collector or storage fault that ended the run, after
    /// recording it in the statistics.
    pub async fn run(&self) -> Result<RunOutcome> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            tracing::info!(event = "run_skipped", "ingestion run already in progress, skipping");
            return Ok(RunOutcome::Skipped);
        };

        let started = Instant::now();
        let run = {
            let mut stats = lock(&self.stats);
            stats.total_runs += 1;
            stats.total_runs
        };
        tracing::info!(event = "run_start", run, "ingestion run started");

        match self.ingest().await {
            Ok(point_count) => {
                let timestamp_ms = now_ms();
                let duration_ms = duration_ms(started.elapsed());
                {
                    let mut stats = lock(&self.stats);
                    stats.successful_runs += 1;
                    stats.last_error = None;
                    stats.last_run_at = Some(timestamp_ms);
                }
                tracing::info!(
                    event = "run_end",
                    outcome = "success",
                    run,
                    duration_ms,
                    point_count,
                    "ingestion run completed"
                );
                Ok(RunOutcome::Completed(RunSummary {
                    duration_ms,
                    point_count,
                    timestamp_ms,
                }))
            }
            Err(e) => {
                {
                    let mut stats = lock(&self.stats);
                    stats.failed_runs += 1;
                    stats.last_error = Some(e.to_string());
                }
                tracing::error!(event = "fault_raised", run, error = %e, "ingestion run failed");
                tracing::info!(
                    event = "run_end",
                    outcome = "failure",
                    run,
                    duration_ms = duration_ms(started.elapsed()),
                    "ingestion run failed"
                );
                Err(e)
            }
        }
    }

    /// Returns a snapshot of the run and schedule state.
    pub fn status(&self) -> CollectionStatus {
        let stats = lock(&self.stats).clone();
        let period_ms = lock(&self.schedule).as_ref().map(|a| duration_ms(a.period));

        CollectionStatus {
            is_collecting: self.running.load(Ordering::Acquire),
            is_scheduled: period_ms.is_some(),
            period_ms,
            last_run_at: stats.last_run_at,
            stats,
        }
    }

    async fn ingest(&self) -> Result<usize> {
        let points = self.collector.collect_batch().await?;
        let point_count = points.len();
        for point in points {
            let asset_id = point.asset_id.clone();
            self.store
                .run_blocking(move |store| store.put(&point.asset_id, &point))
                .await?;
            tracing::debug!(event = "point_stored", asset_id = %asset_id, "point stored");
        }
        Ok(point_count)
    }

    fn spawn_run(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        // Failures are already recorded and logged by run().
        tokio::spawn(async move {
            let _ = scheduler.run().await;
        });
    }
}

impl Drop for CollectionScheduler {
    fn drop(&mut self) {
        let schedule = self.schedule.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(armed) = schedule.take() {
            armed.handle.abort();
        }
    }
}

/// Fires a run on every period boundary until the scheduler is dropped or
/// the task is aborted.
async fn schedule_loop(scheduler: Weak<CollectionScheduler>, period: Duration) {
    let first = tokio::time::Instant::now() + next_aligned_delay(now_ms(), period);
    let mut ticker = tokio::time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        // Spawned so that disarming never cancels a run in progress.
        scheduler.spawn_run();
    }
}

/// Time from `now_ms` to the next multiple of `period` since the epoch.
///
/// A time exactly on a boundary waits a full period.
pub fn next_aligned_delay(now_ms: u64, period: Duration) -> Duration {
    let period_ms = duration_ms(period).max(1);
    Duration::from_millis(period_ms - now_ms % period_ms)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Plain data; a panic elsewhere cannot leave it inconsistent.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

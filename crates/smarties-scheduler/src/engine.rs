use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use smarties_db::{DbHelper, DbManager, Operator, Order, Stored, FIELD_ID};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    db::{init_db, to_job, ScheduledJob, FIELD_IDENTIFIER, FIELD_TRIGGERED, FIELD_TRIGGER_DATE},
    error::Result,
    registry::{identifier_for, CallbackRegistry},
    schedule::resolve_trigger,
    types::{Job, JobState, SweepReport, When},
};

/// Durable, cancellable job scheduler.
///
/// Jobs are rows in the `scheduledjob` table. A sweep selects the pending
/// rows whose trigger date is at or before the watermark (the instant of
/// the previous sweep), runs the matching callback for each and moves the
/// row to a terminal state. The watermark then advances to the sweep's own
/// instant, so every row is picked by exactly one sweep even when sweeps run
/// late.
pub struct Scheduler {
    jobs: DbHelper<ScheduledJob>,
    registry: Arc<CallbackRegistry>,
    /// Unix seconds of the previous sweep.
    watermark: Mutex<i64>,
    sweeping: AtomicBool,
    tick: Duration,
}

impl Scheduler {
    /// Create a scheduler over `db`, initialising its table if needed.
    ///
    /// The watermark starts at the current time: rows that came due while
    /// the process was down are fired by the first sweep.
    pub fn new(
        db: Arc<DbManager>,
        registry: Arc<CallbackRegistry>,
        schema_version: &str,
    ) -> Result<Self> {
        let jobs = DbHelper::new(db);
        init_db(&jobs, schema_version)?;
        Ok(Self {
            jobs,
            registry,
            watermark: Mutex::new(smarties_core::unix_now()),
            sweeping: AtomicBool::new(false),
            tick: Duration::from_secs(smarties_core::config::DEFAULT_TICK_SECS),
        })
    }

    /// Interval between two sweeps in [`run`](Self::run).
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Register the callback fired for jobs scheduled under `key`.
    pub fn register<F>(&self, key: &str, callback: F)
    where
        F: Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register(key, callback);
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.registry.unregister(key)
    }

    /// Persist a pending job for `key`. Returns the row id.
    pub fn schedule<P: Serialize + ?Sized>(&self, key: &str, when: When, payload: &P) -> Result<i64> {
        self.schedule_from(key, when, payload, Utc::now())
    }

    /// Like [`schedule`](Self::schedule), with relative offsets counted
    /// from `now`.
    #[instrument(skip(self, payload, now))]
    pub fn schedule_from<P: Serialize + ?Sized>(
        &self,
        key: &str,
        when: When,
        payload: &P,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let job = ScheduledJob {
            identifier: identifier_for(key),
            data: serde_json::to_string(payload)?,
            trigger_date: resolve_trigger(&when, now),
            triggered: JobState::Pending,
        };
        let trigger_date = job.trigger_date;
        let id = self.jobs.save(job)?;
        info!(job_id = id, trigger_date, "job scheduled");
        Ok(id)
    }

    /// Cancel every pending job for `key`. Returns how many were cancelled;
    /// zero when nothing was pending.
    ///
    /// Rows a sweep has already claimed are left alone.
    #[instrument(skip(self))]
    pub fn cancel(&self, key: &str) -> Result<usize> {
        let request = self
            .jobs
            .request()?
            .update(&[FIELD_TRIGGERED])
            .values([JobState::Cancelled.code()])
            .and_where(FIELD_IDENTIFIER, Operator::Eq, identifier_for(key))
            .and_where(FIELD_TRIGGERED, Operator::Eq, JobState::Pending.code());
        let count = self.jobs.update_many(request)?;
        if count > 0 {
            info!(count, "jobs cancelled");
        }
        Ok(count)
    }

    /// Pending jobs for `key`, earliest first.
    pub fn pending(&self, key: &str) -> Result<Vec<Job>> {
        let request = self
            .jobs
            .request()?
            .and_where(FIELD_IDENTIFIER, Operator::Eq, identifier_for(key))
            .and_where(FIELD_TRIGGERED, Operator::Eq, JobState::Pending.code())
            .order(Order::Asc, FIELD_TRIGGER_DATE);
        self.jobs.get_all(request)?.iter().map(to_job).collect()
    }

    /// Every job row, optionally only those for `key`, earliest first.
    pub fn jobs(&self, key: Option<&str>) -> Result<Vec<Job>> {
        let mut request = self
            .jobs
            .request()?
            .order(Order::Asc, FIELD_TRIGGER_DATE)
            .order(Order::Asc, FIELD_ID);
        if let Some(key) = key {
            request = request.and_where(FIELD_IDENTIFIER, Operator::Eq, identifier_for(key));
        }
        self.jobs.get_all(request)?.iter().map(to_job).collect()
    }

    /// Instant up to which due jobs have been picked.
    pub fn watermark(&self) -> i64 {
        *self.watermark.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sweep with the wall clock.
    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// Fire every pending job due at or before the watermark, then advance
    /// the watermark to `now`.
    ///
    /// Each row is claimed (`Pending` to `Fired`) before its callback runs;
    /// a row cancelled in the meantime is skipped. A callback error or panic
    /// then marks only that row `Failed`; the rest of the batch still runs.
    /// A due row with no registered callback stays `Fired` and is logged. If
    /// the store fails the watermark stays put, so unclaimed rows are picked
    /// again by the next sweep.
    #[instrument(skip(self, now), fields(now = now.timestamp()))]
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            debug!("sweep already in progress, skipping");
            return Ok(SweepReport::default());
        }
        let _guard = SweepGuard(&self.sweeping);

        let watermark = self.watermark();
        let request = self
            .jobs
            .request()?
            .and_where(FIELD_TRIGGERED, Operator::Eq, JobState::Pending.code())
            .and_where(FIELD_TRIGGER_DATE, Operator::Lte, watermark)
            .order(Order::Asc, FIELD_TRIGGER_DATE)
            .order(Order::Asc, FIELD_ID);
        let due = self.jobs.get_all(request)?;
        debug!(watermark, due = due.len(), "sweeping");

        let mut report = SweepReport::default();
        for job in due {
            let job_id = job.id.unwrap_or_default();
            if !self.transition(job_id, JobState::Pending, JobState::Fired)? {
                debug!(job_id, "job no longer pending, skipping");
                continue;
            }
            match self.fire(&job) {
                Outcome::Fired => report.fired += 1,
                Outcome::Dropped => report.dropped += 1,
                Outcome::Failed => {
                    report.failed += 1;
                    self.transition(job_id, JobState::Fired, JobState::Failed)?;
                }
            }
        }

        *self.watermark.lock().unwrap_or_else(PoisonError::into_inner) =
            now.timestamp().max(watermark);
        Ok(report)
    }

    /// Move row `id` from `from` to `to`. False when the row was not in
    /// `from` any more.
    fn transition(&self, id: i64, from: JobState, to: JobState) -> Result<bool> {
        let request = self
            .jobs
            .request()?
            .update(&[FIELD_TRIGGERED])
            .values([to.code()])
            .and_where(FIELD_ID, Operator::Eq, id)
            .and_where(FIELD_TRIGGERED, Operator::Eq, from.code());
        Ok(self.jobs.update_many(request)? == 1)
    }

    fn fire(&self, job: &Stored<ScheduledJob>) -> Outcome {
        let job_id = job.id.unwrap_or_default();
        let identifier = job.object.identifier.as_str();
        let Some(callback) = self.registry.lookup(identifier) else {
            info!(job_id, %identifier, "no callback registered for due job, dropping");
            return Outcome::Dropped;
        };
        let payload: serde_json::Value = match serde_json::from_str(&job.object.data) {
            Ok(p) => p,
            Err(e) => {
                error!(job_id, "bad payload JSON: {e}");
                return Outcome::Failed;
            }
        };
        match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
            Ok(Ok(())) => {
                debug!(job_id, "job fired");
                Outcome::Fired
            }
            Ok(Err(e)) => {
                error!(job_id, "job callback failed: {e:#}");
                Outcome::Failed
            }
            Err(_) => {
                error!(job_id, "job callback panicked");
                Outcome::Failed
            }
        }
    }

    /// Sweep every `tick` until `shutdown` broadcasts `true`.
    ///
    /// Each sweep runs on the blocking pool and is awaited before the next
    /// tick is taken, so sweeps never overlap.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.tick.as_secs(), "scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || this.sweep()).await {
                        Ok(Ok(report)) if report.total() > 0 => {
                            info!(
                                fired = report.fired,
                                failed = report.failed,
                                dropped = report.dropped,
                                "sweep complete"
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("scheduler sweep error: {e}"),
                        Err(e) => warn!("scheduler sweep task aborted: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

enum Outcome {
    Fired,
    Dropped,
    Failed,
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use herald_core::config::DEFAULT_DELIVERY_TIMEOUT_SECS;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{EngineError, Result},
    store::JobStore,
    types::{Job, JobState},
};

/// What one tick did. Mostly useful to tests and debug logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pending jobs found due.
    pub due: usize,
    /// Claimed and handed to the worker pool.
    pub dispatched: usize,
    /// Skipped because another writer changed the job first.
    pub lost: usize,
    /// Claimed but put back to `Pending` because the queue refused them.
    pub released: usize,
    /// `Firing` jobs whose claim outlived the lease, returned to `Pending`.
    pub reclaimed: usize,
    /// Due on a switched-off channel, cancelled instead of dispatched.
    pub suppressed: usize,
}

/// Finds due jobs and hands them to the delivery workers.
///
/// A job only reaches the dispatch queue after a successful conditional
/// `Pending -> Firing` write, so two ticks (or two processes sharing the
/// database) can never dispatch the same job twice.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    dispatch_tx: mpsc::Sender<Job>,
    wake: Arc<Notify>,
    tick_interval: Duration,
    /// How long a claim may stay `Firing` before the job is handed out again.
    lease: Duration,
    /// Keep finished jobs this long; `None` disables the sweep.
    retention: Option<Duration>,
    sweep_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        dispatch_tx: mpsc::Sender<Job>,
    ) -> Self {
        Self {
            store,
            clock,
            dispatch_tx,
            wake: Arc::new(Notify::new()),
            tick_interval: Duration::from_secs(1),
            lease: Duration::from_secs(2 * DEFAULT_DELIVERY_TIMEOUT_SECS),
            retention: None,
            sweep_interval: Duration::from_secs(3600),
        }
    }

    pub fn with_tick_interval(mut self, every: Duration) -> Self {
        self.tick_interval = every;
        self
    }

    /// Claims older than `lease` are treated as abandoned. Must exceed the
    /// delivery timeout, or slow deliveries get dispatched twice.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Purge jobs that finished more than `keep_for` ago, every `sweep_every`.
    pub fn with_retention(mut self, keep_for: Duration, sweep_every: Duration) -> Self {
        self.retention = Some(keep_for);
        self.sweep_interval = sweep_every;
        self
    }

    /// Handle that triggers an immediate tick, used after schedule/reschedule.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Return every job left `Firing` by a previous process to `Pending`.
    ///
    /// Delivery is at-least-once across crashes: a job that was mid-delivery
    /// when the process died is delivered again.
    pub fn recover(&self) -> Result<usize> {
        let now = self.clock.now();
        self.store.reset_in_flight(now, now)
    }

    /// Run the retention sweep once. Returns the number of purged jobs.
    pub fn sweep(&self) -> Result<usize> {
        let Some(keep_for) = self.retention else {
            return Ok(0);
        };
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(keep_for)
            .ok()
            .and_then(|d| now.checked_sub_signed(d));
        match cutoff {
            Some(cutoff) => self.store.purge_finished_before(cutoff),
            None => Ok(0),
        }
    }

    /// Return `Firing` jobs claimed more than one lease ago to `Pending`.
    ///
    /// A worker that failed to record its outcome leaves the job `Firing`;
    /// this hands it out again.
    pub fn reclaim_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let Some(claimed_before) = chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
        else {
            return Ok(0);
        };
        let n = self.store.reset_in_flight(now, claimed_before)?;
        if n > 0 {
            warn!(count = n, "expired in-flight claims returned to pending");
        }
        Ok(n)
    }

    /// One due-job check.
    ///
    /// Reclaims expired claims first, then reads at most as many due jobs as
    /// the queue has room for, so a slow pool never leaves claimed jobs
    /// stranded in the queue. A store error aborts the rest of the tick;
    /// unclaimed jobs stay `Pending`.
    pub fn tick(&self) -> Result<TickReport> {
        let reclaimed = self.reclaim_expired()?;

        let free = self.dispatch_tx.capacity();
        if free == 0 {
            debug!("dispatch queue full, skipping tick");
            return Ok(TickReport {
                reclaimed,
                ..TickReport::default()
            });
        }

        let now = self.clock.now();
        let due = self.store.list_due_before(now, Some(free))?;
        let mut report = TickReport {
            due: due.len(),
            reclaimed,
            ..TickReport::default()
        };

        let mut enabled: HashMap<String, bool> = HashMap::new();
        for job in due {
            let on = match enabled.get(&job.channel) {
                Some(on) => *on,
                None => {
                    let on = self.store.channel_enabled(&job.channel)?;
                    enabled.insert(job.channel.clone(), on);
                    on
                }
            };
            if !on {
                let mut cancelled = job.transition(JobState::Cancelled, now);
                cancelled.last_error = Some("channel disabled".to_string());
                match self.store.put(&cancelled) {
                    Ok(_) => {
                        info!(job_id = %job.id, channel = %job.channel, "channel disabled, job cancelled");
                        report.suppressed += 1;
                    }
                    Err(EngineError::Conflict { .. } | EngineError::NotFound { .. }) => {
                        report.lost += 1;
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            let claimed = match self.store.put(&job.transition(JobState::Firing, now)) {
                Ok(claimed) => claimed,
                Err(EngineError::Conflict { .. } | EngineError::NotFound { .. }) => {
                    debug!(job_id = %job.id, "job changed before it could be claimed");
                    report.lost += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.dispatch_tx.try_send(claimed) {
                Ok(()) => {
                    debug!(job_id = %job.id, channel = %job.channel, "job dispatched");
                    report.dispatched += 1;
                }
                Err(mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job)) => {
                    warn!(job_id = %job.id, "dispatch queue unavailable, releasing job");
                    self.release(&job)?;
                    report.released += 1;
                }
            }
        }

        if report.due > 0 {
            debug!(
                due = report.due,
                dispatched = report.dispatched,
                lost = report.lost,
                released = report.released,
                suppressed = report.suppressed,
                "tick complete"
            );
        }
        Ok(report)
    }

    /// Put a claimed job back so the next tick sees it again.
    fn release(&self, job: &Job) -> Result<()> {
        match self
            .store
            .put(&job.transition(JobState::Pending, self.clock.now()))
        {
            Ok(_) => Ok(()),
            // Cancelled or deleted in the meantime: nothing to give back.
            Err(EngineError::Conflict { .. } | EngineError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Main loop. Recovers in-flight jobs, then ticks on the interval or when
    /// woken, until `shutdown` broadcasts `true`.
    ///
    /// Returning drops the dispatch sender, which lets the workers drain the
    /// queue and exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            lease_secs = self.lease.as_secs(),
            "scheduler started"
        );
        match self.recover() {
            Ok(n) if n > 0 => warn!(count = n, "in-flight jobs returned to pending on startup"),
            Err(e) => error!("startup recovery failed: {e}"),
            _ => {}
        }

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeper = tokio::time::interval(self.sweep_interval);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = Arc::clone(&self.wake);

        if *shutdown.borrow() {
            info!("scheduler shutting down");
            return;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick_logged(),
                _ = wake.notified() => self.tick_logged(),
                _ = sweeper.tick(), if self.retention.is_some() => {
                    match self.sweep() {
                        Ok(n) if n > 0 => info!(count = n, "finished jobs purged"),
                        Err(e) => error!("retention sweep failed: {e}"),
                        _ => {}
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

    fn tick_logged(&self) {
        if let Err(e) = self.tick() {
            error!("scheduler tick error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::open_in_memory;
    use crate::store::SqliteJobStore;
    use crate::types::Trigger;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn setup(capacity: usize) -> (Arc<SqliteJobStore>, Scheduler, mpsc::Receiver<Job>) {
        let store = Arc::new(SqliteJobStore::new(open_in_memory().unwrap()).unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let (tx, rx) = mpsc::channel(capacity);
        let scheduler = Scheduler::new(store.clone(), clock, tx);
        (store, scheduler, rx)
    }

    fn pending(id: &str, secs_from_t0: i64) -> Job {
        let at = t0() + chrono::Duration::seconds(secs_from_t0);
        Job {
            id: id.to_string(),
            channel: "reminders".to_string(),
            trigger: Trigger::At { at },
            trigger_time: at,
            payload: json!({"title": "hi"}),
            state: JobState::Pending,
            attempt: 0,
            max_attempts: 3,
            version: 0,
            unique_key: None,
            run_count: 0,
            last_error: None,
            created_at: t0(),
            updated_at: t0(),
            finished_at: None,
        }
    }

    #[test]
    fn tick_claims_due_jobs_only() {
        let (store, scheduler, mut rx) = setup(8);
        store.put(&pending("due", -1)).unwrap();
        store.put(&pending("later", 60)).unwrap();

        let report = scheduler.tick().unwrap();
        assert_eq!(report.dispatched, 1);

        let job = rx.try_recv().unwrap();
        assert_eq!(job.id, "due");
        assert_eq!(job.state, JobState::Firing);
        assert_eq!(store.get("due").unwrap().state, JobState::Firing);
        assert_eq!(store.get("later").unwrap().state, JobState::Pending);

        // Already firing: a second tick finds nothing.
        assert_eq!(scheduler.tick().unwrap(), TickReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tick_reads_no_more_than_the_queue_can_take() {
        let (store, scheduler, mut rx) = setup(2);
        for id in ["a", "b", "c"] {
            store.put(&pending(id, -5)).unwrap();
        }

        let report = scheduler.tick().unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.dispatched, 2);
        assert_eq!(store.get("c").unwrap().state, JobState::Pending);

        // Queue full: the tick is a no-op.
        assert_eq!(scheduler.tick().unwrap(), TickReport::default());

        rx.try_recv().unwrap();
        let report = scheduler.tick().unwrap();
        assert_eq!(report.dispatched, 1);
    }

    #[test]
    fn closed_queue_releases_claimed_job() {
        let (store, scheduler, rx) = setup(4);
        store.put(&pending("a", -1)).unwrap();
        drop(rx);

        let report = scheduler.tick().unwrap();
        assert_eq!(report.released, 1);
        let job = store.get("a").unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.version, 3);
    }

    #[test]
    fn recover_resets_firing_jobs() {
        let (store, scheduler, _rx) = setup(4);
        let job = store.put(&pending("a", -1)).unwrap();
        store
            .put(&job.transition(JobState::Firing, t0() - chrono::Duration::seconds(5)))
            .unwrap();

        assert_eq!(scheduler.recover().unwrap(), 1);
        assert_eq!(store.get("a").unwrap().state, JobState::Pending);
    }

    #[test]
    fn tick_reclaims_claims_older_than_the_lease() {
        let store = Arc::new(SqliteJobStore::new(open_in_memory().unwrap()).unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = Scheduler::new(store.clone(), clock.clone(), tx)
            .with_lease(Duration::from_secs(60));
        store.put(&pending("a", -1)).unwrap();

        assert_eq!(scheduler.tick().unwrap().dispatched, 1);
        let first = rx.try_recv().unwrap();

        // Within the lease the claim is left alone.
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(scheduler.tick().unwrap(), TickReport::default());

        clock.advance(chrono::Duration::seconds(31));
        let report = scheduler.tick().unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.dispatched, 1);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.id, "a");
        assert!(second.version > first.version);
    }

    #[test]
    fn due_jobs_on_a_disabled_channel_are_cancelled() {
        let (store, scheduler, mut rx) = setup(8);
        store.put(&pending("quiet", -1)).unwrap();
        let mut loud = pending("loud", -1);
        loud.channel = "alerts".to_string();
        store.put(&loud).unwrap();
        store.set_channel_enabled("reminders", false).unwrap();

        let report = scheduler.tick().unwrap();
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(rx.try_recv().unwrap().id, "loud");

        let quiet = store.get("quiet").unwrap();
        assert_eq!(quiet.state, JobState::Cancelled);
        assert_eq!(quiet.last_error.as_deref(), Some("channel disabled"));
    }

    #[test]
    fn sweep_is_noop_without_retention() {
        let (store, scheduler, _rx) = setup(4);
        let job = store.put(&pending("a", -1)).unwrap();
        store
            .put(&job.transition(JobState::Delivered, t0() - chrono::Duration::days(30)))
            .unwrap();

        assert_eq!(scheduler.sweep().unwrap(), 0);
        let scheduler = scheduler.with_retention(Duration::from_secs(86_400), Duration::from_secs(60));
        assert_eq!(scheduler.sweep().unwrap(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_store, scheduler, _rx) = setup(4);
        let scheduler = scheduler.with_tick_interval(Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

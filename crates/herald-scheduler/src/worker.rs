use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use herald_core::config::{DEFAULT_DELIVERY_TIMEOUT_SECS, DEFAULT_WORKERS};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::{
    backoff::RetryPolicy,
    clock::Clock,
    error::{EngineError, Result},
    notifier::{DeliveryError, Notifier},
    schedule::{add_delay, compute_next_run},
    store::JobStore,
    types::{Job, JobState},
};

/// Conditional-write attempts when settling a delivery outcome.
const SETTLE_RETRIES: usize = 5;

/// How a delivery attempt was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// One-shot job delivered.
    Delivered,
    /// Recurring job delivered and back in `Pending`.
    Rescheduled { next: DateTime<Utc> },
    /// Delivery failed; another attempt is due at `next`.
    Retrying { attempt: u32, next: DateTime<Utc> },
    /// Delivery failed and the attempt budget is spent.
    Failed,
    /// The job was cancelled while in flight and stays cancelled.
    Cancelled,
    /// Someone else already moved the job out of `Firing`; left untouched.
    Superseded,
}

/// Fixed-size pool of delivery workers sharing the dispatch queue.
pub struct DeliveryPool {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    timeout: Duration,
    size: usize,
}

impl DeliveryPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            policy,
            timeout: Duration::from_secs(DEFAULT_DELIVERY_TIMEOUT_SECS),
            size: DEFAULT_WORKERS,
        }
    }

    /// Per-call notifier timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workers(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    /// Start the workers. They exit once every sender of `rx` is dropped and
    /// the queue is drained.
    pub fn spawn(self: Arc<Self>, rx: mpsc::Receiver<Job>) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (1..=self.size)
            .map(|i| {
                let name = format!("delivery-worker-{i}");
                debug!(worker.name = %name, "starting worker");
                let pool = Arc::clone(&self);
                let rx = Arc::clone(&rx);
                let span = info_span!("worker", worker.name = %name);
                tokio::spawn(async move { pool.work(rx).instrument(span).await })
            })
            .collect()
    }

    async fn work(&self, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(job) = next else {
                break;
            };
            let id = job.id.clone();
            if let Err(e) = self.process(job).await {
                // The job stays Firing until the scheduler's lease reclaims it.
                error!(job_id = %id, "could not record delivery outcome: {e}");
            }
        }
        debug!("dispatch queue closed, worker exiting");
    }

    /// Deliver one claimed job and record the outcome.
    #[instrument(skip(self, job), fields(job_id = %job.id, channel = %job.channel))]
    pub async fn process(&self, job: Job) -> Result<Settlement> {
        if let Some(settlement) = self.stale_claim(&job)? {
            debug!(?settlement, "claim no longer current, skipping delivery");
            return Ok(settlement);
        }
        let outcome = self.deliver(&job).await;
        let settlement = self.settle(&job.id, &outcome)?;

        match (&settlement, &outcome) {
            (Settlement::Delivered, _) => info!("notification delivered"),
            (Settlement::Rescheduled { next }, _) => {
                info!(next = %next, "notification delivered, next run scheduled")
            }
            (Settlement::Retrying { attempt, next }, Err(e)) => {
                warn!(attempt, next = %next, "delivery failed, will retry: {e}")
            }
            (Settlement::Failed, Err(e)) => error!("delivery failed permanently: {e}"),
            (Settlement::Cancelled, _) => info!("job cancelled during delivery"),
            (Settlement::Superseded, _) => debug!("job changed during delivery, outcome dropped"),
            _ => {}
        }
        Ok(settlement)
    }

    /// A queued copy whose claim expired and was handed out again, or that
    /// was cancelled while waiting, must not be delivered.
    fn stale_claim(&self, job: &Job) -> Result<Option<Settlement>> {
        let current = match self.store.get(&job.id) {
            Ok(current) => current,
            Err(EngineError::NotFound { .. }) => return Ok(Some(Settlement::Superseded)),
            Err(e) => return Err(e),
        };
        Ok(match current.state {
            JobState::Cancelled => Some(Settlement::Cancelled),
            JobState::Firing if current.version == job.version => None,
            _ => Some(Settlement::Superseded),
        })
    }

    async fn deliver(&self, job: &Job) -> std::result::Result<(), DeliveryError> {
        let call = AssertUnwindSafe(self.notifier.deliver(&job.channel, &job.payload)).catch_unwind();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(DeliveryError::Rejected("notifier panicked".to_string())),
            Err(_elapsed) => Err(DeliveryError::Timeout(self.timeout)),
        }
    }

    /// Write the outcome with a conditional put, re-reading on conflict.
    fn settle(
        &self,
        id: &str,
        outcome: &std::result::Result<(), DeliveryError>,
    ) -> Result<Settlement> {
        let mut tries = 0;
        loop {
            let current = match self.store.get(id) {
                Ok(job) => job,
                Err(EngineError::NotFound { .. }) => return Ok(Settlement::Superseded),
                Err(e) => return Err(e),
            };
            match current.state {
                JobState::Firing => {}
                JobState::Cancelled => return Ok(Settlement::Cancelled),
                _ => return Ok(Settlement::Superseded),
            }

            let (next, settlement) = self.next_state(&current, outcome);
            match self.store.put(&next) {
                Ok(_) => return Ok(settlement),
                Err(EngineError::Conflict { .. }) if tries + 1 < SETTLE_RETRIES => {
                    tries += 1;
                    debug!(job_id = %id, tries, "conflict while settling, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_state(
        &self,
        current: &Job,
        outcome: &std::result::Result<(), DeliveryError>,
    ) -> (Job, Settlement) {
        let now = self.clock.now();
        match outcome {
            Ok(()) => {
                let next_run = if current.trigger.is_recurring() {
                    compute_next_run(&current.trigger, now)
                } else {
                    None
                };
                let mut next = match next_run {
                    Some(_) => current.transition(JobState::Pending, now),
                    None => current.transition(JobState::Delivered, now),
                };
                next.run_count += 1;
                next.last_error = None;
                match next_run {
                    Some(at) => {
                        next.trigger_time = at;
                        next.attempt = 0;
                        (next, Settlement::Rescheduled { next: at })
                    }
                    None => (next, Settlement::Delivered),
                }
            }
            Err(err) => {
                let attempt = current.attempt + 1;
                if attempt < current.max_attempts {
                    let at = add_delay(now, self.policy.delay(attempt));
                    let mut next = current.transition(JobState::Pending, now);
                    next.attempt = attempt;
                    next.trigger_time = at;
                    next.last_error = Some(err.to_string());
                    (next, Settlement::Retrying { attempt, next: at })
                } else {
                    let mut next = current.transition(JobState::Failed, now);
                    next.attempt = attempt;
                    next.last_error = Some(err.to_string());
                    (next, Settlement::Failed)
                }
            }
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
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    struct Ok200;

    #[async_trait]
    impl Notifier for Ok200 {
        async fn deliver(&self, _channel: &str, _payload: &Value) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    struct Down;

    #[async_trait]
    impl Notifier for Down {
        async fn deliver(&self, _channel: &str, _payload: &Value) -> std::result::Result<(), DeliveryError> {
            Err(DeliveryError::Unavailable("connection refused".to_string()))
        }
    }

    struct Hangs;

    #[async_trait]
    impl Notifier for Hangs {
        async fn deliver(&self, _channel: &str, _payload: &Value) -> std::result::Result<(), DeliveryError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Notifier for Panics {
        async fn deliver(&self, _channel: &str, _payload: &Value) -> std::result::Result<(), DeliveryError> {
            panic!("notifier bug");
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn pool(notifier: Arc<dyn Notifier>) -> (Arc<SqliteJobStore>, DeliveryPool) {
        let store = Arc::new(SqliteJobStore::new(open_in_memory().unwrap()).unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let pool = DeliveryPool::new(store.clone(), clock, notifier, RetryPolicy::default())
            .with_timeout(Duration::from_millis(50));
        (store, pool)
    }

    /// Insert a job and move it to Firing, as the scheduler would.
    fn claimed(store: &SqliteJobStore, trigger: Trigger) -> Job {
        let job = Job {
            id: "job-1".to_string(),
            channel: "reminders".to_string(),
            trigger,
            trigger_time: t0(),
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
        };
        let stored = store.put(&job).unwrap();
        store.put(&stored.transition(JobState::Firing, t0())).unwrap()
    }

    #[tokio::test]
    async fn one_shot_success_is_delivered() {
        let (store, pool) = pool(Arc::new(Ok200));
        let job = claimed(&store, Trigger::At { at: t0() });

        assert_eq!(pool.process(job).await.unwrap(), Settlement::Delivered);
        let job = store.get("job-1").unwrap();
        assert_eq!(job.state, JobState::Delivered);
        assert_eq!(job.run_count, 1);
        assert_eq!(job.finished_at, Some(t0()));
    }

    #[tokio::test]
    async fn recurring_success_reenters_pending() {
        let (store, pool) = pool(Arc::new(Ok200));
        let job = claimed(
            &store,
            Trigger::Every {
                interval_secs: 60,
                anchor: None,
            },
        );

        let next = t0() + chrono::Duration::seconds(60);
        assert_eq!(
            pool.process(job).await.unwrap(),
            Settlement::Rescheduled { next }
        );
        let job = store.get("job-1").unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.trigger_time, next);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.finished_at, None);
    }

    #[tokio::test]
    async fn failure_backs_off() {
        let (store, pool) = pool(Arc::new(Down));
        let job = claimed(&store, Trigger::At { at: t0() });

        let settlement = pool.process(job).await.unwrap();
        let next = t0() + chrono::Duration::seconds(60);
        assert_eq!(settlement, Settlement::Retrying { attempt: 1, next });

        let job = store.get("job-1").unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.trigger_time, next);
        assert!(job.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn last_attempt_fails_permanently() {
        let (store, pool) = pool(Arc::new(Down));
        let mut job = claimed(&store, Trigger::At { at: t0() });
        job.attempt = 2;
        let job = store.put(&job).unwrap();

        assert_eq!(pool.process(job).await.unwrap(), Settlement::Failed);
        let job = store.get("job-1").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt, 3);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let (store, pool) = pool(Arc::new(Hangs));
        let job = claimed(&store, Trigger::At { at: t0() });

        let settlement = pool.process(job).await.unwrap();
        assert!(matches!(settlement, Settlement::Retrying { attempt: 1, .. }));
        assert!(store
            .get("job-1")
            .unwrap()
            .last_error
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_notifier_counts_as_failure() {
        let (store, pool) = pool(Arc::new(Panics));
        let job = claimed(&store, Trigger::At { at: t0() });

        let settlement = pool.process(job).await.unwrap();
        assert!(matches!(settlement, Settlement::Retrying { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn cancelled_in_flight_stays_cancelled() {
        let (store, pool) = pool(Arc::new(Ok200));
        let job = claimed(
            &store,
            Trigger::Every {
                interval_secs: 60,
                anchor: None,
            },
        );
        let current = store.get("job-1").unwrap();
        store
            .put(&current.transition(JobState::Cancelled, t0()))
            .unwrap();

        assert_eq!(pool.process(job).await.unwrap(), Settlement::Cancelled);
        let job = store.get("job-1").unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.run_count, 0);
    }

    #[tokio::test]
    async fn workers_exit_when_queue_closes() {
        let (store, pool) = pool(Arc::new(Ok200));
        let job = claimed(&store, Trigger::At { at: t0() });
        let (tx, rx) = mpsc::channel(4);
        let handles = Arc::new(pool.with_workers(2)).spawn(rx);
        assert_eq!(handles.len(), 2);

        tx.send(job).await.unwrap();
        drop(tx);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("job-1").unwrap().state, JobState::Delivered);
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::ChannelRegistry;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    backoff::RetryPolicy,
    clock::Clock,
    error::{EngineError, Result},
    schedule::{first_trigger_time, validate},
    store::JobStore,
    types::{Job, JobFilter, JobState, Trigger, UniquePolicy},
};

/// Conditional-write attempts before an operation gives up on a busy job.
const MAX_CAS_RETRIES: usize = 8;

/// Public API for scheduling and managing notifications.
///
/// Cheap to share behind an `Arc`; every call is a few short store
/// operations and never waits on a delivery.
pub struct NotificationService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    channels: ChannelRegistry,
    policy: RetryPolicy,
    wake: Option<Arc<Notify>>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            channels: ChannelRegistry::default(),
            policy: RetryPolicy::default(),
            wake: None,
        }
    }

    /// Restrict scheduling to the configured channels.
    pub fn with_channels(mut self, channels: ChannelRegistry) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Nudge a running scheduler after every schedule/reschedule.
    pub fn with_waker(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Persist a new `Pending` job and return its id.
    ///
    /// An `At` instant in the past is accepted and fires on the next tick.
    #[instrument(skip(self, payload))]
    pub fn schedule(&self, channel: &str, payload: Value, trigger: Trigger) -> Result<String> {
        let job = self.new_job(channel, payload, trigger, None)?;
        let stored = self.store.put(&job)?;
        info!(job_id = %stored.id, trigger_time = %stored.trigger_time, "notification scheduled");
        self.wake();
        Ok(stored.id)
    }

    /// Schedule with at most one live (pending or firing) job per `key`.
    ///
    /// With [`UniquePolicy::Keep`] an existing live job wins and its id is
    /// returned. With [`UniquePolicy::Replace`] a pending holder gets the new
    /// channel, payload and trigger in place; a holder that is mid-delivery is
    /// cancelled and a fresh job takes the key.
    #[instrument(skip(self, payload))]
    pub fn schedule_unique(
        &self,
        key: &str,
        channel: &str,
        payload: Value,
        trigger: Trigger,
        policy: UniquePolicy,
    ) -> Result<String> {
        if key.trim().is_empty() {
            return Err(EngineError::InvalidSchedule(
                "unique key must not be empty".to_string(),
            ));
        }
        self.check_channel(channel)?;
        validate(&trigger)?;

        for _ in 0..MAX_CAS_RETRIES {
            let Some(existing) = self.store.find_by_unique_key(key)? else {
                let job = self.new_job(channel, payload.clone(), trigger.clone(), Some(key))?;
                match self.store.put(&job) {
                    Ok(stored) => {
                        info!(job_id = %stored.id, "notification scheduled");
                        self.wake();
                        return Ok(stored.id);
                    }
                    Err(EngineError::UniqueKeyTaken { .. }) => continue,
                    Err(e) => return Err(e),
                }
            };

            match (policy, existing.state) {
                (UniquePolicy::Keep, _) => {
                    debug!(job_id = %existing.id, "unique key held, keeping existing job");
                    return Ok(existing.id);
                }
                (UniquePolicy::Replace, JobState::Pending) => {
                    let now = self.clock.now();
                    let mut next = existing.transition(JobState::Pending, now);
                    next.channel = channel.to_string();
                    next.payload = payload.clone();
                    next.trigger_time = self.first_trigger_time(&trigger, now)?;
                    next.trigger = trigger.clone();
                    next.attempt = 0;
                    next.last_error = None;
                    match self.store.put(&next) {
                        Ok(stored) => {
                            info!(job_id = %stored.id, "unique notification replaced");
                            self.wake();
                            return Ok(stored.id);
                        }
                        Err(EngineError::Conflict { .. } | EngineError::NotFound { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                (UniquePolicy::Replace, _) => {
                    let cancelled = existing.transition(JobState::Cancelled, self.clock.now());
                    match self.store.put(&cancelled) {
                        Ok(_) => {
                            info!(job_id = %existing.id, "in-flight unique notification cancelled for replacement")
                        }
                        Err(EngineError::Conflict { .. } | EngineError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(EngineError::UniqueKeyTaken {
            key: key.to_string(),
        })
    }

    /// Cancel a pending or in-flight job.
    ///
    /// Idempotent on already cancelled jobs. Cancelling a firing job does not
    /// abort the running delivery; it only stops retries and recurrences.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        let changed = self.update_with_retry(id, |job| match job.state {
            JobState::Pending | JobState::Firing => {
                Ok(Some(job.transition(JobState::Cancelled, now)))
            }
            JobState::Cancelled => Ok(None),
            state => Err(EngineError::InvalidState {
                id: job.id.clone(),
                state,
                operation: "cancel",
            }),
        })?;
        if changed.is_some() {
            info!(job_id = %id, "notification cancelled");
        }
        Ok(())
    }

    /// Cancel every live job on `channel`. Returns how many were cancelled.
    #[instrument(skip(self))]
    pub fn cancel_channel(&self, channel: &str) -> Result<usize> {
        let jobs = self.store.list(&JobFilter {
            channel: Some(channel.to_string()),
            ..JobFilter::default()
        })?;

        let now = self.clock.now();
        let mut cancelled = 0;
        for job in jobs.iter().filter(|j| !j.state.is_terminal()) {
            let changed = self.update_with_retry(&job.id, |current| {
                Ok(match current.state {
                    JobState::Pending | JobState::Firing => {
                        Some(current.transition(JobState::Cancelled, now))
                    }
                    _ => None,
                })
            });
            match changed {
                Ok(Some(_)) => cancelled += 1,
                Ok(None) | Err(EngineError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        info!(count = cancelled, "channel cancelled");
        Ok(cancelled)
    }

    /// Switch `channel` on or off. The switch is persisted.
    ///
    /// Switching off cancels every live job on the channel and makes
    /// `schedule` reject it until switched back on. Returns how many jobs
    /// were cancelled.
    #[instrument(skip(self))]
    pub fn set_channel_enabled(&self, channel: &str, enabled: bool) -> Result<usize> {
        self.check_channel_key(channel)?;
        self.store.set_channel_enabled(channel, enabled)?;
        if enabled {
            info!("channel enabled");
            return Ok(0);
        }
        let cancelled = self.cancel_channel(channel)?;
        info!(cancelled, "channel disabled");
        Ok(cancelled)
    }

    pub fn channel_enabled(&self, channel: &str) -> Result<bool> {
        self.store.channel_enabled(channel)
    }

    /// Replace the trigger of a pending job and reset its retry counter.
    #[instrument(skip(self))]
    pub fn reschedule(&self, id: &str, trigger: Trigger) -> Result<()> {
        validate(&trigger)?;
        let now = self.clock.now();
        let trigger_time = self.first_trigger_time(&trigger, now)?;

        let stored = self.update_with_retry(id, |job| match job.state {
            JobState::Pending => {
                let mut next = job.transition(JobState::Pending, now);
                next.trigger = trigger.clone();
                next.trigger_time = trigger_time;
                next.attempt = 0;
                Ok(Some(next))
            }
            state => Err(EngineError::InvalidState {
                id: job.id.clone(),
                state,
                operation: "reschedule",
            }),
        })?;
        if stored.is_some() {
            info!(job_id = %id, trigger_time = %trigger_time, "notification rescheduled");
            self.wake();
        }
        Ok(())
    }

    /// Read-only snapshot of a job.
    pub fn query(&self, id: &str) -> Result<Job> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list(filter)
    }

    /// Delete finished jobs older than `older_than`. Returns the count.
    #[instrument(skip(self))]
    pub fn purge_finished(&self, older_than: Duration) -> Result<usize> {
        let now = self.clock.now();
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };
        let n = self.store.purge_finished_before(cutoff)?;
        info!(count = n, "finished jobs purged");
        Ok(n)
    }

    // --- private helpers ---------------------------------------------------

    /// Channel may take new jobs: known to the registry and switched on.
    fn check_channel(&self, channel: &str) -> Result<()> {
        self.check_channel_key(channel)?;
        if !self.store.channel_enabled(channel)? {
            return Err(EngineError::ChannelDisabled {
                channel: channel.to_string(),
            });
        }
        Ok(())
    }

    fn check_channel_key(&self, channel: &str) -> Result<()> {
        if channel.trim().is_empty() {
            return Err(EngineError::InvalidSchedule(
                "channel must not be empty".to_string(),
            ));
        }
        if !self.channels.accepts(channel) {
            return Err(EngineError::InvalidSchedule(format!(
                "unknown channel: {channel}"
            )));
        }
        Ok(())
    }

    fn first_trigger_time(&self, trigger: &Trigger, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        first_trigger_time(trigger, now).ok_or_else(|| {
            EngineError::InvalidSchedule("trigger never fires".to_string())
        })
    }

    fn new_job(
        &self,
        channel: &str,
        payload: Value,
        trigger: Trigger,
        unique_key: Option<&str>,
    ) -> Result<Job> {
        self.check_channel(channel)?;
        validate(&trigger)?;
        let now = self.clock.now();
        let trigger_time = self.first_trigger_time(&trigger, now)?;

        Ok(Job {
            id: Uuid::now_v7().to_string(),
            channel: channel.to_string(),
            trigger,
            trigger_time,
            payload,
            state: JobState::Pending,
            attempt: 0,
            max_attempts: self.policy.max_attempts,
            version: 0,
            unique_key: unique_key.map(str::to_string),
            run_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        })
    }

    /// Read-modify-write with the version guard, re-reading on conflict.
    /// `change` returns `None` when there is nothing to write.
    fn update_with_retry<F>(&self, id: &str, mut change: F) -> Result<Option<Job>>
    where
        F: FnMut(&Job) -> Result<Option<Job>>,
    {
        let mut tries = 0;
        loop {
            let current = self.store.get(id)?;
            let Some(next) = change(&current)? else {
                return Ok(None);
            };
            match self.store.put(&next) {
                Ok(stored) => return Ok(Some(stored)),
                Err(EngineError::Conflict { .. }) if tries + 1 < MAX_CAS_RETRIES => {
                    tries += 1;
                    debug!(job_id = %id, tries, "conflict, re-reading job");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn wake(&self) {
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }
}

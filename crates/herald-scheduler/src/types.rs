use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire exactly once at the given UTC instant. A past instant fires on the next tick.
    At { at: DateTime<Utc> },

    /// Repeat every `interval_secs` seconds, counted from each successful delivery.
    /// The first firing happens at `anchor`, or one interval from now without one.
    Every {
        interval_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<DateTime<Utc>>,
    },

    /// Fire every day at HH:MM UTC.
    Daily { hour: u8, minute: u8 },

    /// Fire on a weekday (0 = Monday … 6 = Sunday) at HH:MM UTC.
    Weekly { day: u8, hour: u8, minute: u8 },
}

impl Trigger {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Trigger::At { .. })
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `trigger_time`.
    Pending,
    /// Claimed by the scheduler and handed to a delivery worker.
    Firing,
    /// Delivered; one-shot jobs end here.
    Delivered,
    /// Ran out of delivery attempts.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Delivered | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Firing => "firing",
            JobState::Delivered => "delivered",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "firing" => Ok(JobState::Firing),
            "delivered" => Ok(JobState::Delivered),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A persisted notification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUID v7 string. Primary key, never reused.
    pub id: String,
    /// Delivery category key.
    pub channel: String,
    pub trigger: Trigger,
    /// Next instant at which the job is due.
    pub trigger_time: DateTime<Utc>,
    /// Opaque content handed to the notifier.
    pub payload: Value,
    pub state: JobState,
    /// Failed delivery attempts since the job last entered `Pending` fresh.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Optimistic-concurrency guard, bumped by the store on every write.
    pub version: u64,
    /// Caller key for at-most-one-live-job scheduling.
    pub unique_key: Option<String>,
    /// Successful deliveries so far.
    pub run_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the job reaches a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Copy of this job moved to `state`, stamped at `now`.
    ///
    /// `version` is left untouched so the copy can be used directly as a
    /// conditional write against the current stored version.
    pub fn transition(&self, state: JobState, now: DateTime<Utc>) -> Job {
        let mut next = self.clone();
        next.state = state;
        next.updated_at = now;
        next.finished_at = if state.is_terminal() { Some(now) } else { None };
        next
    }
}

/// Listing filter for [`crate::store::JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub channel: Option<String>,
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}

/// What `schedule_unique` does when a live job already holds the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UniquePolicy {
    /// Leave the existing job alone and return its id.
    #[default]
    Keep,
    /// Overwrite the existing job's channel, payload and trigger if it is still pending.
    Replace,
}

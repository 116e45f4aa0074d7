use thiserror::Error;

use crate::types::JobState;

/// Errors that can occur within the notification engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying SQLite / rusqlite error. Ticks and deliveries that hit this
    /// are abandoned and picked up again on the next cycle.
    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The schedule request is malformed. Never retried.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    NotFound { id: String },

    /// The job's current state does not allow the requested operation.
    #[error("Job {id} is {state}; cannot {operation}")]
    InvalidState {
        id: String,
        state: JobState,
        operation: &'static str,
    },

    /// Lost an optimistic-concurrency race. `actual` is `None` when the id
    /// was deleted and is tombstoned.
    #[error("Version conflict on job {id}: expected {expected}, found {actual:?}")]
    Conflict {
        id: String,
        expected: u64,
        actual: Option<u64>,
    },

    /// Another live job already holds this unique key.
    #[error("Unique key already taken: {key}")]
    UniqueKeyTaken { key: String },

    /// The channel has been switched off; nothing new may be scheduled on it.
    #[error("Channel disabled: {channel}")]
    ChannelDisabled { channel: String },

    /// A stored row could not be decoded.
    #[error("Corrupt job {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error(transparent)]
    Config(#[from] herald_core::HeraldError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

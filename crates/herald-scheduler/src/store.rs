//! Durable job persistence.
//!
//! [`JobStore`] is the only shared mutable state in the engine. Every write is
//! a compare-and-swap on `version`, so the scheduler, the delivery workers and
//! the public API can race freely without holding a lock across a delivery.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, warn};

use crate::{
    db::init_db,
    error::{EngineError, Result},
    schedule::is_storable,
    types::{Job, JobFilter, JobState, Trigger},
};

const COLUMNS: &str = "id, channel, trigger_rule, trigger_time, payload, state, attempt,
                       max_attempts, version, unique_key, run_count, last_error,
                       created_at, updated_at, finished_at";

const TERMINAL_STATES: &str = "('delivered', 'failed', 'cancelled')";

/// Persistence contract for notification jobs.
///
/// Every mutating call is durable when it returns.
pub trait JobStore: Send + Sync {
    /// Insert or replace `job`, treating `job.version` as the expected stored
    /// version (`0` = insert a new id). Returns the job as stored, with its
    /// version bumped.
    ///
    /// Fails with `Conflict` on a version mismatch or when inserting an id
    /// that exists or was deleted, `NotFound` when replacing a missing id, and
    /// `UniqueKeyTaken` when another live job holds `job.unique_key`.
    fn put(&self, job: &Job) -> Result<Job>;

    fn get(&self, id: &str) -> Result<Job>;

    /// Pending jobs with `trigger_time <= instant`, oldest trigger first,
    /// ties broken by id.
    fn list_due_before(&self, instant: DateTime<Utc>, limit: Option<usize>) -> Result<Vec<Job>>;

    /// Remove a job and tombstone its id. Deleting a missing id is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// Jobs matching `filter`, oldest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// The pending or firing job that holds `key`, if any.
    fn find_by_unique_key(&self, key: &str) -> Result<Option<Job>>;

    /// Return `Firing` jobs last touched at or before `claimed_before` to
    /// `Pending`, bumping their version. Returns how many were reset.
    fn reset_in_flight(&self, now: DateTime<Utc>, claimed_before: DateTime<Utc>) -> Result<usize>;

    /// Delete terminal jobs that finished before `cutoff`. Returns the count.
    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Persist the on/off switch of `channel`.
    fn set_channel_enabled(&self, channel: &str, enabled: bool) -> Result<()>;

    /// Channels are enabled until switched off.
    fn channel_enabled(&self, channel: &str) -> Result<bool>;
}

/// [`JobStore`] backed by a single SQLite connection.
///
/// Open one per process; SQLite's own locking arbitrates between processes
/// sharing the file, and the `version` guard arbitrates between writers.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap a connection, applying the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("job store connection poisoned")
    }

    fn stored_version(conn: &Connection, id: &str) -> Result<Option<u64>> {
        let version = conn
            .query_row("SELECT version FROM jobs WHERE id = ?1", [id], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    fn is_tombstoned(conn: &Connection, id: &str) -> Result<bool> {
        let hit = conn
            .query_row("SELECT 1 FROM deleted_jobs WHERE id = ?1", [id], |_| Ok(()))
            .optional()?;
        Ok(hit.is_some())
    }

    fn insert(conn: &Connection, job: &Job, row: &EncodedJob) -> Result<()> {
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO jobs ({COLUMNS})
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15
                 WHERE NOT EXISTS (SELECT 1 FROM deleted_jobs WHERE id = ?1)"
            ),
            params![
                job.id,
                job.channel,
                row.trigger,
                row.trigger_time,
                row.payload,
                job.state.as_str(),
                job.attempt as i64,
                job.max_attempts as i64,
                (job.version + 1) as i64,
                job.unique_key,
                job.run_count as i64,
                job.last_error,
                row.created_at,
                row.updated_at,
                row.finished_at,
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }

        // Ignored: figure out which constraint stopped us.
        if let Some(actual) = Self::stored_version(conn, &job.id)? {
            return Err(EngineError::Conflict {
                id: job.id.clone(),
                expected: 0,
                actual: Some(actual),
            });
        }
        if Self::is_tombstoned(conn, &job.id)? {
            return Err(EngineError::Conflict {
                id: job.id.clone(),
                expected: 0,
                actual: None,
            });
        }
        match &job.unique_key {
            Some(key) => Err(EngineError::UniqueKeyTaken { key: key.clone() }),
            None => Err(EngineError::Conflict {
                id: job.id.clone(),
                expected: 0,
                actual: None,
            }),
        }
    }

    fn update(conn: &Connection, job: &Job, row: &EncodedJob) -> Result<()> {
        let changed = conn
            .execute(
                "UPDATE jobs SET
                    channel = ?2, trigger_rule = ?3, trigger_time = ?4, payload = ?5,
                    state = ?6, attempt = ?7, max_attempts = ?8, version = ?9,
                    unique_key = ?10, run_count = ?11, last_error = ?12,
                    created_at = ?13, updated_at = ?14, finished_at = ?15
                 WHERE id = ?1 AND version = ?16",
                params![
                    job.id,
                    job.channel,
                    row.trigger,
                    row.trigger_time,
                    row.payload,
                    job.state.as_str(),
                    job.attempt as i64,
                    job.max_attempts as i64,
                    (job.version + 1) as i64,
                    job.unique_key,
                    job.run_count as i64,
                    job.last_error,
                    row.created_at,
                    row.updated_at,
                    row.finished_at,
                    job.version as i64,
                ],
            )
            .map_err(|e| {
                let constraint = matches!(
                    &e,
                    rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
                );
                match &job.unique_key {
                    Some(key) if constraint => EngineError::UniqueKeyTaken { key: key.clone() },
                    _ => EngineError::Storage(e),
                }
            })?;
        if changed == 1 {
            return Ok(());
        }

        match Self::stored_version(conn, &job.id)? {
            Some(actual) => Err(EngineError::Conflict {
                id: job.id.clone(),
                expected: job.version,
                actual: Some(actual),
            }),
            None => Err(EngineError::NotFound { id: job.id.clone() }),
        }
    }
}

impl JobStore for SqliteJobStore {
    fn put(&self, job: &Job) -> Result<Job> {
        let row = EncodedJob::encode(job)?;
        let conn = self.conn();
        if job.version == 0 {
            Self::insert(&conn, job, &row)?;
        } else {
            Self::update(&conn, job, &row)?;
        }
        debug!(job_id = %job.id, state = %job.state, version = job.version + 1, "job stored");

        let mut stored = job.clone();
        stored.version += 1;
        Ok(stored)
    }

    fn get(&self, id: &str) -> Result<Job> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                JobRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => row.into_job(),
            None => Err(EngineError::NotFound { id: id.to_string() }),
        }
    }

    fn list_due_before(&self, instant: DateTime<Utc>, limit: Option<usize>) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE state = 'pending' AND trigger_time <= ?1
             ORDER BY trigger_time ASC, id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![fmt_ts(instant), sql_limit(limit)],
            JobRow::from_row,
        )?;
        decode_rows(rows)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        tx.execute("INSERT OR IGNORE INTO deleted_jobs (id) VALUES (?1)", [id])?;
        tx.commit()?;
        if removed > 0 {
            debug!(job_id = %id, "job deleted");
        }
        Ok(())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR channel = ?1) AND (?2 IS NULL OR state = ?2)
             ORDER BY created_at ASC, id ASC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![
                filter.channel,
                filter.state.map(JobState::as_str),
                sql_limit(filter.limit)
            ],
            JobRow::from_row,
        )?;
        decode_rows(rows)
    }

    fn find_by_unique_key(&self, key: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM jobs
                     WHERE unique_key = ?1 AND state IN ('pending', 'firing')"
                ),
                [key],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    fn reset_in_flight(&self, now: DateTime<Utc>, claimed_before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET state = 'pending', version = version + 1, updated_at = ?1
             WHERE state = 'firing' AND updated_at <= ?2",
            params![fmt_ts(now), fmt_ts(claimed_before)],
        )?;
        Ok(n)
    }

    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = fmt_ts(cutoff);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO deleted_jobs (id)
                 SELECT id FROM jobs
                 WHERE state IN {TERMINAL_STATES} AND finished_at IS NOT NULL AND finished_at < ?1"
            ),
            [&cutoff],
        )?;
        let n = tx.execute(
            &format!(
                "DELETE FROM jobs
                 WHERE state IN {TERMINAL_STATES} AND finished_at IS NOT NULL AND finished_at < ?1"
            ),
            [&cutoff],
        )?;
        tx.commit()?;
        Ok(n)
    }

    fn set_channel_enabled(&self, channel: &str, enabled: bool) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO channel_settings (channel, enabled) VALUES (?1, ?2)
             ON CONFLICT (channel) DO UPDATE SET enabled = excluded.enabled",
            params![channel, i64::from(enabled)],
        )?;
        Ok(())
    }

    fn channel_enabled(&self, channel: &str) -> Result<bool> {
        let conn = self.conn();
        let enabled = conn
            .query_row(
                "SELECT enabled FROM channel_settings WHERE channel = ?1",
                [channel],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(enabled.map_or(true, |v| v != 0))
    }
}

/// Timestamps are stored as fixed-width RFC 3339 (`…T12:00:00.000000Z`) so
/// that string comparison in SQL matches chronological order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn sql_limit(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as "no limit".
    limit.map(|l| l as i64).unwrap_or(-1)
}

/// Column values of a job that need encoding before binding.
struct EncodedJob {
    trigger: String,
    trigger_time: String,
    payload: String,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl EncodedJob {
    fn encode(job: &Job) -> Result<Self> {
        if !is_storable(job.trigger_time) {
            return Err(EngineError::InvalidSchedule(format!(
                "trigger time {} is outside years 0000-9999",
                job.trigger_time
            )));
        }
        let trigger = serde_json::to_string(&job.trigger).map_err(|e| EngineError::Corrupt {
            id: job.id.clone(),
            reason: format!("trigger does not serialise: {e}"),
        })?;
        Ok(Self {
            trigger,
            trigger_time: fmt_ts(job.trigger_time),
            payload: job.payload.to_string(),
            created_at: fmt_ts(job.created_at),
            updated_at: fmt_ts(job.updated_at),
            finished_at: job.finished_at.map(fmt_ts),
        })
    }
}

/// Raw column values as read from SQLite.
struct JobRow {
    id: String,
    channel: String,
    trigger: String,
    trigger_time: String,
    payload: String,
    state: String,
    attempt: i64,
    max_attempts: i64,
    version: i64,
    unique_key: Option<String>,
    run_count: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            channel: row.get(1)?,
            trigger: row.get(2)?,
            trigger_time: row.get(3)?,
            payload: row.get(4)?,
            state: row.get(5)?,
            attempt: row.get(6)?,
            max_attempts: row.get(7)?,
            version: row.get(8)?,
            unique_key: row.get(9)?,
            run_count: row.get(10)?,
            last_error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            finished_at: row.get(14)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let id = self.id;
        let corrupt = |reason: String| EngineError::Corrupt {
            id: id.clone(),
            reason,
        };

        let trigger: Trigger = serde_json::from_str(&self.trigger)
            .map_err(|e| corrupt(format!("bad trigger JSON: {e}")))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("bad payload JSON: {e}")))?;
        let state: JobState = self.state.parse().map_err(corrupt)?;
        let parse = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp {s:?}: {e}")))
        };

        Ok(Job {
            trigger,
            trigger_time: parse(&self.trigger_time)?,
            payload,
            state,
            channel: self.channel,
            attempt: self.attempt as u32,
            max_attempts: self.max_attempts as u32,
            version: self.version as u64,
            unique_key: self.unique_key,
            run_count: self.run_count as u32,
            last_error: self.last_error,
            created_at: parse(&self.created_at)?,
            updated_at: parse(&self.updated_at)?,
            finished_at: self.finished_at.as_deref().map(parse).transpose()?,
            id,
        })
    }
}

fn decode_rows(rows: impl Iterator<Item = rusqlite::Result<JobRow>>) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for row in rows {
        match row?.into_job() {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("skipping undecodable job row: {e}"),
        }
    }
    Ok(jobs)
}

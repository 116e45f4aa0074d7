use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, Utc};

use crate::error::{EngineError, Result};
use crate::types::Trigger;

/// Longest accepted `Every` interval (ten years).
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// 9999-12-31T23:59:59Z as a Unix timestamp. Later instants need a signed
/// five-digit year in RFC 3339 and cannot be stored or read back.
const LATEST_STORABLE_SECS: i64 = 253_402_300_799;

/// Latest instant a job's `trigger_time` may hold.
pub fn latest_storable() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_STORABLE_SECS, 0).unwrap_or_default()
}

/// Whether `ts` survives the store's RFC 3339 encoding (years 0000..=9999).
pub fn is_storable(ts: DateTime<Utc>) -> bool {
    (0..=9999).contains(&ts.year())
}

/// Reject triggers that can never produce a valid `trigger_time`.
pub fn validate(trigger: &Trigger) -> Result<()> {
    match trigger {
        Trigger::At { at } => check_storable(*at, "fire time"),
        Trigger::Every {
            interval_secs,
            anchor,
        } => {
            if let Some(anchor) = anchor {
                check_storable(*anchor, "anchor")?;
            }
            if *interval_secs == 0 {
                return Err(EngineError::InvalidSchedule(
                    "interval must be at least one second".to_string(),
                ));
            }
            if *interval_secs > MAX_INTERVAL_SECS {
                return Err(EngineError::InvalidSchedule(format!(
                    "interval of {interval_secs}s exceeds the {MAX_INTERVAL_SECS}s maximum"
                )));
            }
            Ok(())
        }
        Trigger::Daily { hour, minute } => check_time_of_day(*hour, *minute),
        Trigger::Weekly { day, hour, minute } => {
            if *day > 6 {
                return Err(EngineError::InvalidSchedule(format!(
                    "weekday {day} out of range (0 = Monday … 6 = Sunday)"
                )));
            }
            check_time_of_day(*hour, *minute)
        }
    }
}

fn check_storable(ts: DateTime<Utc>, what: &str) -> Result<()> {
    if !is_storable(ts) {
        return Err(EngineError::InvalidSchedule(format!(
            "{what} {ts} is outside years 0000-9999"
        )));
    }
    Ok(())
}

fn check_time_of_day(hour: u8, minute: u8) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(EngineError::InvalidSchedule(format!(
            "time {hour:02}:{minute:02} is not a valid UTC time of day"
        )));
    }
    Ok(())
}

/// The `trigger_time` a freshly scheduled job starts with.
pub fn first_trigger_time(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::At { at } => Some(*at),
        Trigger::Every {
            anchor: Some(anchor),
            ..
        } => Some(*anchor),
        _ => compute_next_run(trigger, now),
    }
}

/// Compute the next UTC execution time for `trigger` after a delivery at `from`.
///
/// Returns `None` for one-shot triggers: once an `At` job has fired there is
/// nothing left to schedule. Also `None` once the next run would fall after
/// [`latest_storable`].
pub fn compute_next_run(trigger: &Trigger, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_run_unchecked(trigger, from).filter(|next| is_storable(*next))
}

fn next_run_unchecked(trigger: &Trigger, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::At { .. } => None,

        Trigger::Every { interval_secs, .. } => {
            let step = Duration::try_seconds(i64::try_from(*interval_secs).ok()?)?;
            from.checked_add_signed(step)
        }

        Trigger::Daily { hour, minute } => {
            let candidate = at_time_of_day(from.date_naive(), *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                // Window already passed today.
                candidate.checked_add_days(Days::new(1))
            }
        }

        Trigger::Weekly { day, hour, minute } => {
            // 0 = Monday matches chrono's `num_days_from_monday`.
            let today = i64::from(from.weekday().num_days_from_monday());
            let ahead = (i64::from(*day) - today).rem_euclid(7) as u64;
            let date = from.date_naive().checked_add_days(Days::new(ahead))?;
            let candidate = at_time_of_day(date, *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                candidate.checked_add_days(Days::new(7))
            }
        }
    }
}

/// `now + delay`, saturating at [`latest_storable`].
pub fn add_delay(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .filter(|at| is_storable(*at))
        .unwrap_or_else(latest_storable)
}

fn at_time_of_day(date: NaiveDate, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    date.and_hms_opt(u32::from(hour), u32::from(minute), 0)
        .map(|naive| naive.and_utc())
}

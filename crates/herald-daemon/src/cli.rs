use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use herald_scheduler::{JobState, Trigger};

#[derive(Parser)]
#[command(
    name = "herald",
    version,
    about = "Durable notification scheduler",
    long_about = "Schedules notifications on named channels, persists them in SQLite \
                  and delivers them on time with retries. The CLI and a running \
                  `herald run` share the same database file."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (default: $HERALD_CONFIG, then ~/.herald/herald.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler and delivery workers until Ctrl-C
    Run,

    /// Schedule a notification
    Schedule {
        #[arg(long)]
        channel: String,

        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        body: String,

        /// Extra JSON metadata forwarded to the notifier
        #[arg(long, value_name = "JSON")]
        data: Option<String>,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Keep at most one live job for this key
        #[arg(long, value_name = "KEY")]
        unique: Option<String>,

        /// Replace the live job holding --unique instead of keeping it
        #[arg(long, requires = "unique")]
        replace: bool,
    },

    /// Cancel a job
    Cancel { id: String },

    /// Cancel every live job on a channel
    CancelChannel { channel: String },

    /// Switch a channel back on
    Enable { channel: String },

    /// Switch a channel off and cancel its live jobs
    Disable { channel: String },

    /// Give a pending job a new trigger
    Reschedule {
        id: String,

        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Print one job as JSON
    Show { id: String },

    /// List jobs
    List {
        #[arg(long)]
        channel: Option<String>,

        /// pending | firing | delivered | failed | cancelled
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete finished jobs older than the given age
    Purge {
        #[arg(long, value_name = "SECS")]
        older_than: u64,
    },
}

/// Exactly one way of saying when a job fires.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct TriggerArgs {
    /// Fire once at an RFC 3339 instant
    #[arg(long, value_name = "RFC3339")]
    pub at: Option<String>,

    /// Fire once, this many seconds from now
    #[arg(long = "in", value_name = "SECS")]
    pub in_secs: Option<u64>,

    /// Repeat every SECS seconds; first run at ANCHOR if given
    #[arg(long, value_name = "SECS[@ANCHOR]")]
    pub every: Option<String>,

    /// Fire every day at HH:MM UTC
    #[arg(long, value_name = "HH:MM")]
    pub daily: Option<String>,

    /// Fire weekly, e.g. `mon@09:30` (UTC)
    #[arg(long, value_name = "DAY@HH:MM")]
    pub weekly: Option<String>,
}

impl TriggerArgs {
    pub fn into_trigger(self, now: DateTime<Utc>) -> Result<Trigger> {
        if let Some(at) = self.at {
            return Ok(Trigger::At {
                at: parse_instant(&at)?,
            });
        }
        if let Some(secs) = self.in_secs {
            let delay = i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .ok_or_else(|| anyhow!("--in {secs} is too large"))?;
            return Ok(Trigger::At { at: now + delay });
        }
        if let Some(every) = self.every {
            let (secs, anchor) = match every.split_once('@') {
                Some((secs, anchor)) => (secs, Some(parse_instant(anchor)?)),
                None => (every.as_str(), None),
            };
            let interval_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("--every expects seconds, got {secs:?}"))?;
            return Ok(Trigger::Every {
                interval_secs,
                anchor,
            });
        }
        if let Some(daily) = self.daily {
            let (hour, minute) = parse_hh_mm(&daily)?;
            return Ok(Trigger::Daily { hour, minute });
        }
        if let Some(weekly) = self.weekly {
            let (day, time) = weekly
                .split_once('@')
                .ok_or_else(|| anyhow!("--weekly expects DAY@HH:MM, got {weekly:?}"))?;
            let (hour, minute) = parse_hh_mm(time)?;
            return Ok(Trigger::Weekly {
                day: parse_weekday(day)?,
                hour,
                minute,
            });
        }
        bail!("one of --at, --in, --every, --daily or --weekly is required")
    }
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("not an RFC 3339 timestamp: {s:?}"))
}

/// Range checks are left to the service so the CLI reports the same errors
/// as library callers.
fn parse_hh_mm(s: &str) -> Result<(u8, u8)> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("expected HH:MM, got {s:?}"))?;
    Ok((
        h.parse().with_context(|| format!("bad hour in {s:?}"))?,
        m.parse().with_context(|| format!("bad minute in {s:?}"))?,
    ))
}

/// `mon`..`sun` (any case, full names too) or `0`..`6` with 0 = Monday.
fn parse_weekday(s: &str) -> Result<u8> {
    let s = s.trim().to_ascii_lowercase();
    if let Ok(n) = s.parse::<u8>() {
        return Ok(n);
    }
    const DAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
    DAYS.iter()
        .position(|d| s.starts_with(d))
        .map(|i| i as u8)
        .ok_or_else(|| anyhow!("unknown weekday {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn args() -> TriggerArgs {
        TriggerArgs {
            at: None,
            in_secs: None,
            every: None,
            daily: None,
            weekly: None,
        }
    }

    #[test]
    fn relative_delay_becomes_absolute_instant() {
        let t = TriggerArgs {
            in_secs: Some(90),
            ..args()
        };
        assert_eq!(
            t.into_trigger(now()).unwrap(),
            Trigger::At {
                at: now() + Duration::seconds(90)
            }
        );
    }

    #[test]
    fn every_accepts_optional_anchor() {
        let t = TriggerArgs {
            every: Some("60@2026-10-20T08:00:00Z".to_string()),
            ..args()
        };
        assert_eq!(
            t.into_trigger(now()).unwrap(),
            Trigger::Every {
                interval_secs: 60,
                anchor: Some(Utc.with_ymd_and_hms(2026, 10, 20, 8, 0, 0).unwrap()),
            }
        );
    }

    #[test]
    fn weekly_parses_day_names() {
        let t = TriggerArgs {
            weekly: Some("Wednesday@07:45".to_string()),
            ..args()
        };
        assert_eq!(
            t.into_trigger(now()).unwrap(),
            Trigger::Weekly {
                day: 2,
                hour: 7,
                minute: 45
            }
        );
        assert!(parse_weekday("someday").is_err());
    }

    #[test]
    fn malformed_times_are_errors() {
        assert!(parse_hh_mm("0930").is_err());
        assert!(parse_instant("tomorrow").is_err());
    }

    #[test]
    fn disable_takes_a_channel() {
        let cli = Cli::try_parse_from(["herald", "disable", "promotions"]).unwrap();
        assert!(matches!(cli.command, Commands::Disable { channel } if channel == "promotions"));
        assert!(Cli::try_parse_from(["herald", "enable"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

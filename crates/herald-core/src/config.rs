use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::error::{HeraldError, Result};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_DISPATCH_CAPACITY: usize = 256;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 30;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 60 * 60;
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Top-level config (herald.toml + HERALD_* env overrides).
///
/// Every section has defaults, so a missing file still yields a usable config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cadence of the due-job check.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Bound of the queue between the scheduler and the delivery workers.
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Delivery attempts before a job settles in `Failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Per-call notifier timeout; expiry counts as a failed attempt.
    #[serde(default = "default_delivery_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            timeout_secs: DEFAULT_DELIVERY_TIMEOUT_SECS,
        }
    }
}

/// Garbage collection of finished jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Delete Delivered/Failed/Cancelled jobs this long after they finished.
    /// `None` keeps them forever.
    #[serde(default)]
    pub finished_after_secs: Option<u64>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            finished_after_secs: None,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// Emit a tracing event per delivery.
    #[default]
    Log,
    /// POST each delivery to the channel's `webhook_url`.
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub kind: NotifierKind,
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.db", home)
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_dispatch_capacity() -> usize {
    DEFAULT_DISPATCH_CAPACITY
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_base_secs() -> u64 {
    DEFAULT_BACKOFF_BASE_SECS
}
fn default_backoff_max_secs() -> u64 {
    DEFAULT_BACKOFF_MAX_SECS
}
fn default_delivery_timeout_secs() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_SECS
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl HeraldConfig {
    /// Load config from a TOML file with HERALD_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `HERALD_DELIVERY__MAX_ATTEMPTS=5`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("__"))
            .extract::<Self>()
            .map(Self::normalised)
            .map_err(|e| HeraldError::Config(e.to_string()))
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml(toml: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract::<Self>()
            .map(Self::normalised)
            .map_err(|e| HeraldError::Config(e.to_string()))
    }

    /// Channel ids are matched exactly everywhere after load.
    fn normalised(mut self) -> Self {
        for channel in &mut self.channels {
            channel.id = channel.id.trim().to_string();
        }
        self
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Importance;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = HeraldConfig::from_toml("").unwrap();
        assert_eq!(cfg.scheduler.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(cfg.delivery.max_attempts, 3);
        assert_eq!(cfg.delivery.workers, DEFAULT_WORKERS);
        assert!(cfg.retention.finished_after_secs.is_none());
        assert_eq!(cfg.notifier.kind, NotifierKind::Log);
        assert!(cfg.channels.is_empty());
    }

    #[test]
    fn channels_and_overrides_parse() {
        let cfg = HeraldConfig::from_toml(
            r#"
            [delivery]
            max_attempts = 5
            backoff_base_secs = 2

            [retention]
            finished_after_secs = 86400

            [notifier]
            kind = "webhook"

            [[channels]]
            id = "reminders"
            name = "Appointment reminders"
            importance = "high"
            webhook_url = "https://hooks.example.test/reminders"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.delivery.max_attempts, 5);
        assert_eq!(cfg.delivery.backoff_base_secs, 2);
        assert_eq!(cfg.delivery.backoff_max_secs, DEFAULT_BACKOFF_MAX_SECS);
        assert_eq!(cfg.retention.finished_after_secs, Some(86_400));
        assert_eq!(cfg.notifier.kind, NotifierKind::Webhook);
        assert_eq!(cfg.channels.len(), 1);
        assert_eq!(cfg.channels[0].importance, Importance::High);
    }

    #[test]
    fn channel_ids_are_trimmed_on_load() {
        let cfg = HeraldConfig::from_toml(
            r#"
            [[channels]]
            id = " reminders "
            webhook_url = "https://hooks.example.test/reminders"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.channels[0].id, "reminders");
    }

    #[test]
    fn bad_value_is_a_config_error() {
        let err = HeraldConfig::from_toml("[delivery]\nworkers = \"many\"").unwrap_err();
        assert!(matches!(err, HeraldError::Config(_)));
    }
}

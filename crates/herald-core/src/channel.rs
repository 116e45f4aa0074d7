//! Delivery channel definitions.
//!
//! A channel is a caller-chosen category key (e.g. `"reminders"`). The engine
//! only routes on the key; everything else here is handed to the notifier
//! untouched when the engine starts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{HeraldError, Result};

/// Relative importance the notifier should give a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Min,
    Low,
    #[default]
    Default,
    High,
}

/// One `[[channels]]` entry from `herald.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Routing key stored in `jobs.channel`.
    pub id: String,
    /// Human-readable channel name shown by the platform.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub importance: Importance,
    /// Target for the webhook notifier. Ignored by the log notifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// HMAC-SHA256 signing key for webhook deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            importance: Importance::Default,
            webhook_url: None,
            secret: None,
        }
    }
}

/// Lookup table of configured channels.
///
/// An empty registry is permissive: any non-empty channel key is accepted.
/// Once at least one channel is configured, only configured keys are.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, ChannelConfig>,
}

impl ChannelRegistry {
    /// Build a registry, rejecting blank or duplicate ids. Ids are trimmed.
    pub fn from_configs(configs: &[ChannelConfig]) -> Result<Self> {
        let mut channels = BTreeMap::new();
        for cfg in configs {
            let id = cfg.id.trim();
            if id.is_empty() {
                return Err(HeraldError::InvalidChannel(
                    "channel id must not be empty".to_string(),
                ));
            }
            let cfg = ChannelConfig {
                id: id.to_string(),
                ..cfg.clone()
            };
            if channels.insert(id.to_string(), cfg).is_some() {
                return Err(HeraldError::InvalidChannel(format!(
                    "duplicate channel id: {id}"
                )));
            }
        }
        Ok(Self { channels })
    }

    /// Whether a job may be scheduled on `id`.
    pub fn accepts(&self, id: &str) -> bool {
        !id.trim().is_empty() && (self.channels.is_empty() || self.channels.contains_key(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_accepts_any_non_blank_key() {
        let reg = ChannelRegistry::default();
        assert!(reg.accepts("reminders"));
        assert!(!reg.accepts(""));
        assert!(!reg.accepts("   "));
    }

    #[test]
    fn configured_registry_is_strict() {
        let reg = ChannelRegistry::from_configs(&[ChannelConfig::new("reminders")]).unwrap();
        assert!(reg.accepts("reminders"));
        assert!(!reg.accepts("promotions"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = ChannelRegistry::from_configs(&[
            ChannelConfig::new("reminders"),
            ChannelConfig::new("reminders"),
        ])
        .unwrap_err();
        assert!(matches!(err, HeraldError::InvalidChannel(_)));
    }

    #[test]
    fn ids_are_trimmed() {
        let reg = ChannelRegistry::from_configs(&[ChannelConfig::new(" reminders ")]).unwrap();
        assert!(reg.accepts("reminders"));
        assert_eq!(reg.iter().next().unwrap().id, "reminders");
        assert!(ChannelRegistry::from_configs(&[
            ChannelConfig::new("reminders"),
            ChannelConfig::new("reminders "),
        ])
        .is_err());
    }

    #[test]
    fn blank_id_is_rejected() {
        assert!(ChannelRegistry::from_configs(&[ChannelConfig::new(" ")]).is_err());
    }
}

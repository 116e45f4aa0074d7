use std::time::Duration;

use async_trait::async_trait;
use herald_core::ChannelConfig;
use serde_json::Value;
use thiserror::Error;

/// Why a notifier could not deliver. Every variant counts as one failed
/// attempt; the worker decides whether to retry.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The target refused the notification.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The target could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Outbound delivery of a job's payload.
///
/// Implementations decide how a notification is shown; the engine only
/// decides whether, when, and how many times `deliver` is called.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, channel: &str, payload: &Value) -> Result<(), DeliveryError>;

    /// Called once per configured channel when the engine starts.
    async fn register_channel(&self, _channel: &ChannelConfig) -> Result<(), DeliveryError> {
        Ok(())
    }
}

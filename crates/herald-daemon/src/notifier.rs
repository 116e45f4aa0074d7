//! Notifiers shipped with the daemon.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use herald_core::{ChannelConfig, Notification};
use herald_scheduler::{DeliveryError, Notifier};
use reqwest::{header::CONTENT_TYPE, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the request body.
pub const SIGNATURE_HEADER: &str = "X-Herald-Signature-256";

/// Writes every delivery to the log. Never fails.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, channel: &str, payload: &Value) -> Result<(), DeliveryError> {
        match Notification::from_payload(payload) {
            Some(n) => info!(%channel, title = %n.title, body = %n.body, "notification"),
            None => info!(%channel, %payload, "notification"),
        }
        Ok(())
    }

    async fn register_channel(&self, channel: &ChannelConfig) -> Result<(), DeliveryError> {
        debug!(
            channel = %channel.id,
            name = ?channel.name,
            importance = ?channel.importance,
            "log channel ready"
        );
        Ok(())
    }
}

struct WebhookTarget {
    url: String,
    secret: Option<String>,
}

/// POSTs `{"channel", "payload"}` to the channel's `webhook_url`.
///
/// 2xx is a delivery; 429 and 5xx are `Unavailable`; any other status is
/// `Rejected`. Both count as a failed attempt for the retry policy.
pub struct WebhookNotifier {
    client: reqwest::Client,
    timeout: Duration,
    targets: HashMap<String, WebhookTarget>,
}

impl WebhookNotifier {
    pub fn new(channels: &[ChannelConfig], timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let targets = channels
            .iter()
            .filter_map(|c| {
                let url = c.webhook_url.clone()?;
                Some((
                    c.id.trim().to_string(),
                    WebhookTarget {
                        url,
                        secret: c.secret.clone(),
                    },
                ))
            })
            .collect();
        Ok(Self {
            client,
            timeout,
            targets,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, channel: &str, payload: &Value) -> Result<(), DeliveryError> {
        let target = self.targets.get(channel).ok_or_else(|| {
            DeliveryError::Rejected(format!("no webhook_url configured for channel {channel}"))
        })?;
        let body = serde_json::to_vec(&json!({ "channel": channel, "payload": payload }))
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;

        let mut req = self
            .client
            .post(&target.url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(secret) = &target.secret {
            req = req.header(SIGNATURE_HEADER, sign(secret, &body)?);
        }

        let resp = req.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout)
            } else {
                DeliveryError::Unavailable(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            debug!(%channel, %status, "webhook accepted");
            Ok(())
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(DeliveryError::Unavailable(format!("webhook returned {status}")))
        } else {
            Err(DeliveryError::Rejected(format!("webhook returned {status}")))
        }
    }

    async fn register_channel(&self, channel: &ChannelConfig) -> Result<(), DeliveryError> {
        if self.targets.contains_key(&channel.id) {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(format!(
                "channel {} has no webhook_url",
                channel.id
            )))
        }
    }
}

/// GitHub-style signature: `sha256=<hex HMAC-SHA256 of body>`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeliveryError::Rejected("invalid HMAC key length".to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

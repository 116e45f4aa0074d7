//! Notification content: what callers usually put in a job payload.
//!
//! The scheduler never looks inside a payload; this type only exists so the
//! CLI and notifiers agree on a shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stored as the JSON `payload` of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// Free-form metadata forwarded to the notifier (deep-link target, ids, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data: None,
        }
    }

    pub fn to_payload(&self) -> Value {
        // Serialising a struct of strings and a Value cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Best-effort parse of a payload that may or may not be a `Notification`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_omits_empty_fields() {
        let n = Notification::new("Appointment tomorrow", "");
        assert_eq!(n.to_payload(), serde_json::json!({"title": "Appointment tomorrow"}));
    }

    #[test]
    fn foreign_payload_is_not_a_notification() {
        assert!(Notification::from_payload(&serde_json::json!({"x": 1})).is_none());
    }
}

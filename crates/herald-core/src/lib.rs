//! Shared types for the Herald workspace: configuration, channel definitions
//! and the notification content carried in job payloads.

pub mod channel;
pub mod config;
pub mod error;
pub mod notification;

pub use channel::{ChannelConfig, ChannelRegistry, Importance};
pub use config::HeraldConfig;
pub use error::{HeraldError, Result};
pub use notification::Notification;

//! `herald-scheduler`: durable notification scheduling with SQLite persistence.
//!
//! # Overview
//!
//! Jobs are persisted through a [`store::JobStore`] (SQLite by default). The
//! [`engine::Scheduler`] ticks on a fixed interval, claims due jobs with a
//! version-guarded `Pending -> Firing` write and queues them for the
//! [`worker::DeliveryPool`], which calls the [`notifier::Notifier`] and
//! records the outcome (delivered, next recurrence, retry with backoff, or
//! failed). Callers talk to [`service::NotificationService`];
//! [`runtime::start`] wires everything together from a `HeraldConfig`.
//!
//! # Trigger variants
//!
//! | Variant  | Behaviour                                                   |
//! |----------|-------------------------------------------------------------|
//! | `At`     | Single fire at an absolute UTC instant                      |
//! | `Every`  | Repeat every N seconds after each delivery, optional anchor |
//! | `Daily`  | Fire at HH:MM UTC every day                                 |
//! | `Weekly` | Fire at HH:MM UTC on a specific weekday                     |
//!
//! # Job states
//!
//! `Pending -> Firing -> Delivered | Failed | Pending (retry or recurrence)`,
//! and `Pending | Firing -> Cancelled` at the caller's request.

pub mod backoff;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod runtime;
pub mod schedule;
pub mod service;
pub mod store;
pub mod types;
pub mod worker;

pub use backoff::RetryPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Scheduler, TickReport};
pub use error::{EngineError, Result};
pub use notifier::{DeliveryError, Notifier};
pub use runtime::{start, EngineHandle};
pub use service::NotificationService;
pub use store::{JobStore, SqliteJobStore};
pub use types::{Job, JobFilter, JobState, Trigger, UniquePolicy};
pub use worker::{DeliveryPool, Settlement};

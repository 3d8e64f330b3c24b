//! Job lifecycle events and notification delivery.
//!
//! This crate provides:
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`JobEvent`]: the lifecycle event envelope published by the
//!   scheduler and job monitors.
//! - [`EventJournal`]: background task that records every event in the
//!   structured log.
//! - [`NotificationSink`]: the contract for delivering finished
//!   artifacts, with [`WebhookSink`] and [`LogSink`] implementations.

pub mod bus;
pub mod delivery;
pub mod journal;
pub mod sink;

pub use bus::{EventBus, JobEvent};
pub use delivery::log::LogSink;
pub use delivery::webhook::WebhookSink;
pub use journal::EventJournal;
pub use sink::{DeliveryMetadata, NotificationError, NotificationSink};

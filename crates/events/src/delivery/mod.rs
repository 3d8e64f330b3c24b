//! Notification sinks that deliver finished artifacts outside the scheduler.

pub mod log;
pub mod webhook;

//! Shared types for the renderq scheduler workspace.
//!
//! This crate has zero internal dependencies so that every other crate
//! (store, worker client, events, scheduler) can depend on it.

pub mod artifact;
pub mod error;
pub mod job_events;
pub mod types;
pub mod worker;

//! Repository layer: one unit struct of associated async functions per table.

pub mod request_repo;

pub use request_repo::{CreateOutcome, RequestRepo};

//! ComfyUI REST client library.
//!
//! Provides HTTP API wrappers for a ComfyUI worker endpoint, typed
//! parsing of its queue and history documents, and the
//! [`WorkerBackend`](backend::WorkerBackend) contract the scheduler
//! drives every worker through.

pub mod api;
pub mod backend;
pub mod history;
pub mod queue;

pub use api::{ComfyUIApi, ComfyUIApiError};
pub use backend::{BackendError, JobResult, QueueSnapshot, WorkerBackend};

//! The worker endpoint contract and its ComfyUI implementation.
//!
//! The scheduler talks to every backend (local or remote) through
//! [`WorkerBackend`]; tests substitute in-memory fakes.

use async_trait::async_trait;
use renderq_core::artifact::ArtifactRef;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::parse_history;

/// Errors a worker backend can report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The endpoint could not be reached or answered with a server error.
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    /// The endpoint refused the request (bad workflow, client error).
    #[error("worker rejected the request: {0}")]
    Rejected(String),

    /// The endpoint answered with a document that could not be understood.
    #[error("unexpected worker response: {0}")]
    Protocol(String),
}

impl From<ComfyUIApiError> for BackendError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Request(e) if e.is_decode() => BackendError::Protocol(e.to_string()),
            ComfyUIApiError::Request(e) => BackendError::Unreachable(e.to_string()),
            ComfyUIApiError::ApiError { status, body } if status >= 500 => {
                BackendError::Unreachable(format!("HTTP {status}: {body}"))
            }
            ComfyUIApiError::ApiError { status, body } => {
                BackendError::Rejected(format!("HTTP {status}: {body}"))
            }
            ComfyUIApiError::Rejected(msg) => BackendError::Rejected(msg),
        }
    }
}

/// Job ids currently known to a worker's execution queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    /// Whether the job is still running or waiting on the worker.
    pub fn contains(&self, external_job_id: &str) -> bool {
        self.running.iter().any(|id| id == external_job_id)
            || self.pending.iter().any(|id| id == external_job_id)
    }

    pub fn is_running(&self, external_job_id: &str) -> bool {
        self.running.iter().any(|id| id == external_job_id)
    }
}

/// What a worker's result store holds for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResult {
    pub artifacts: Vec<ArtifactRef>,
    /// Worker-side status string, e.g. `"success"` / `"error"`.
    pub status: Option<String>,
    pub completed: bool,
    /// Best-effort failure reason from worker diagnostics.
    pub error: Option<String>,
}

impl JobResult {
    /// Terminal success means at least one output file.
    pub fn has_output(&self) -> bool {
        !self.artifacts.is_empty()
    }
}

/// A capacity-1 execution backend.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Liveness probe. Never errors; an unreachable worker is unhealthy.
    async fn health_check(&self) -> bool;

    /// Queue a workflow and return the worker's id for it.
    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, BackendError>;

    /// Jobs currently running or pending on the worker.
    async fn queue_status(&self) -> Result<QueueSnapshot, BackendError>;

    /// The result store entry for a job, `None` if there is none.
    async fn result(&self, external_job_id: &str) -> Result<Option<JobResult>, BackendError>;

    /// Best-effort removal of a job from the worker.
    async fn cancel(&self, external_job_id: &str) -> Result<(), BackendError>;
}

#[async_trait]
impl WorkerBackend for ComfyUIApi {
    async fn health_check(&self) -> bool {
        match self.system_stats().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(api_url = %self.api_url(), error = %e, "ComfyUI health check failed");
                false
            }
        }
    }

    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, BackendError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let response = self.submit_workflow(workflow, &client_id).await?;

        tracing::debug!(
            api_url = %self.api_url(),
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow queued on ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn queue_status(&self) -> Result<QueueSnapshot, BackendError> {
        Ok(self.get_queue().await?.into_snapshot())
    }

    async fn result(&self, external_job_id: &str) -> Result<Option<JobResult>, BackendError> {
        let document = self.get_history(external_job_id).await?;
        let entry = parse_history(&document, external_job_id)
            .map_err(|e| BackendError::Protocol(e.to_string()))?;

        Ok(entry.map(|entry| JobResult {
            artifacts: entry.artifacts(self),
            status: entry.status_str().map(str::to_string),
            completed: entry.completed(),
            error: entry.error_reason(),
        }))
    }

    async fn cancel(&self, external_job_id: &str) -> Result<(), BackendError> {
        self.cancel_execution(external_job_id).await?;

        // Deleting from the queue does not stop a prompt that already started.
        let queue = self.queue_status().await?;
        if queue.is_running(external_job_id) {
            self.interrupt().await?;
        }
        Ok(())
    }
}

//! Request entity model and the DTOs used to mutate it.

use serde::Serialize;
use sqlx::FromRow;
use renderq_core::types::{DbId, Timestamp};

use super::status::{RequestStatus, StatusId};

/// A row from the `requests` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Request {
    pub id: DbId,
    pub owner_id: String,
    /// Primary FIFO key. Strictly increasing, never reused.
    pub position: i64,
    pub status_id: StatusId,
    /// Opaque job descriptor handed to the payload builder.
    pub payload: serde_json::Value,
    /// Identifier the worker assigned when it accepted the job.
    pub external_job_id: Option<String>,
    /// Advisory only; the in-memory worker pool is authoritative.
    pub assigned_worker_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl Request {
    /// Typed status. Unknown ids (not in the seed data) map to `None`.
    pub fn status(&self) -> Option<RequestStatus> {
        RequestStatus::from_id(self.status_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(RequestStatus::is_terminal)
    }
}

/// Optional fields written alongside a status change.
///
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub external_job_id: Option<String>,
    pub assigned_worker_id: Option<String>,
    pub error: Option<String>,
}

impl StatusUpdate {
    /// Update carrying only an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Update recording which worker accepted the job and under which id.
    pub fn dispatched(external_job_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            external_job_id: Some(external_job_id.into()),
            assigned_worker_id: Some(worker_id.into()),
            error: None,
        }
    }
}

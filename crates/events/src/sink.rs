//! The notification contract invoked after a job completes.
//!
//! Delivery is a separate failure domain from job status: a sink error is
//! recorded as an annotation on the completed request and never turns it
//! into a failure.

use async_trait::async_trait;
use renderq_core::artifact::ArtifactRef;
use renderq_core::types::{DbId, Timestamp};
use serde::Serialize;

/// Context about the finished job passed along with its artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetadata {
    pub request_id: DbId,
    pub worker_id: String,
    pub external_job_id: String,
    pub completed_at: Timestamp,
    /// Wall-clock seconds between dispatch and completion.
    pub elapsed_secs: u64,
}

/// Errors a notification sink can report.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote endpoint returned a non-2xx status code.
    #[error("Notification endpoint returned HTTP {0}")]
    HttpStatus(u16),

    /// Any other sink-specific failure.
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Delivers finished artifacts to their owner.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        artifacts: &[ArtifactRef],
        owner_id: &str,
        metadata: &DeliveryMetadata,
    ) -> Result<(), NotificationError>;
}

//! Sink that records deliveries in the structured log.
//!
//! Used when no external notification channel is configured.

use async_trait::async_trait;
use renderq_core::artifact::ArtifactRef;

use crate::sink::{DeliveryMetadata, NotificationError, NotificationSink};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(
        &self,
        artifacts: &[ArtifactRef],
        owner_id: &str,
        metadata: &DeliveryMetadata,
    ) -> Result<(), NotificationError> {
        let urls: Vec<&str> = artifacts.iter().map(|a| a.url.as_str()).collect();
        tracing::info!(
            request_id = metadata.request_id,
            owner_id,
            worker_id = %metadata.worker_id,
            artifact_count = artifacts.len(),
            artifacts = ?urls,
            "Artifacts ready",
        );
        Ok(())
    }
}

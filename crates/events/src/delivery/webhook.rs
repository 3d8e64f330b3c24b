//! Webhook notification with exponential-backoff retry.
//!
//! [`WebhookSink`] POSTs a JSON document describing the finished job and
//! its artifacts to a configured URL. Failed attempts are retried three
//! times with exponential backoff (1 s, 2 s, 4 s).

use std::time::Duration;

use async_trait::async_trait;
use renderq_core::artifact::ArtifactRef;

use crate::sink::{DeliveryMetadata, NotificationError, NotificationSink};

/// Retry delays in seconds (exponential backoff: 1s, 2s, 4s).
const RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// WebhookSink
// ---------------------------------------------------------------------------

/// Delivers finished artifacts to an external webhook endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    retry_delays: Vec<Duration>,
}

impl WebhookSink {
    /// Create a sink posting to `url` with a pre-configured HTTP client.
    pub fn new(url: impl Into<String>) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
            retry_delays: RETRY_DELAYS_SECS.iter().map(|s| Duration::from_secs(*s)).collect(),
        })
    }

    /// Override the delays slept between attempts.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(&self, payload: &serde_json::Value) -> Result<(), NotificationError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    /// Retries with backoff before giving up. Returns `Ok(())` on the
    /// first successful attempt.
    async fn deliver(
        &self,
        artifacts: &[ArtifactRef],
        owner_id: &str,
        metadata: &DeliveryMetadata,
    ) -> Result<(), NotificationError> {
        let payload = serde_json::json!({
            "owner_id": owner_id,
            "request_id": metadata.request_id,
            "worker_id": metadata.worker_id,
            "external_job_id": metadata.external_job_id,
            "artifacts": artifacts,
            "completed_at": metadata.completed_at,
            "elapsed_secs": metadata.elapsed_secs,
        });

        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            match self.try_send(&payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        url = %self.url,
                        request_id = metadata.request_id,
                        error = %e,
                        "Webhook delivery attempt failed, retrying"
                    );
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        // Final attempt after the last backoff.
        self.try_send(&payload).await.inspect_err(|e| {
            tracing::error!(
                url = %self.url,
                request_id = metadata.request_id,
                error = %e,
                "Webhook delivery failed after all retries"
            );
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Structured-log journal of job lifecycle events.
//!
//! [`EventJournal`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! and writes every received [`JobEvent`] as one `tracing` record. It runs
//! as a long-lived background task and exits when the bus is dropped.

use tokio::sync::broadcast;

use crate::bus::JobEvent;

/// Background service that records job events in the log.
pub struct EventJournal;

impl EventJournal {
    /// Run the journal loop until the channel is closed.
    ///
    /// Returns the number of events recorded.
    pub async fn run(mut receiver: broadcast::Receiver<JobEvent>) -> u64 {
        let mut recorded = 0;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    Self::record(&event);
                    recorded += 1;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event journal lagged, some events were not recorded");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, journal shutting down");
                    break;
                }
            }
        }
        recorded
    }

    fn record(event: &JobEvent) {
        tracing::info!(
            event_type = %event.event_type,
            request_id = event.request_id,
            owner_id = event.owner_id.as_deref(),
            worker_id = event.worker_id.as_deref(),
            external_job_id = event.external_job_id.as_deref(),
            payload = %event.payload,
            "Job event",
        );
    }
}

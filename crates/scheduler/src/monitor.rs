//! Per-job polling state machine.
//!
//! A [`JobMonitor`] is spawned for every dispatched request. On each poll
//! tick it checks, in order:
//!
//! 1. whether the request was cancelled (or finalized) by someone else,
//! 2. whether the monitoring ceiling has been reached,
//! 3. the worker's queue and result store for the job.
//!
//! Transient errors are retried with exponential backoff up to
//! [`MonitorConfig::max_retries`] consecutive failures. The worker's
//! health flag is not consulted: an unhealthy worker only stops receiving
//! new jobs.
//!
//! A terminal outcome only takes effect once its status write has been
//! applied. Until then the monitor keeps the worker reserved and derives
//! the outcome again on the next poll.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use renderq_comfyui::JobResult;
use renderq_core::job_events::{
    EVENT_JOB_CANCELLED, EVENT_JOB_COMPLETED, EVENT_JOB_FAILED, EVENT_JOB_TIMED_OUT,
    EVENT_NOTIFICATION_FAILED,
};
use renderq_db::models::request::{Request, StatusUpdate};
use renderq_db::models::status::RequestStatus;
use renderq_db::{RequestStore, StoreError};
use renderq_events::{DeliveryMetadata, EventBus, JobEvent, NotificationSink};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffConfig;
use crate::pool::{WorkerHandle, WorkerPool};

/// Error recorded when the monitoring ceiling is reached.
pub const TIMEOUT_REASON: &str = "monitoring timeout";

/// Error recorded when a job left the worker queue without output and the
/// worker gave no reason.
pub const DROPPED_REASON: &str = "job disappeared from worker queue without producing output";

/// Delays between attempts of a finalizing status write.
const FINALIZE_RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// Polling parameters shared by all monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Delay between polls while the job is in progress.
    pub poll_interval: Duration,
    /// Monitoring ceiling measured from dispatch.
    pub timeout: Duration,
    /// Consecutive transient failures tolerated before failing the job.
    pub max_retries: u32,
    /// Upper bound for the backoff delay after transient failures.
    pub max_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30 * 60),
            max_retries: 5,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// How a monitor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Completed,
    Failed(String),
    /// Cancelled by an external actor; status was left as they set it.
    Cancelled,
    TimedOut,
    /// The scheduler shut down; durable status was left untouched.
    Interrupted,
}

/// Collaborators shared by every monitor a scheduler spawns.
#[derive(Clone)]
pub struct MonitorContext {
    pub store: Arc<dyn RequestStore>,
    pub pool: Arc<WorkerPool>,
    pub sink: Arc<dyn NotificationSink>,
    pub events: Arc<EventBus>,
    pub config: MonitorConfig,
    /// Cancelled on scheduler shutdown.
    pub shutdown: CancellationToken,
}

/// Result of one poll tick.
enum Step {
    /// Job still queued or running.
    Pending,
    /// Poll could not be completed; retried with backoff.
    Transient(String),
    /// Terminal outcome reached but its status write failed.
    Deferred,
    Done(MonitorOutcome),
}

/// Watches one dispatched job until it reaches a terminal state.
pub struct JobMonitor {
    ctx: MonitorContext,
    request: Request,
    worker: WorkerHandle,
    external_job_id: String,
    dispatched_at: Instant,
    /// Time the job had already been running before this monitor started.
    prior_elapsed: Duration,
}

impl JobMonitor {
    pub fn new(
        ctx: MonitorContext,
        request: Request,
        worker: WorkerHandle,
        external_job_id: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            request,
            worker,
            external_job_id: external_job_id.into(),
            dispatched_at: Instant::now(),
            prior_elapsed: Duration::ZERO,
        }
    }

    /// Count `elapsed` towards the monitoring ceiling, for jobs dispatched
    /// before this monitor was created.
    pub fn with_prior_elapsed(mut self, elapsed: Duration) -> Self {
        self.prior_elapsed = elapsed;
        self
    }

    /// Time since dispatch.
    pub fn elapsed(&self) -> Duration {
        self.prior_elapsed + self.dispatched_at.elapsed()
    }

    /// Poll until the job is terminal or the scheduler shuts down.
    pub async fn run(self) -> MonitorOutcome {
        let config = &self.ctx.config;
        let backoff = BackoffConfig::from_poll_interval(config.poll_interval, config.max_backoff);
        let mut retries: u32 = 0;
        let mut delay = config.poll_interval;
        let mut deferred = false;

        tracing::info!(
            request_id = self.request.id,
            worker_id = %self.worker.id,
            external_job_id = %self.external_job_id,
            "Monitoring job",
        );

        loop {
            // Never sleep past the ceiling, unless a write past it is pending.
            let remaining = config.timeout.saturating_sub(self.elapsed());
            let sleep_for = if deferred { delay } else { delay.min(remaining) };
            deferred = false;

            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    tracing::info!(
                        request_id = self.request.id,
                        external_job_id = %self.external_job_id,
                        "Scheduler shutting down, monitor stopped",
                    );
                    return MonitorOutcome::Interrupted;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            match self.poll_once().await {
                Step::Pending => {
                    retries = 0;
                    delay = config.poll_interval;
                }
                Step::Transient(error) => {
                    retries += 1;
                    if retries > config.max_retries {
                        tracing::error!(
                            request_id = self.request.id,
                            external_job_id = %self.external_job_id,
                            retries = retries - 1,
                            error = %error,
                            "Poll retries exhausted",
                        );
                        match self.fail(error).await {
                            Step::Done(outcome) => return outcome,
                            _ => {
                                deferred = true;
                                delay = config.poll_interval;
                                continue;
                            }
                        }
                    }
                    delay = backoff.delay_for(retries);
                    tracing::warn!(
                        request_id = self.request.id,
                        external_job_id = %self.external_job_id,
                        retry = retries,
                        max_retries = config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient poll error, backing off",
                    );
                }
                Step::Deferred => {
                    deferred = true;
                    delay = config.poll_interval;
                }
                Step::Done(outcome) => return outcome,
            }
        }
    }

    async fn poll_once(&self) -> Step {
        let status_error = match self.ctx.store.find_by_id(self.request.id).await {
            Err(e) => Some(format!("status check failed: {e}")),
            Ok(None) => {
                tracing::warn!(request_id = self.request.id, "Monitored request no longer exists");
                self.release().await;
                return Step::Done(MonitorOutcome::Cancelled);
            }
            Ok(Some(current)) if current.is_terminal() => {
                return Step::Done(self.stop_for_external_terminal(&current).await);
            }
            Ok(Some(_)) => None,
        };

        // The ceiling holds even while the store is unreachable.
        if self.elapsed() >= self.ctx.config.timeout {
            return self.time_out().await;
        }
        if let Some(error) = status_error {
            return Step::Transient(error);
        }

        let queue = match self.worker.backend.queue_status().await {
            Ok(queue) => queue,
            Err(e) => return Step::Transient(e.to_string()),
        };
        if queue.contains(&self.external_job_id) {
            tracing::debug!(
                request_id = self.request.id,
                external_job_id = %self.external_job_id,
                running = queue.is_running(&self.external_job_id),
                "Job in progress",
            );
            return Step::Pending;
        }

        match self.worker.backend.result(&self.external_job_id).await {
            Err(e) => Step::Transient(e.to_string()),
            Ok(Some(result)) if result.has_output() => self.complete(result).await,
            Ok(result) => {
                let reason = result
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| DROPPED_REASON.to_string());
                self.fail(reason).await
            }
        }
    }

    /// Stop because another actor moved the request to a terminal status.
    async fn stop_for_external_terminal(&self, current: &Request) -> MonitorOutcome {
        let status = current.status();
        if status == Some(RequestStatus::Cancelled) {
            tracing::info!(
                request_id = self.request.id,
                external_job_id = %self.external_job_id,
                "Request cancelled, stopping monitor",
            );
            if let Err(e) = self.worker.backend.cancel(&self.external_job_id).await {
                tracing::warn!(
                    request_id = self.request.id,
                    worker_id = %self.worker.id,
                    error = %e,
                    "Best-effort worker cancel failed",
                );
            }
            self.release().await;
            self.ctx.events.publish(self.event(EVENT_JOB_CANCELLED));
            return MonitorOutcome::Cancelled;
        }

        tracing::warn!(
            request_id = self.request.id,
            status = ?status,
            "Request finalized elsewhere, stopping monitor",
        );
        self.release().await;
        match status {
            Some(RequestStatus::Completed) => MonitorOutcome::Completed,
            _ => MonitorOutcome::Failed(
                current
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "finalized by another actor".to_string()),
            ),
        }
    }

    async fn time_out(&self) -> Step {
        tracing::warn!(
            request_id = self.request.id,
            external_job_id = %self.external_job_id,
            elapsed_secs = self.elapsed().as_secs(),
            "Monitoring ceiling reached",
        );
        let Some(applied) = self
            .finalize(RequestStatus::Failed, StatusUpdate::error(TIMEOUT_REASON))
            .await
        else {
            return Step::Deferred;
        };

        if let Err(e) = self.worker.backend.cancel(&self.external_job_id).await {
            tracing::debug!(request_id = self.request.id, error = %e, "Cancel after timeout failed");
        }
        self.release().await;

        if !applied {
            return Step::Done(self.outcome_after_ignored_write().await);
        }
        self.ctx.events.publish(
            self.event(EVENT_JOB_TIMED_OUT)
                .with_payload(serde_json::json!({ "error": TIMEOUT_REASON })),
        );
        Step::Done(MonitorOutcome::TimedOut)
    }

    async fn fail(&self, reason: String) -> Step {
        tracing::warn!(
            request_id = self.request.id,
            worker_id = %self.worker.id,
            external_job_id = %self.external_job_id,
            error = %reason,
            "Job failed",
        );
        let Some(applied) = self
            .finalize(RequestStatus::Failed, StatusUpdate::error(reason.clone()))
            .await
        else {
            return Step::Deferred;
        };
        self.release().await;

        if !applied {
            return Step::Done(self.outcome_after_ignored_write().await);
        }
        self.ctx.events.publish(
            self.event(EVENT_JOB_FAILED)
                .with_payload(serde_json::json!({ "error": reason })),
        );
        Step::Done(MonitorOutcome::Failed(reason))
    }

    async fn complete(&self, result: JobResult) -> Step {
        let Some(applied) = self
            .finalize(RequestStatus::Completed, StatusUpdate::default())
            .await
        else {
            return Step::Deferred;
        };
        self.release().await;

        if !applied {
            return Step::Done(self.outcome_after_ignored_write().await);
        }

        let elapsed_secs = self.elapsed().as_secs();
        tracing::info!(
            request_id = self.request.id,
            worker_id = %self.worker.id,
            external_job_id = %self.external_job_id,
            artifact_count = result.artifacts.len(),
            elapsed_secs,
            "Job completed",
        );
        self.ctx.events.publish(
            self.event(EVENT_JOB_COMPLETED)
                .with_payload(serde_json::json!({ "artifacts": result.artifacts })),
        );

        let metadata = DeliveryMetadata {
            request_id: self.request.id,
            worker_id: self.worker.id.clone(),
            external_job_id: self.external_job_id.clone(),
            completed_at: Utc::now(),
            elapsed_secs,
        };
        if let Err(e) = self
            .ctx
            .sink
            .deliver(&result.artifacts, &self.request.owner_id, &metadata)
            .await
        {
            let annotation = format!("notification failed: {e}");
            tracing::warn!(request_id = self.request.id, error = %e, "Notification delivery failed");
            // Same-status write: the request stays completed.
            self.finalize(RequestStatus::Completed, StatusUpdate::error(annotation.clone()))
                .await;
            self.ctx.events.publish(
                self.event(EVENT_NOTIFICATION_FAILED)
                    .with_payload(serde_json::json!({ "error": annotation })),
            );
        }

        Step::Done(MonitorOutcome::Completed)
    }

    /// The store refused a finalizing write, so someone else finalized the
    /// request first. Report what they set.
    async fn outcome_after_ignored_write(&self) -> MonitorOutcome {
        match self.ctx.store.find_by_id(self.request.id).await {
            Ok(Some(current)) => match current.status() {
                Some(RequestStatus::Completed) => MonitorOutcome::Completed,
                Some(RequestStatus::Failed) => MonitorOutcome::Failed(
                    current.error_message.unwrap_or_else(|| "failed".to_string()),
                ),
                _ => MonitorOutcome::Cancelled,
            },
            _ => MonitorOutcome::Cancelled,
        }
    }

    /// Write a terminal status, retrying store errors.
    ///
    /// Returns whether the write was applied, or `None` if every attempt
    /// failed and the caller must try again later.
    async fn finalize(&self, status: RequestStatus, update: StatusUpdate) -> Option<bool> {
        let mut attempt = 0;
        loop {
            match self
                .ctx
                .store
                .update_status(self.request.id, status, update.clone())
                .await
            {
                Ok(applied) => return Some(applied),
                Err(StoreError::NotFound(_)) => return Some(false),
                Err(e) => {
                    let Some(delay) = FINALIZE_RETRY_DELAYS_SECS.get(attempt) else {
                        tracing::error!(
                            request_id = self.request.id,
                            status = %status,
                            error = %e,
                            "Final status write failed, retrying on next poll",
                        );
                        return None;
                    };
                    tracing::warn!(
                        request_id = self.request.id,
                        status = %status,
                        attempt = attempt + 1,
                        error = %e,
                        "Final status write failed, retrying",
                    );
                    tokio::time::sleep(Duration::from_secs(*delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn release(&self) {
        self.ctx.pool.release(&self.worker.id, self.request.id).await;
    }

    fn event(&self, event_type: &str) -> JobEvent {
        JobEvent::new(event_type, self.request.id)
            .with_owner(self.request.owner_id.clone())
            .with_worker(self.worker.id.clone())
            .with_external_job(self.external_job_id.clone())
    }
}

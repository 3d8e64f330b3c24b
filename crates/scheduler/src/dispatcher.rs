//! Background dispatch loop.
//!
//! Ticks on a fixed interval, claims pending requests with
//! [`RequestStore::claim_next`] and submits them to idle workers. Each
//! successful submission gets its own [`JobMonitor`] task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use renderq_comfyui::BackendError;
use renderq_core::job_events::{EVENT_JOB_DISPATCHED, EVENT_JOB_FAILED};
use renderq_db::models::request::{Request, StatusUpdate};
use renderq_db::models::status::RequestStatus;
use renderq_db::{RequestStore, StoreError};
use renderq_events::{EventBus, JobEvent, NotificationSink};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::monitor::{JobMonitor, MonitorContext, MonitorOutcome};
use crate::payload::{PayloadBuilder, PayloadError, StoredWorkflow};
use crate::pool::{PoolError, WorkerHandle, WorkerPool};

/// Errors for one claimed request. None of them abort the tick.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("submission failed: {0}")]
    Submit(#[from] BackendError),
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Slots that were free when the tick started.
    pub available: usize,
    pub dispatched: usize,
    /// Claimed requests that were failed before reaching a worker.
    pub failed: usize,
}

/// Counts a running monitor until dropped.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Matches pending requests with idle workers.
pub struct Scheduler {
    store: Arc<dyn RequestStore>,
    pool: Arc<WorkerPool>,
    events: Arc<EventBus>,
    payloads: Arc<dyn PayloadBuilder>,
    monitors: MonitorContext,
    tick_interval: Duration,
    global_concurrency: usize,
    /// Monitors currently running in this process.
    active: Arc<AtomicUsize>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn RequestStore>,
        pool: Arc<WorkerPool>,
        sink: Arc<dyn NotificationSink>,
        events: Arc<EventBus>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let monitors = MonitorContext {
            store: Arc::clone(&store),
            pool: Arc::clone(&pool),
            sink,
            events: Arc::clone(&events),
            config: config.monitor.clone(),
            shutdown: shutdown.clone(),
        };
        Self {
            store,
            pool,
            events,
            payloads: Arc::new(StoredWorkflow),
            monitors,
            tick_interval: config.tick_interval,
            global_concurrency: config.global_concurrency,
            active: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Replace the default [`StoredWorkflow`] payload builder.
    pub fn with_payload_builder(mut self, payloads: Arc<dyn PayloadBuilder>) -> Self {
        self.payloads = payloads;
        self
    }

    /// Number of monitors currently running.
    pub fn active_monitors(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the dispatch loop until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            workers = self.pool.len(),
            global_concurrency = self.global_concurrency,
            "Scheduler started",
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Dispatch cycle failed");
                    }
                }
            }
        }
    }

    /// Stop the loop and every monitor, waiting up to `grace` for monitors
    /// to exit. Returns whether they all exited in time.
    ///
    /// Requests being monitored keep their durable status.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            tracing::warn!(
                active = self.active_monitors(),
                "Monitors still running after shutdown grace period",
            );
        }
        drained
    }

    /// One dispatch cycle.
    ///
    /// Fails only when capacity cannot be computed. Per-request failures
    /// are counted in the report.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        self.pool.refresh().await;

        let processing = self.store.count_processing().await?;
        let in_flight = self.active_monitors().max(processing);
        let headroom = self.global_concurrency.saturating_sub(in_flight);
        let available = self.pool.capacity().await.min(headroom);

        let mut report = TickReport {
            available,
            ..Default::default()
        };
        if available == 0 {
            tracing::debug!(in_flight, "No dispatch capacity");
            return Ok(report);
        }

        for _ in 0..available {
            let Some(worker) = self.pool.select_idle().await else {
                break;
            };
            let request = match self.store.claim_next().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Claim failed");
                    break;
                }
            };

            tracing::info!(
                request_id = request.id,
                owner_id = %request.owner_id,
                position = request.position,
                worker_id = %worker.id,
                "Request claimed",
            );

            match self.dispatch(&worker, request).await {
                Ok(_) => report.dispatched += 1,
                Err(_) => report.failed += 1,
            }
        }

        if report.dispatched > 0 || report.failed > 0 {
            tracing::info!(
                dispatched = report.dispatched,
                failed = report.failed,
                "Dispatch cycle finished",
            );
        }
        Ok(report)
    }

    /// Reserve `worker`, submit `request` to it and start its monitor.
    ///
    /// On any failure the reservation is dropped and the request is failed,
    /// so it is never left in `processing` without a monitor.
    async fn dispatch(
        &self,
        worker: &WorkerHandle,
        request: Request,
    ) -> Result<JoinHandle<MonitorOutcome>, DispatchError> {
        if let Err(e) = self.pool.assign(&worker.id, request.id).await {
            self.fail_claimed(&request, worker, &e.to_string()).await;
            return Err(e.into());
        }

        let external_job_id = match self.submit(worker, &request).await {
            Ok(id) => id,
            Err(e) => {
                self.pool.release(&worker.id, request.id).await;
                self.fail_claimed(&request, worker, &e.to_string()).await;
                return Err(e);
            }
        };

        match self
            .store
            .update_status(
                request.id,
                RequestStatus::Processing,
                StatusUpdate::dispatched(external_job_id.clone(), worker.id.clone()),
            )
            .await
        {
            Ok(true) => {}
            // The monitor sees the new status on its first poll.
            Ok(false) => tracing::warn!(
                request_id = request.id,
                "Request left processing before dispatch was recorded",
            ),
            Err(e) => tracing::error!(
                request_id = request.id,
                external_job_id = %external_job_id,
                error = %e,
                "Failed to record dispatch",
            ),
        }

        tracing::info!(
            request_id = request.id,
            worker_id = %worker.id,
            external_job_id = %external_job_id,
            "Request dispatched",
        );
        self.events.publish(
            JobEvent::new(EVENT_JOB_DISPATCHED, request.id)
                .with_owner(request.owner_id.clone())
                .with_worker(worker.id.clone())
                .with_external_job(external_job_id.clone()),
        );

        Ok(self.spawn_monitor(request, worker.clone(), external_job_id, Duration::ZERO))
    }

    async fn submit(&self, worker: &WorkerHandle, request: &Request) -> Result<String, DispatchError> {
        let workflow = self.payloads.build(request)?;
        Ok(worker.backend.submit(&workflow).await?)
    }

    async fn fail_claimed(&self, request: &Request, worker: &WorkerHandle, reason: &str) {
        tracing::error!(
            request_id = request.id,
            worker_id = %worker.id,
            error = %reason,
            "Dispatch failed",
        );
        if let Err(e) = self
            .store
            .update_status(request.id, RequestStatus::Failed, StatusUpdate::error(reason))
            .await
        {
            tracing::error!(request_id = request.id, error = %e, "Failed to mark request failed");
            return;
        }
        self.events.publish(
            JobEvent::new(EVENT_JOB_FAILED, request.id)
                .with_owner(request.owner_id.clone())
                .with_worker(worker.id.clone())
                .with_payload(serde_json::json!({ "error": reason })),
        );
    }

    /// Spawn a monitor for a job already running on `worker`.
    pub(crate) fn spawn_monitor(
        &self,
        request: Request,
        worker: WorkerHandle,
        external_job_id: String,
        prior_elapsed: Duration,
    ) -> JoinHandle<MonitorOutcome> {
        let slot = ActiveSlot::acquire(&self.active);
        let request_id = request.id;
        let monitor = JobMonitor::new(self.monitors.clone(), request, worker, external_job_id)
            .with_prior_elapsed(prior_elapsed);

        self.tracker.spawn(async move {
            let _slot = slot;
            let outcome = monitor.run().await;
            tracing::debug!(request_id, outcome = ?outcome, "Monitor finished");
            outcome
        })
    }

    pub(crate) fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }
}

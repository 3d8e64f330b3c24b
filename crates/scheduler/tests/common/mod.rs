//! Shared fakes for the scheduler integration suites.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use renderq_comfyui::{BackendError, JobResult, QueueSnapshot, WorkerBackend};
use renderq_core::artifact::ArtifactRef;
use renderq_core::types::DbId;
use renderq_core::worker::parse_worker_endpoints;
use renderq_db::models::request::{Request, StatusUpdate};
use renderq_db::models::status::RequestStatus;
use renderq_db::{InMemoryRequestStore, RequestStore, StoreError};
use renderq_events::{DeliveryMetadata, EventBus, JobEvent, NotificationError, NotificationSink};
use renderq_scheduler::{Scheduler, SchedulerConfig, WorkerPool};
use tokio::sync::broadcast;

pub const OWNER_CAP: usize = 2;

// ---------------------------------------------------------------------------
// FakeBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    healthy: bool,
    next_id: u32,
    submit_error: Option<BackendError>,
    queue: HashSet<String>,
    results: HashMap<String, JobResult>,
    /// Remaining `queue_status` calls that fail.
    poll_failures: u32,
    submitted: Vec<serde_json::Value>,
    cancelled: Vec<String>,
}

/// Scriptable in-memory worker. Submitted jobs stay queued until the test
/// finishes or drops them.
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                healthy: true,
                ..Default::default()
            }),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().unwrap().healthy = healthy;
    }

    pub fn fail_submits(&self, error: BackendError) {
        self.state.lock().unwrap().submit_error = Some(error);
    }

    /// Make the next `count` queue polls fail as if the worker were down.
    pub fn fail_polls(&self, count: u32) {
        self.state.lock().unwrap().poll_failures = count;
    }

    /// Put a job on the queue as if submitted by a previous process.
    pub fn enqueue(&self, external_job_id: &str) {
        self.state
            .lock()
            .unwrap()
            .queue
            .insert(external_job_id.to_string());
    }

    /// Finish a job with one output image.
    pub fn finish(&self, external_job_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.queue.remove(external_job_id);
        state.results.insert(
            external_job_id.to_string(),
            JobResult {
                artifacts: vec![artifact(external_job_id)],
                status: Some("success".into()),
                completed: true,
                error: None,
            },
        );
    }

    /// Remove a job from the queue without output, optionally leaving a
    /// history entry with an error reason.
    pub fn drop_job(&self, external_job_id: &str, reason: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.queue.remove(external_job_id);
        if let Some(reason) = reason {
            state.results.insert(
                external_job_id.to_string(),
                JobResult {
                    artifacts: Vec::new(),
                    status: Some("error".into()),
                    completed: false,
                    error: Some(reason.to_string()),
                },
            );
        }
    }

    pub fn submitted(&self) -> Vec<serde_json::Value> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl WorkerBackend for FakeBackend {
    async fn health_check(&self) -> bool {
        self.state.lock().unwrap().healthy
    }

    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.submit_error.clone() {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("job-{}", state.next_id);
        state.queue.insert(id.clone());
        state.submitted.push(workflow.clone());
        Ok(id)
    }

    async fn queue_status(&self) -> Result<QueueSnapshot, BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.poll_failures > 0 {
            state.poll_failures -= 1;
            return Err(BackendError::Unreachable("connection refused".into()));
        }
        let mut running: Vec<String> = state.queue.iter().cloned().collect();
        running.sort();
        Ok(QueueSnapshot {
            running,
            pending: Vec::new(),
        })
    }

    async fn result(&self, external_job_id: &str) -> Result<Option<JobResult>, BackendError> {
        Ok(self.state.lock().unwrap().results.get(external_job_id).cloned())
    }

    async fn cancel(&self, external_job_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.queue.remove(external_job_id);
        state.cancelled.push(external_job_id.to_string());
        Ok(())
    }
}

pub fn artifact(external_job_id: &str) -> ArtifactRef {
    ArtifactRef {
        node_id: "9".into(),
        filename: format!("{external_job_id}.png"),
        subfolder: String::new(),
        folder_type: "output".into(),
        url: format!("http://worker/view?filename={external_job_id}.png"),
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Delivery {
    pub owner_id: String,
    pub artifacts: Vec<ArtifactRef>,
    pub metadata: DeliveryMetadata,
}

/// Sink that records deliveries and can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(
        &self,
        artifacts: &[ArtifactRef],
        owner_id: &str,
        metadata: &DeliveryMetadata,
    ) -> Result<(), NotificationError> {
        self.deliveries.lock().unwrap().push(Delivery {
            owner_id: owner_id.to_string(),
            artifacts: artifacts.to_vec(),
            metadata: metadata.clone(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::HttpStatus(503));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedStore
// ---------------------------------------------------------------------------

/// In-memory store whose writes can be made to fail or race.
pub struct ScriptedStore {
    inner: Arc<InMemoryRequestStore>,
    fail_terminal_writes: AtomicBool,
    cancel_before_dispatch_record: AtomicBool,
}

impl ScriptedStore {
    pub fn new(inner: Arc<InMemoryRequestStore>) -> Self {
        Self {
            inner,
            fail_terminal_writes: AtomicBool::new(false),
            cancel_before_dispatch_record: AtomicBool::new(false),
        }
    }

    /// Make every write of a terminal status fail until switched off.
    pub fn fail_terminal_writes(&self, fail: bool) {
        self.fail_terminal_writes.store(fail, Ordering::SeqCst);
    }

    /// Cancel the next request whose dispatch is recorded, just before the
    /// write lands.
    pub fn cancel_before_dispatch_record(&self) {
        self.cancel_before_dispatch_record.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestStore for ScriptedStore {
    async fn create(&self, owner_id: &str, payload: serde_json::Value) -> Result<Request, StoreError> {
        self.inner.create(owner_id, payload).await
    }

    async fn claim_next(&self) -> Result<Option<Request>, StoreError> {
        self.inner.claim_next().await
    }

    async fn update_status(
        &self,
        id: DbId,
        status: RequestStatus,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        if status.is_terminal() && self.fail_terminal_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Contention { attempts: 5 });
        }
        if status == RequestStatus::Processing
            && self.cancel_before_dispatch_record.swap(false, Ordering::SeqCst)
        {
            self.inner.cancel(id).await?;
        }
        self.inner.update_status(id, status, update).await
    }

    async fn count_processing(&self) -> Result<usize, StoreError> {
        self.inner.count_processing().await
    }

    async fn list_pending(&self) -> Result<Vec<Request>, StoreError> {
        self.inner.list_pending().await
    }

    async fn list_processing(&self) -> Result<Vec<Request>, StoreError> {
        self.inner.list_processing().await
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Request>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn cancel(&self, id: DbId) -> Result<bool, StoreError> {
        self.inner.cancel(id).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<InMemoryRequestStore>,
    pub pool: Arc<WorkerPool>,
    pub backends: Vec<Arc<FakeBackend>>,
    pub sink: Arc<RecordingSink>,
    pub events: Arc<EventBus>,
    pub config: SchedulerConfig,
}

impl Harness {
    /// Store, healthy fake workers for `endpoints` and a recording sink.
    pub async fn new(endpoints: &str) -> Self {
        Self::with_sink(endpoints, RecordingSink::default()).await
    }

    pub async fn with_sink(endpoints: &str, sink: RecordingSink) -> Self {
        let descriptors = parse_worker_endpoints(endpoints).unwrap();
        let backends: Vec<Arc<FakeBackend>> =
            descriptors.iter().map(|_| Arc::new(FakeBackend::new())).collect();
        let workers = descriptors
            .iter()
            .cloned()
            .zip(backends.iter())
            .map(|(d, b)| (d, Arc::clone(b) as Arc<dyn WorkerBackend>))
            .collect();

        let config = SchedulerConfig::new(descriptors);
        let pool = Arc::new(WorkerPool::new(
            workers,
            config.health_refresh_interval,
            config.health_check_timeout,
        ));
        pool.force_refresh().await;

        Self {
            store: Arc::new(InMemoryRequestStore::new(OWNER_CAP)),
            pool,
            backends,
            sink: Arc::new(sink),
            events: Arc::new(EventBus::default()),
            config,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler_with_store(Arc::clone(&self.store) as Arc<dyn RequestStore>)
    }

    /// A [`ScriptedStore`] over the harness store.
    pub fn scripted_store(&self) -> Arc<ScriptedStore> {
        Arc::new(ScriptedStore::new(Arc::clone(&self.store)))
    }

    pub fn scheduler_with_store(&self, store: Arc<dyn RequestStore>) -> Scheduler {
        Scheduler::new(
            &self.config,
            store,
            Arc::clone(&self.pool),
            Arc::clone(&self.sink) as Arc<dyn NotificationSink>,
            Arc::clone(&self.events),
        )
    }

    pub async fn request(&self, id: DbId) -> Request {
        self.store.find_by_id(id).await.unwrap().unwrap()
    }

    pub async fn status(&self, id: DbId) -> RequestStatus {
        self.request(id).await.status().unwrap()
    }

    /// Advance (paused) time until request `id` leaves `processing`.
    pub async fn wait_until_settled(&self, id: DbId) -> RequestStatus {
        for _ in 0..10_000 {
            let status = self.status(id).await;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("request {id} never reached a terminal status");
    }
}

/// Event types received so far, in publish order.
pub fn drain_event_types(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<String> {
    let mut types = Vec::new();
    while let Ok(event) = rx.try_recv() {
        types.push(event.event_type);
    }
    types
}

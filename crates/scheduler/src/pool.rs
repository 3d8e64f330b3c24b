//! In-memory registry of worker endpoints.
//!
//! Each worker has capacity 1: a reservation (`current_job`) is taken by
//! the scheduler before submission and dropped by the job monitor when the
//! job reaches a terminal state. All reservation changes go through one
//! mutex so a tick and concurrent monitor releases never interleave.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use renderq_comfyui::WorkerBackend;
use renderq_core::types::{DbId, Timestamp};
use renderq_core::worker::{WorkerDescriptor, WorkerKind};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Errors from reservation changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Unknown worker {0}")]
    UnknownWorker(String),

    #[error("Worker {worker_id} is busy with request {current}")]
    WorkerBusy { worker_id: String, current: DbId },

    #[error("Request {request_id} is already assigned to worker {worker_id}")]
    AlreadyAssigned { request_id: DbId, worker_id: String },
}

/// A selected worker together with the backend used to reach it.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: String,
    pub kind: WorkerKind,
    pub url: String,
    pub backend: Arc<dyn WorkerBackend>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of one worker, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: String,
    pub kind: WorkerKind,
    pub healthy: bool,
    pub current_job: Option<DbId>,
    pub last_checked_at: Option<Timestamp>,
}

struct WorkerEntry {
    descriptor: WorkerDescriptor,
    backend: Arc<dyn WorkerBackend>,
}

#[derive(Debug, Default)]
struct WorkerState {
    /// `false` until the first probe succeeds.
    healthy: bool,
    current_job: Option<DbId>,
    last_checked_at: Option<Timestamp>,
}

/// Registry of configured workers, their health and reservations.
pub struct WorkerPool {
    entries: Vec<WorkerEntry>,
    /// Indexed like `entries`.
    states: Mutex<Vec<WorkerState>>,
    refresh_interval: Duration,
    probe_timeout: Duration,
    last_refresh: Mutex<Option<Instant>>,
}

impl WorkerPool {
    /// Build a pool from descriptors paired with their backends.
    ///
    /// Registration order is the order of `workers` and is the tie-break
    /// between workers of the same kind.
    pub fn new(
        workers: Vec<(WorkerDescriptor, Arc<dyn WorkerBackend>)>,
        refresh_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let states = workers.iter().map(|_| WorkerState::default()).collect();
        let entries = workers
            .into_iter()
            .map(|(descriptor, backend)| WorkerEntry { descriptor, backend })
            .collect();
        Self {
            entries,
            states: Mutex::new(states),
            refresh_interval,
            probe_timeout,
            last_refresh: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Probe every worker unless a refresh ran within the refresh interval.
    ///
    /// Returns whether probes were actually issued.
    pub async fn refresh(&self) -> bool {
        {
            let mut last = self.last_refresh.lock().await;
            if last.is_some_and(|at| at.elapsed() < self.refresh_interval) {
                return false;
            }
            *last = Some(Instant::now());
        }
        self.probe_all().await;
        true
    }

    /// Probe every worker now, ignoring the throttle.
    pub async fn force_refresh(&self) {
        *self.last_refresh.lock().await = Some(Instant::now());
        self.probe_all().await;
    }

    async fn probe_all(&self) {
        // Probes run without holding the state lock so releases are never
        // blocked on a slow endpoint.
        let probes = self.entries.iter().map(|entry| async move {
            tokio::time::timeout(self.probe_timeout, entry.backend.health_check())
                .await
                .unwrap_or(false)
        });
        let results = join_all(probes).await;
        let checked_at = Utc::now();

        let mut states = self.states.lock().await;
        for ((entry, state), healthy) in self.entries.iter().zip(states.iter_mut()).zip(results) {
            if state.healthy != healthy {
                if healthy {
                    tracing::info!(worker_id = %entry.descriptor.id, url = %entry.descriptor.url, "Worker is healthy");
                } else {
                    tracing::warn!(worker_id = %entry.descriptor.id, url = %entry.descriptor.url, "Worker is unhealthy");
                }
            }
            state.healthy = healthy;
            state.last_checked_at = Some(checked_at);
        }
    }

    /// The preferred healthy worker without a reservation, if any.
    ///
    /// Remote workers are preferred over local ones; registration order
    /// breaks ties.
    pub async fn select_idle(&self) -> Option<WorkerHandle> {
        let states = self.states.lock().await;
        self.entries
            .iter()
            .zip(states.iter())
            .filter(|(_, state)| state.healthy && state.current_job.is_none())
            .min_by_key(|(entry, _)| entry.descriptor.priority())
            .map(|(entry, _)| self.handle(entry))
    }

    /// Reserve `worker_id` for `request_id`.
    pub async fn assign(&self, worker_id: &str, request_id: DbId) -> Result<(), PoolError> {
        let mut states = self.states.lock().await;

        if let Some(holder) = self
            .entries
            .iter()
            .zip(states.iter())
            .find(|(_, state)| state.current_job == Some(request_id))
            .map(|(entry, _)| entry.descriptor.id.clone())
        {
            return Err(PoolError::AlreadyAssigned { request_id, worker_id: holder });
        }

        let index = self.index_of(worker_id)?;
        let state = &mut states[index];
        if let Some(current) = state.current_job {
            return Err(PoolError::WorkerBusy { worker_id: worker_id.to_string(), current });
        }
        state.current_job = Some(request_id);

        tracing::debug!(worker_id, request_id, "Worker reserved");
        Ok(())
    }

    /// Drop the reservation of `worker_id` if it is held by `request_id`.
    ///
    /// Idempotent. Returns whether a reservation was dropped.
    pub async fn release(&self, worker_id: &str, request_id: DbId) -> bool {
        let Ok(index) = self.index_of(worker_id) else {
            tracing::warn!(worker_id, request_id, "Release for unknown worker ignored");
            return false;
        };

        let mut states = self.states.lock().await;
        let state = &mut states[index];
        if state.current_job != Some(request_id) {
            tracing::debug!(
                worker_id,
                request_id,
                current = ?state.current_job,
                "Release does not match current reservation, ignored",
            );
            return false;
        }
        state.current_job = None;

        tracing::debug!(worker_id, request_id, "Worker released");
        true
    }

    /// Number of healthy workers without a reservation.
    pub async fn capacity(&self) -> usize {
        self.states
            .lock()
            .await
            .iter()
            .filter(|state| state.healthy && state.current_job.is_none())
            .count()
    }

    /// Handle for a worker by id, regardless of its health or reservation.
    pub fn get(&self, worker_id: &str) -> Option<WorkerHandle> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor.id == worker_id)
            .map(|entry| self.handle(entry))
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let states = self.states.lock().await;
        self.entries
            .iter()
            .zip(states.iter())
            .map(|(entry, state)| WorkerSnapshot {
                id: entry.descriptor.id.clone(),
                kind: entry.descriptor.kind,
                healthy: state.healthy,
                current_job: state.current_job,
                last_checked_at: state.last_checked_at,
            })
            .collect()
    }

    fn index_of(&self, worker_id: &str) -> Result<usize, PoolError> {
        self.entries
            .iter()
            .position(|entry| entry.descriptor.id == worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))
    }

    fn handle(&self, entry: &WorkerEntry) -> WorkerHandle {
        WorkerHandle {
            id: entry.descriptor.id.clone(),
            kind: entry.descriptor.kind,
            url: entry.descriptor.url.clone(),
            backend: Arc::clone(&entry.backend),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

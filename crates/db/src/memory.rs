//! In-process [`RequestStore`] with the same semantics as the Postgres one.
//!
//! A single async mutex guards the whole table, so `claim_next` is a
//! read-then-update that no other caller can interleave with. Used for
//! single-process deployments (`REQUEST_STORE=memory`) and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use renderq_core::types::DbId;
use tokio::sync::Mutex;

use crate::models::request::{Request, StatusUpdate};
use crate::models::status::{RequestStatus, ACTIVE_STATUSES};
use crate::store::{RequestStore, StoreError};

#[derive(Default)]
struct Table {
    last_id: DbId,
    last_position: i64,
    rows: BTreeMap<DbId, Request>,
}

/// Request store kept entirely in memory. Contents are lost on restart.
pub struct InMemoryRequestStore {
    owner_cap: usize,
    table: Mutex<Table>,
}

impl InMemoryRequestStore {
    pub fn new(owner_cap: usize) -> Self {
        Self {
            owner_cap,
            table: Mutex::new(Table::default()),
        }
    }
}

fn has_status(request: &Request, status: RequestStatus) -> bool {
    request.status_id == status.id()
}

fn in_claim_order(table: &Table, status: RequestStatus) -> Vec<Request> {
    let mut rows: Vec<Request> = table
        .rows
        .values()
        .filter(|r| has_status(r, status))
        .cloned()
        .collect();
    rows.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then(a.created_at.cmp(&b.created_at))
    });
    rows
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(
        &self,
        owner_id: &str,
        payload: serde_json::Value,
    ) -> Result<Request, StoreError> {
        let mut table = self.table.lock().await;

        let active = table
            .rows
            .values()
            .filter(|r| r.owner_id == owner_id)
            .filter(|r| ACTIVE_STATUSES.iter().any(|s| has_status(r, *s)))
            .count();
        if active >= self.owner_cap {
            return Err(StoreError::OwnerCapacityExceeded {
                owner_id: owner_id.to_string(),
                cap: self.owner_cap,
            });
        }

        table.last_id += 1;
        table.last_position += 1;
        let now = Utc::now();
        let request = Request {
            id: table.last_id,
            owner_id: owner_id.to_string(),
            position: table.last_position,
            status_id: RequestStatus::Pending.id(),
            payload,
            external_job_id: None,
            assigned_worker_id: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            updated_at: now,
        };
        table.rows.insert(request.id, request.clone());

        tracing::info!(
            request_id = request.id,
            owner_id,
            position = request.position,
            "Request created",
        );
        Ok(request)
    }

    async fn claim_next(&self) -> Result<Option<Request>, StoreError> {
        let mut table = self.table.lock().await;

        let Some(next_id) = in_claim_order(&table, RequestStatus::Pending)
            .first()
            .map(|r| r.id)
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let row = table
            .rows
            .get_mut(&next_id)
            .ok_or(StoreError::NotFound(next_id))?;
        row.status_id = RequestStatus::Processing.id();
        row.started_at = Some(now);
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn update_status(
        &self,
        id: DbId,
        status: RequestStatus,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        let mut table = self.table.lock().await;
        let row = table.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let accepted = row.status().is_some_and(|current| current.accepts(status));
        if !accepted {
            tracing::warn!(
                request_id = id,
                current_status_id = row.status_id,
                status = %status,
                "Status write ignored: request does not accept this transition",
            );
            return Ok(false);
        }

        let now = Utc::now();
        row.status_id = status.id();
        if let Some(external_job_id) = update.external_job_id {
            row.external_job_id = Some(external_job_id);
        }
        if let Some(worker_id) = update.assigned_worker_id {
            row.assigned_worker_id = Some(worker_id);
        }
        if let Some(error) = update.error {
            row.error_message = Some(error);
        }
        match status {
            RequestStatus::Processing => {
                row.started_at.get_or_insert(now);
            }
            RequestStatus::Completed | RequestStatus::Cancelled => {
                row.completed_at.get_or_insert(now);
            }
            RequestStatus::Failed => {
                row.failed_at.get_or_insert(now);
            }
            RequestStatus::Pending => {}
        }
        row.updated_at = now;
        Ok(true)
    }

    async fn count_processing(&self) -> Result<usize, StoreError> {
        let table = self.table.lock().await;
        Ok(table
            .rows
            .values()
            .filter(|r| has_status(r, RequestStatus::Processing))
            .count())
    }

    async fn list_pending(&self) -> Result<Vec<Request>, StoreError> {
        let table = self.table.lock().await;
        Ok(in_claim_order(&table, RequestStatus::Pending))
    }

    async fn list_processing(&self) -> Result<Vec<Request>, StoreError> {
        let table = self.table.lock().await;
        Ok(in_claim_order(&table, RequestStatus::Processing))
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Request>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn cancel(&self, id: DbId) -> Result<bool, StoreError> {
        let mut table = self.table.lock().await;
        let row = table.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if row.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        row.status_id = RequestStatus::Cancelled.id();
        row.completed_at = Some(now);
        row.updated_at = now;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

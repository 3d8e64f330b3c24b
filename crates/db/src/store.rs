//! The persistence contract used by the scheduler and job monitors.

use std::time::Duration;

use async_trait::async_trait;
use renderq_core::types::DbId;
use sqlx::PgPool;

use crate::models::request::{Request, StatusUpdate};
use crate::models::status::RequestStatus;
use crate::repositories::{CreateOutcome, RequestRepo};

/// Attempts made for a serializable transaction before giving up.
const MAX_SERIALIZABLE_ATTEMPTS: u32 = 5;

/// Pause between serializable retries, multiplied by the attempt number.
const SERIALIZABLE_RETRY_STEP: Duration = Duration::from_millis(20);

/// Errors from a [`RequestStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Creating another request would exceed the owner's active cap.
    #[error("Owner {owner_id} already has {cap} active requests")]
    OwnerCapacityExceeded { owner_id: String, cap: usize },

    #[error("Request {0} not found")]
    NotFound(DbId),

    /// Serializable transactions kept conflicting with concurrent writers.
    #[error("Gave up after {attempts} conflicting attempts")]
    Contention { attempts: u32 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable table of generation requests.
///
/// Implementations must make [`claim_next`](RequestStore::claim_next)
/// atomic across all concurrent callers and must reject status writes
/// the request's current status does not accept.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a pending request, enforcing the per-owner active cap.
    async fn create(&self, owner_id: &str, payload: serde_json::Value)
        -> Result<Request, StoreError>;

    /// Claim the pending request with the smallest position, or `None`.
    async fn claim_next(&self) -> Result<Option<Request>, StoreError>;

    /// Write a status and its fields. Returns `false` if the write was
    /// ignored because the current status does not accept it.
    async fn update_status(
        &self,
        id: DbId,
        status: RequestStatus,
        update: StatusUpdate,
    ) -> Result<bool, StoreError>;

    /// Number of requests in `processing`.
    async fn count_processing(&self) -> Result<usize, StoreError>;

    /// Pending requests in claim order.
    async fn list_pending(&self) -> Result<Vec<Request>, StoreError>;

    /// Processing requests in claim order.
    async fn list_processing(&self) -> Result<Vec<Request>, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<Request>, StoreError>;

    /// Cancel a non-terminal request. Returns `false` if already terminal.
    async fn cancel(&self, id: DbId) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// [`RequestStore`] backed by the `requests` table.
#[derive(Clone)]
pub struct PgRequestStore {
    pool: PgPool,
    owner_cap: usize,
}

impl PgRequestStore {
    pub fn new(pool: PgPool, owner_cap: usize) -> Self {
        Self { pool, owner_cap }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Back off briefly before retrying a conflicting serializable transaction.
async fn serializable_backoff(attempt: u32) {
    tokio::time::sleep(SERIALIZABLE_RETRY_STEP * attempt).await;
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn create(
        &self,
        owner_id: &str,
        payload: serde_json::Value,
    ) -> Result<Request, StoreError> {
        let cap = i64::try_from(self.owner_cap).unwrap_or(i64::MAX);

        for attempt in 1..=MAX_SERIALIZABLE_ATTEMPTS {
            match RequestRepo::create(&self.pool, owner_id, &payload, cap).await {
                Ok(CreateOutcome::Created(request)) => {
                    tracing::info!(
                        request_id = request.id,
                        owner_id,
                        position = request.position,
                        "Request created",
                    );
                    return Ok(request);
                }
                Ok(CreateOutcome::OwnerAtCapacity { active }) => {
                    tracing::debug!(owner_id, active, "Owner at request capacity");
                    return Err(StoreError::OwnerCapacityExceeded {
                        owner_id: owner_id.to_string(),
                        cap: self.owner_cap,
                    });
                }
                Err(e) if RequestRepo::is_retryable(&e) => {
                    tracing::debug!(attempt, error = %e, "Create conflicted, retrying");
                    serializable_backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Contention {
            attempts: MAX_SERIALIZABLE_ATTEMPTS,
        })
    }

    async fn claim_next(&self) -> Result<Option<Request>, StoreError> {
        for attempt in 1..=MAX_SERIALIZABLE_ATTEMPTS {
            match RequestRepo::claim_next(&self.pool).await {
                Ok(claimed) => return Ok(claimed),
                Err(e) if RequestRepo::is_retryable(&e) => {
                    tracing::debug!(attempt, error = %e, "Claim conflicted, retrying");
                    serializable_backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Contention {
            attempts: MAX_SERIALIZABLE_ATTEMPTS,
        })
    }

    async fn update_status(
        &self,
        id: DbId,
        status: RequestStatus,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        if RequestRepo::update_status(&self.pool, id, status, &update).await? {
            return Ok(true);
        }

        let current = RequestRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        tracing::warn!(
            request_id = id,
            current_status_id = current.status_id,
            status = %status,
            "Status write ignored: request does not accept this transition",
        );
        Ok(false)
    }

    async fn count_processing(&self) -> Result<usize, StoreError> {
        let count = RequestRepo::count_processing(&self.pool).await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn list_pending(&self) -> Result<Vec<Request>, StoreError> {
        Ok(RequestRepo::list_pending(&self.pool).await?)
    }

    async fn list_processing(&self) -> Result<Vec<Request>, StoreError> {
        Ok(RequestRepo::list_processing(&self.pool).await?)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Request>, StoreError> {
        Ok(RequestRepo::find_by_id(&self.pool, id).await?)
    }

    async fn cancel(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(RequestRepo::cancel(&self.pool, id).await?)
    }
}

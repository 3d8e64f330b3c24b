//! Repository for the `requests` table.
//!
//! Uses `RequestStatus` from `models::status` for all status transitions.
//! Creation and claiming run inside `SERIALIZABLE` transactions so that
//! concurrent schedulers (in this or another process) never observe the
//! same pending row as claimable twice; conflicting transactions fail
//! with SQLSTATE 40001 and are retried by the caller.

use sqlx::{PgPool, Postgres, Transaction};
use renderq_core::types::DbId;

use crate::models::request::{Request, StatusUpdate};
use crate::models::status::{RequestStatus, StatusId, ACTIVE_STATUSES};

/// Column list for `requests` queries.
const COLUMNS: &str = "\
    id, owner_id, position, status_id, payload, \
    external_job_id, assigned_worker_id, error_message, \
    created_at, started_at, completed_at, failed_at, updated_at";

/// SQLSTATE codes for transactions Postgres aborted to preserve
/// serializability (serialization_failure, deadlock_detected).
const RETRYABLE_SQLSTATES: [&str; 2] = ["40001", "40P01"];

/// Result of an insert attempt that is subject to the per-owner cap.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Request),
    /// The owner already has `active` pending or processing requests.
    OwnerAtCapacity { active: i64 },
}

/// Provides queries and atomic transitions for generation requests.
pub struct RequestRepo;

impl RequestRepo {
    /// Insert a new pending request unless the owner is at `owner_cap`.
    ///
    /// The count and the insert share one serializable transaction, so two
    /// concurrent creations for the same owner cannot both pass the check.
    pub async fn create(
        pool: &PgPool,
        owner_id: &str,
        payload: &serde_json::Value,
        owner_cap: i64,
    ) -> Result<CreateOutcome, sqlx::Error> {
        let mut tx = Self::begin_serializable(pool).await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM requests WHERE owner_id = $1 AND status_id = ANY($2)",
        )
        .bind(owner_id)
        .bind(active_status_ids())
        .fetch_one(&mut *tx)
        .await?;

        if active >= owner_cap {
            tx.rollback().await?;
            return Ok(CreateOutcome::OwnerAtCapacity { active });
        }

        let query = format!(
            "INSERT INTO requests (owner_id, status_id, payload) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        let request = sqlx::query_as::<_, Request>(&query)
            .bind(owner_id)
            .bind(RequestStatus::Pending.id())
            .bind(payload)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CreateOutcome::Created(request))
    }

    /// Atomically move the lowest-position pending request to processing.
    ///
    /// Ties on `position` (which cannot occur with a sequence, but are
    /// specified) fall back to `created_at`. `SKIP LOCKED` keeps a second
    /// scheduler from queueing behind a row that is already being claimed.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<Request>, sqlx::Error> {
        let mut tx = Self::begin_serializable(pool).await?;

        let query = format!(
            "UPDATE requests \
             SET status_id = $1, started_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM requests \
                 WHERE status_id = $2 \
                 ORDER BY position ASC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             AND status_id = $2 \
             RETURNING {COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, Request>(&query)
            .bind(RequestStatus::Processing.id())
            .bind(RequestStatus::Pending.id())
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(claimed)
    }

    /// Write `status` and the optional fields, guarded by the state machine.
    ///
    /// Returns `false` when the stored status does not accept the write
    /// (e.g. a late `Completed` arriving after `Cancelled`); the row is
    /// left untouched in that case.
    pub async fn update_status(
        pool: &PgPool,
        id: DbId,
        status: RequestStatus,
        update: &StatusUpdate,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests SET \
                 status_id = $2, \
                 external_job_id = COALESCE($3, external_job_id), \
                 assigned_worker_id = COALESCE($4, assigned_worker_id), \
                 error_message = COALESCE($5, error_message), \
                 started_at = CASE WHEN $2 = $7 THEN COALESCE(started_at, NOW()) ELSE started_at END, \
                 completed_at = CASE WHEN $2 IN ($8, $9) THEN COALESCE(completed_at, NOW()) ELSE completed_at END, \
                 failed_at = CASE WHEN $2 = $10 THEN COALESCE(failed_at, NOW()) ELSE failed_at END \
             WHERE id = $1 AND status_id = ANY($6)",
        )
        .bind(id)
        .bind(status.id())
        .bind(update.external_job_id.as_deref())
        .bind(update.assigned_worker_id.as_deref())
        .bind(update.error.as_deref())
        .bind(status.writable_from_ids())
        .bind(RequestStatus::Processing.id())
        .bind(RequestStatus::Completed.id())
        .bind(RequestStatus::Cancelled.id())
        .bind(RequestStatus::Failed.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel a request if it is not already in a terminal state.
    ///
    /// Returns `true` if the request was cancelled, `false` if it was
    /// already completed, failed, or cancelled.
    pub async fn cancel(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests \
             SET status_id = $2, completed_at = NOW() \
             WHERE id = $1 AND status_id = ANY($3)",
        )
        .bind(id)
        .bind(RequestStatus::Cancelled.id())
        .bind(active_status_ids())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of requests currently in `processing`.
    pub async fn count_processing(pool: &PgPool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE status_id = $1")
            .bind(RequestStatus::Processing.id())
            .fetch_one(pool)
            .await
    }

    /// Pending requests in claim order.
    pub async fn list_pending(pool: &PgPool) -> Result<Vec<Request>, sqlx::Error> {
        Self::list_by_status(pool, RequestStatus::Pending).await
    }

    /// Processing requests in claim order.
    pub async fn list_processing(pool: &PgPool) -> Result<Vec<Request>, sqlx::Error> {
        Self::list_by_status(pool, RequestStatus::Processing).await
    }

    /// Find a request by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Request>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM requests WHERE id = $1");
        sqlx::query_as::<_, Request>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Whether an error is a serialization conflict worth retrying.
    pub fn is_retryable(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db
                .code()
                .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&code.as_ref())),
            _ => false,
        }
    }

    // ---- private helpers ----

    async fn list_by_status(
        pool: &PgPool,
        status: RequestStatus,
    ) -> Result<Vec<Request>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM requests \
             WHERE status_id = $1 \
             ORDER BY position ASC, created_at ASC"
        );
        sqlx::query_as::<_, Request>(&query)
            .bind(status.id())
            .fetch_all(pool)
            .await
    }

    async fn begin_serializable(pool: &PgPool) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

fn active_status_ids() -> Vec<StatusId> {
    ACTIVE_STATUSES.iter().map(|s| s.id()).collect()
}

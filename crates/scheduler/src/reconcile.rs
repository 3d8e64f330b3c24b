//! Startup handling of requests left in `processing` by a previous process.
//!
//! Worker reservations live only in memory, so after a restart nothing
//! watches those requests. Depending on [`ReconcilePolicy`] they are
//! re-attached to their worker or failed.

use std::time::Duration;

use chrono::Utc;
use renderq_db::models::request::{Request, StatusUpdate};
use renderq_db::models::status::RequestStatus;
use renderq_db::StoreError;

use crate::config::ReconcilePolicy;
use crate::dispatcher::Scheduler;

/// Error recorded on requests that cannot be re-attached.
pub const ORPHANED_REASON: &str = "orphaned by scheduler restart";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reattached: usize,
    pub failed: usize,
}

impl Scheduler {
    /// Apply `policy` to every request currently in `processing`.
    ///
    /// Must run before the dispatch loop starts.
    pub async fn reconcile(&self, policy: ReconcilePolicy) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        if policy == ReconcilePolicy::Off {
            tracing::info!("Startup reconciliation disabled");
            return Ok(report);
        }

        let leftovers = self.store().list_processing().await?;
        for request in leftovers {
            if policy == ReconcilePolicy::Reattach && self.try_reattach(&request).await {
                report.reattached += 1;
                continue;
            }

            match self
                .store()
                .update_status(request.id, RequestStatus::Failed, StatusUpdate::error(ORPHANED_REASON))
                .await
            {
                Ok(true) => {
                    tracing::warn!(
                        request_id = request.id,
                        worker_id = request.assigned_worker_id.as_deref(),
                        "Orphaned request failed",
                    );
                    report.failed += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::error!(
                    request_id = request.id,
                    error = %e,
                    "Failed to fail orphaned request",
                ),
            }
        }

        tracing::info!(
            policy = ?policy,
            reattached = report.reattached,
            failed = report.failed,
            "Startup reconciliation finished",
        );
        Ok(report)
    }

    async fn try_reattach(&self, request: &Request) -> bool {
        let (Some(external_job_id), Some(worker_id)) =
            (&request.external_job_id, &request.assigned_worker_id)
        else {
            return false;
        };
        let Some(worker) = self.pool().get(worker_id) else {
            tracing::warn!(request_id = request.id, worker_id = %worker_id, "Worker no longer configured");
            return false;
        };
        if let Err(e) = self.pool().assign(worker_id, request.id).await {
            tracing::warn!(request_id = request.id, worker_id = %worker_id, error = %e, "Cannot re-reserve worker");
            return false;
        }

        // The ceiling keeps counting from the original dispatch.
        let prior_elapsed = request
            .started_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or(Duration::ZERO);

        tracing::info!(
            request_id = request.id,
            worker_id = %worker_id,
            external_job_id = %external_job_id,
            prior_elapsed_secs = prior_elapsed.as_secs(),
            "Re-attached monitor to in-flight request",
        );
        self.spawn_monitor(request.clone(), worker, external_job_id.clone(), prior_elapsed);
        true
    }
}

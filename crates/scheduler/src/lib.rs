//! Dispatch loop, worker pool and per-job monitors for generation requests.
//!
//! - [`WorkerPool`] tracks configured worker endpoints, their health and
//!   their single-job reservation.
//! - [`Scheduler`] claims pending requests on a fixed interval and submits
//!   them to idle workers, spawning one [`JobMonitor`] per dispatch.
//! - [`JobMonitor`] polls the worker until the job reaches a terminal state
//!   and finalizes the durable request.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod monitor;
pub mod payload;
pub mod pool;
pub mod reconcile;

pub use config::{ReconcilePolicy, SchedulerConfig, StoreKind};
pub use dispatcher::{DispatchError, Scheduler, TickReport};
pub use monitor::{JobMonitor, MonitorConfig, MonitorOutcome};
pub use payload::{PayloadBuilder, PayloadError, StoredWorkflow};
pub use pool::{PoolError, WorkerHandle, WorkerPool, WorkerSnapshot};
pub use reconcile::ReconcileReport;

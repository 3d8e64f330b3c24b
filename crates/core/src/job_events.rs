//! Event type names published on the job event bus.
//!
//! One constant per lifecycle transition observed by the scheduler or a
//! job monitor.

/// A claimed request was accepted by a worker.
pub const EVENT_JOB_DISPATCHED: &str = "job.dispatched";

/// The worker produced output for the job.
pub const EVENT_JOB_COMPLETED: &str = "job.completed";

/// The job failed (submission, execution, or exhausted poll retries).
pub const EVENT_JOB_FAILED: &str = "job.failed";

/// The request was cancelled by an external actor while being monitored.
pub const EVENT_JOB_CANCELLED: &str = "job.cancelled";

/// The monitoring ceiling was reached before the job finished.
pub const EVENT_JOB_TIMED_OUT: &str = "job.timed_out";

/// The job completed but the notification sink rejected the delivery.
pub const EVENT_NOTIFICATION_FAILED: &str = "job.notification_failed";

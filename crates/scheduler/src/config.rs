//! Scheduler configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use renderq_core::error::CoreError;
use renderq_core::worker::{parse_worker_endpoints, WorkerDescriptor};

use crate::monitor::MonitorConfig;

const DEFAULT_WORKER_ENDPOINTS: &str = "local=http://127.0.0.1:8188";

/// Which [`RequestStore`](renderq_db::RequestStore) implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    /// Process-local store; requests are lost on restart.
    Memory,
}

impl FromStr for StoreKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreKind::Postgres),
            "memory" => Ok(StoreKind::Memory),
            other => Err(CoreError::Validation(format!(
                "REQUEST_STORE must be \"postgres\" or \"memory\", got \"{other}\""
            ))),
        }
    }
}

/// What to do at startup with requests left in `processing` by a previous
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePolicy {
    /// Re-attach monitors to requests whose worker is still configured and
    /// fail the rest.
    #[default]
    Reattach,
    /// Fail every leftover `processing` request.
    Fail,
    /// Leave them alone. Required when several schedulers share one store.
    Off,
}

impl FromStr for ReconcilePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reattach" => Ok(ReconcilePolicy::Reattach),
            "fail" => Ok(ReconcilePolicy::Fail),
            "off" => Ok(ReconcilePolicy::Off),
            other => Err(CoreError::Validation(format!(
                "RECONCILE_POLICY must be \"reattach\", \"fail\" or \"off\", got \"{other}\""
            ))),
        }
    }
}

/// Scheduler configuration.
///
/// All fields except the database URL have defaults suitable for a
/// single-worker development setup.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub store: StoreKind,
    /// Required when `store` is [`StoreKind::Postgres`].
    pub database_url: Option<String>,
    /// Worker endpoints in registration order.
    pub workers: Vec<WorkerDescriptor>,
    /// Dispatch loop interval.
    pub tick_interval: Duration,
    pub monitor: MonitorConfig,
    /// Minimum time between two worker health refreshes.
    pub health_refresh_interval: Duration,
    /// Timeout applied to a single liveness probe.
    pub health_check_timeout: Duration,
    /// Maximum number of requests in `processing` at once.
    pub global_concurrency: usize,
    /// Maximum number of active requests per owner.
    pub owner_concurrency: usize,
    pub reconcile: ReconcilePolicy,
    /// Webhook target for finished artifacts. Logged only when unset.
    pub notify_webhook_url: Option<String>,
}

impl SchedulerConfig {
    /// Build a configuration with defaults for the given workers.
    pub fn new(workers: Vec<WorkerDescriptor>) -> Self {
        let global_concurrency = workers.len();
        Self {
            store: StoreKind::Memory,
            database_url: None,
            workers,
            tick_interval: Duration::from_secs(5),
            monitor: MonitorConfig::default(),
            health_refresh_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            global_concurrency,
            owner_concurrency: 2,
            reconcile: ReconcilePolicy::default(),
            notify_webhook_url: None,
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                       |
    /// |-----------------------------|-------------------------------|
    /// | `REQUEST_STORE`             | `postgres`                    |
    /// | `DATABASE_URL`              | required for `postgres`       |
    /// | `WORKER_ENDPOINTS`          | `local=http://127.0.0.1:8188` |
    /// | `SCHEDULER_TICK_SECS`       | `5`                           |
    /// | `POLL_INTERVAL_SECS`        | `5`                           |
    /// | `MONITOR_TIMEOUT_SECS`      | `1800`                        |
    /// | `MAX_POLL_RETRIES`          | `5`                           |
    /// | `MAX_POLL_BACKOFF_SECS`     | `60`                          |
    /// | `HEALTH_REFRESH_SECS`       | `60`                          |
    /// | `HEALTH_CHECK_TIMEOUT_SECS` | `5`                           |
    /// | `GLOBAL_CONCURRENCY`        | number of workers             |
    /// | `OWNER_CONCURRENCY`         | `2`                           |
    /// | `RECONCILE_POLICY`          | `reattach`                    |
    /// | `NOTIFY_WEBHOOK_URL`        | unset                         |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store: StoreKind = var("REQUEST_STORE")
            .as_deref()
            .unwrap_or("postgres")
            .parse()?;
        let database_url = var("DATABASE_URL");
        if store == StoreKind::Postgres && database_url.is_none() {
            return Err(CoreError::Validation(
                "DATABASE_URL must be set when REQUEST_STORE=postgres".to_string(),
            ));
        }

        let workers = parse_worker_endpoints(
            var("WORKER_ENDPOINTS")
                .as_deref()
                .unwrap_or(DEFAULT_WORKER_ENDPOINTS),
        )?;

        let mut config = Self::new(workers);
        config.store = store;
        config.database_url = database_url;

        let secs = |key: &str, default: u64| -> Result<Duration, CoreError> {
            let value: u64 = parse_var(var(key), key, default)?;
            if value == 0 {
                return Err(CoreError::Validation(format!("{key} must be greater than zero")));
            }
            Ok(Duration::from_secs(value))
        };

        config.tick_interval = secs("SCHEDULER_TICK_SECS", 5)?;
        config.monitor = MonitorConfig {
            poll_interval: secs("POLL_INTERVAL_SECS", 5)?,
            timeout: secs("MONITOR_TIMEOUT_SECS", 1800)?,
            max_retries: parse_var(var("MAX_POLL_RETRIES"), "MAX_POLL_RETRIES", 5)?,
            max_backoff: secs("MAX_POLL_BACKOFF_SECS", 60)?,
        };
        config.health_refresh_interval = secs("HEALTH_REFRESH_SECS", 60)?;
        config.health_check_timeout = secs("HEALTH_CHECK_TIMEOUT_SECS", 5)?;

        let default_global = config.workers.len();
        config.global_concurrency =
            parse_var(var("GLOBAL_CONCURRENCY"), "GLOBAL_CONCURRENCY", default_global)?;
        config.owner_concurrency =
            parse_var(var("OWNER_CONCURRENCY"), "OWNER_CONCURRENCY", 2)?;
        if config.global_concurrency == 0 || config.owner_concurrency == 0 {
            return Err(CoreError::Validation(
                "GLOBAL_CONCURRENCY and OWNER_CONCURRENCY must be greater than zero".to_string(),
            ));
        }

        if let Some(policy) = var("RECONCILE_POLICY") {
            config.reconcile = policy.parse()?;
        }
        config.notify_webhook_url = var("NOTIFY_WEBHOOK_URL");

        Ok(config)
    }
}

fn parse_var<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, CoreError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            CoreError::Validation(format!("{key} must be a non-negative integer, got \"{raw}\""))
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use renderq_core::worker::WorkerKind;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<SchedulerConfig, CoreError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SchedulerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_with_memory_store() {
        let config = load(&[("REQUEST_STORE", "memory")]).unwrap();

        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].kind, WorkerKind::Local);
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(5));
        assert_eq!(config.monitor.timeout, Duration::from_secs(1800));
        assert_eq!(config.monitor.max_retries, 5);
        assert_eq!(config.global_concurrency, 1);
        assert_eq!(config.owner_concurrency, 2);
        assert_eq!(config.reconcile, ReconcilePolicy::Reattach);
        assert!(config.notify_webhook_url.is_none());
    }

    #[test]
    fn postgres_requires_database_url() {
        assert!(load(&[]).is_err());
        let config = load(&[("DATABASE_URL", "postgres://localhost/renderq")]).unwrap();
        assert_eq!(config.store, StoreKind::Postgres);
    }

    #[test]
    fn global_concurrency_defaults_to_worker_count() {
        let config = load(&[
            ("REQUEST_STORE", "memory"),
            ("WORKER_ENDPOINTS", "remote=http://a:1,remote=http://b:1,local=http://c:1"),
        ])
        .unwrap();
        assert_eq!(config.global_concurrency, 3);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("REQUEST_STORE", "memory"),
            ("POLL_INTERVAL_SECS", "2"),
            ("MAX_POLL_RETRIES", "9"),
            ("GLOBAL_CONCURRENCY", "4"),
            ("RECONCILE_POLICY", "off"),
            ("NOTIFY_WEBHOOK_URL", "http://hooks/done"),
        ])
        .unwrap();
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(2));
        assert_eq!(config.monitor.max_retries, 9);
        assert_eq!(config.global_concurrency, 4);
        assert_eq!(config.reconcile, ReconcilePolicy::Off);
        assert_eq!(config.notify_webhook_url.as_deref(), Some("http://hooks/done"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(load(&[("REQUEST_STORE", "memory"), ("POLL_INTERVAL_SECS", "soon")]).is_err());
        assert!(load(&[("REQUEST_STORE", "memory"), ("SCHEDULER_TICK_SECS", "0")]).is_err());
        assert!(load(&[("REQUEST_STORE", "memory"), ("RECONCILE_POLICY", "maybe")]).is_err());
        assert!(load(&[("REQUEST_STORE", "memory"), ("WORKER_ENDPOINTS", "gpu=http://a:1")]).is_err());
        assert!(load(&[("REQUEST_STORE", "sqlite")]).is_err());
    }
}

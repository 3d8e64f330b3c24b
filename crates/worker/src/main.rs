use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use renderq_comfyui::{ComfyUIApi, WorkerBackend};
use renderq_db::{InMemoryRequestStore, PgRequestStore, RequestStore};
use renderq_events::{EventBus, EventJournal, LogSink, NotificationSink, WebhookSink};
use renderq_scheduler::{Scheduler, SchedulerConfig, StoreKind, WorkerPool};

/// Time monitors get to stop after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Timeout for a single HTTP call to a worker endpoint.
const WORKER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "renderq_worker=debug,renderq_scheduler=debug".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = SchedulerConfig::from_env().context("Invalid scheduler configuration")?;
    tracing::info!(
        store = ?config.store,
        workers = config.workers.len(),
        global_concurrency = config.global_concurrency,
        owner_concurrency = config.owner_concurrency,
        "Loaded scheduler configuration",
    );

    // --- Request store ---
    let store: Arc<dyn RequestStore> = match config.store {
        StoreKind::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set")?;
            let pool = renderq_db::create_pool(database_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connection pool created");

            renderq_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            renderq_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied");

            Arc::new(PgRequestStore::new(pool, config.owner_concurrency))
        }
        StoreKind::Memory => {
            tracing::warn!("Using in-memory request store; requests are lost on restart");
            Arc::new(InMemoryRequestStore::new(config.owner_concurrency))
        }
    };

    // --- Worker pool ---
    let client = reqwest::Client::builder()
        .timeout(WORKER_REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let workers = config
        .workers
        .iter()
        .map(|descriptor| {
            let api = ComfyUIApi::with_client(client.clone(), descriptor.url.clone());
            (descriptor.clone(), Arc::new(api) as Arc<dyn WorkerBackend>)
        })
        .collect();
    let pool = Arc::new(WorkerPool::new(
        workers,
        config.health_refresh_interval,
        config.health_check_timeout,
    ));
    pool.force_refresh().await;
    for worker in pool.snapshot().await {
        tracing::info!(worker_id = %worker.id, kind = %worker.kind, healthy = worker.healthy, "Worker registered");
    }

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());
    let journal_handle = tokio::spawn(EventJournal::run(event_bus.subscribe()));

    // --- Notification sink ---
    let sink: Arc<dyn NotificationSink> = match &config.notify_webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Delivering artifacts by webhook");
            Arc::new(WebhookSink::new(url.clone()).context("Failed to build webhook sink")?)
        }
        None => Arc::new(LogSink),
    };

    // --- Scheduler ---
    let scheduler = Arc::new(Scheduler::new(
        &config,
        store,
        pool,
        sink,
        Arc::clone(&event_bus),
    ));
    scheduler
        .reconcile(config.reconcile)
        .await
        .context("Startup reconciliation failed")?;

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    shutdown_signal().await;

    // --- Shutdown ---
    scheduler.shutdown(SHUTDOWN_GRACE).await;
    let _ = runner.await;
    tracing::info!("Scheduler stopped");

    // Dropping the last bus handle closes the channel and ends the journal.
    drop(scheduler);
    drop(event_bus);
    let _ = tokio::time::timeout(Duration::from_secs(5), journal_handle).await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

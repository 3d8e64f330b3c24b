//! Durable request storage for the renderq scheduler.
//!
//! The [`RequestStore`] trait is the persistence contract the scheduler
//! and job monitors depend on. [`PgRequestStore`] implements it on
//! Postgres (via [`RequestRepo`]); [`InMemoryRequestStore`] implements
//! the same semantics in process memory.

use sqlx::postgres::PgPoolOptions;

pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub use memory::InMemoryRequestStore;
pub use repositories::RequestRepo;
pub use store::{PgRequestStore, RequestStore, StoreError};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run a trivial query to verify the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply all pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}

//! Postgres-backed persistence.

mod pg;

pub use pg::PgStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use bellows_core::config::DatabaseConfig;
use bellows_core::error::{BellowsError, Result};

/// Open a connection pool from the database configuration.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| BellowsError::Database(format!("failed to connect: {}", e)))
}

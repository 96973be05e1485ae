//! Database connection pool management.

use super::{classify_pg, StorageResult};
use crate::error::StorageError;
use sqlx::migrate::MigrateError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Type alias for the database pool.
pub type Pool = PgPool;

/// Create a new database connection pool. Connections are opened on first use.
pub fn create_pool(database_url: &str, max_connections: u32) -> Result<Pool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy(database_url)
}

/// Run database migrations. A database that cannot be reached is reported
/// as a connectivity failure so startup can wait for it.
pub async fn run_migrations(pool: &Pool) -> StorageResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| match err {
            MigrateError::Execute(err) => classify_pg(&err),
            other => StorageError::other(other.to_string()),
        })
}

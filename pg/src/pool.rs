//! Database connection pool management.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Type alias for the database pool.
pub type Pool = PgPool;

/// Create a connection pool sized for a single handler process.
pub async fn create_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    create_pool_with(database_url, 10).await
}

/// Create a connection pool with an explicit connection cap. Receiving
/// handlers hold a connection for the length of one event, so the cap
/// bounds event concurrency.
pub async fn create_pool_with(database_url: &str, max_connections: u32) -> Result<Pool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

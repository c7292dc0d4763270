//! Database module for SQLite persistence
//!
//! Handles upload sessions, the quota ledger, and the registry of stored
//! objects.

mod objects;
mod quota;
mod schema;
mod sessions;

pub use objects::*;
pub use quota::*;
pub use schema::*;
pub use sessions::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Create an in-memory database with its schema.
///
/// An in-memory SQLite database lives and dies with its connection, so the
/// pool is pinned to exactly one connection that is never recycled.
pub async fn create_memory_pool() -> sqlx::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    initialize_schema(&pool).await?;

    Ok(pool)
}

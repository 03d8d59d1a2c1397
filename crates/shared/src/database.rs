//! Embedded database pool and utilities.
//!
//! This module provides the SQLite connection pool, migration management,
//! and health check functionality. The whole index lives in one database
//! file; WAL mode lets concurrent readers proceed while a single writer
//! serializes behind the busy timeout.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{AppResult, DatabaseError};

/// Database connection pool wrapper
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and build the connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the pool cannot be
    /// created.
    pub async fn new(config: &DatabaseConfig) -> AppResult<Self> {
        info!("Opening database at {}", config.path);

        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        info!(
            "Database pool opened with {} max connections",
            config.max_connections
        );

        Ok(Self { pool })
    }

    /// Open an in-memory database with a single shared connection.
    ///
    /// Every connection to `sqlite::memory:` gets its own database, so the
    /// pool is capped at one connection. Intended for tests.
    pub async fn connect_memory() -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail
    pub async fn run_migrations(&self) -> AppResult<()> {
        info!("Running database migrations");

        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Check database connection health
    ///
    /// # Errors
    ///
    /// Returns an error if the health check fails
    pub async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        Ok(())
    }

    /// Close the database connection pool
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

/// Execute a transaction with automatic rollback on error
pub async fn transaction<F, Fut, T>(pool: &SqlitePool, f: F) -> AppResult<T>
where
    F: FnOnce(&mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

    let result = f(&mut tx)
        .await
        .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

    Ok(result)
}

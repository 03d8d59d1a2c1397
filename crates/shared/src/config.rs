//! Configuration for the shared subsystems.
//!
//! Subsystem-specific settings (explorer, relay server, SLA policy, ...)
//! live next to the code they configure; this module only carries what the
//! shared layer itself needs.

use serde::Deserialize;
use std::env;

/// Embedded database settings.
///
/// The index is a single SQLite file; WAL journaling and a generous busy
/// timeout let concurrent readers coexist with the single ingest writer.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the database file
    pub path: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u64,
    /// Run pending migrations on startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/beacon.db".to_string(),
            max_connections: 10,
            busy_timeout_secs: 30,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    /// Load database settings from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            path: env::var("DATABASE_PATH").unwrap_or(defaults.path),
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| defaults.max_connections.to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS"))?,
            busy_timeout_secs: env::var("DB_BUSY_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.busy_timeout_secs.to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_BUSY_TIMEOUT_SECS"))?,
            run_migrations: env::var("DB_RUN_MIGRATIONS")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(defaults.run_migrations),
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Missing required environment variable
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    /// Invalid value for environment variable
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.path, "./data/beacon.db");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.busy_timeout_secs, 30);
        assert!(config.run_migrations);
    }
}

//! Shared foundations for the Beacon platform.
//!
//! This crate carries the pieces every subsystem needs: typed configuration,
//! the embedded database pool, the common error taxonomy, and small value
//! types (hex identifiers, unix timestamps).

pub mod config;
pub mod database;
pub mod error;
pub mod types;

pub use config::DatabaseConfig;
pub use database::Database;
pub use error::{AppError, AppResult, DatabaseError, ProtocolError, ValidationError};

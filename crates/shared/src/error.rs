//! Common error types for the Beacon platform.
//!
//! Boundaries translate low-level failures into enumerated reasons; internal
//! functions return structured errors that callers either retry or surface.
//! Bad peer input is never allowed to panic the process.

use std::fmt;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Application-wide error type.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors
    Database(DatabaseError),
    /// Wire protocol errors (malformed events, bad signatures, bad frames)
    Protocol(ProtocolError),
    /// Validation errors
    Validation(ValidationError),
    /// Resource not found
    NotFound(String),
    /// Resource already exists
    AlreadyExists(String),
    /// Internal error
    Internal(String),
    /// Bad request from a peer or caller
    BadRequest(String),
    /// Rate limit exceeded
    RateLimitExceeded,
    /// Upstream relay unavailable
    RelayUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Validation(e) => write!(f, "Validation error: {}", e),
            Self::NotFound(msg) => write!(f, "Not found: {}", msg),
            Self::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::RateLimitExceeded => write!(f, "Rate limit exceeded"),
            Self::RelayUnavailable(msg) => write!(f, "Relay unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Database error types
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found")]
    NotFound,

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),
}

/// Wire protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Event id does not match canonical form")]
    IdMismatch,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Validation error types
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid info hash format")]
    InvalidInfoHash,

    #[error("Invalid field: {field} - {message}")]
    InvalidField { field: String, message: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

// Conversions from common error types

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // SQLite unique constraint violations arrive as error code 2067/1555
                if db_err.message().contains("UNIQUE constraint failed") {
                    return Self::AlreadyExists("Record already exists".to_string());
                }
                Self::Database(DatabaseError::QueryFailed(db_err.to_string()))
            }
            sqlx::Error::PoolTimedOut => {
                Self::Database(DatabaseError::ConnectionFailed("Pool timeout".to_string()))
            }
            _ => Self::Database(DatabaseError::QueryFailed(err.to_string())),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::Serialization(err.to_string()))
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        Self::Database(err)
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

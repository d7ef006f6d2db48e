//! error.rs - Centralized error handling using thiserror
//!
//! Every variant is serializable so a host embedding this crate across an
//! IPC/FFI boundary can hand the error to its own frontend the same way the
//! application this core was extracted from does.

use serde::{Deserialize, Serialize};

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sync core.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid wire envelope: {0}")]
    InvalidEnvelope(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("transport timeout: {0}")]
    Timeout(String),

    #[error("transport network error: {0}")]
    Network(String),

    #[error("server status {code}: {message}")]
    TransportStatus {
        code: String,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("cycle aborted at stage {stage}: {message}")]
    CycleAborted { stage: String, message: String },
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound(err.to_string()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                Error::ConstraintViolation(db_err.message().to_string())
            }
            other => Error::Store(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

//! Error types used throughout the application

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for HideSync
///
/// This is the caller-facing error: services and endpoints see only these
/// variants, never driver errors.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum HideSyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Too many concurrent connections
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Connection could not be acquired in time, or the database is failing
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for HideSync operations
pub type Result<T> = std::result::Result<T, HideSyncError>;

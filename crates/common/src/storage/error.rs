//! Storage error types
//!
//! Pool exhaustion, acquisition timeouts and an open circuit each have their
//! own variant so callers can tell "too much load" apart from "database
//! down".

use std::time::Duration;

use thiserror::Error;

use crate::error::{ErrorClassification, ErrorSeverity};
use crate::security::{KeychainError, SecurityError};

/// Storage error type
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database query error: {0}")]
    Query(String),

    #[error("Database encryption error: {0}")]
    Encryption(String),

    #[error("Wrong encryption key or database not encrypted")]
    WrongKeyOrNotEncrypted,

    #[error("Database pool exhausted ({capacity} connections in use)")]
    PoolExhausted { capacity: usize },

    #[error("Connection timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Circuit breaker open, connection attempts suspended")]
    CircuitOpen { retry_after: Option<Duration> },

    #[error("No row found for {0}")]
    NoResultFound(String),

    #[error("Multiple rows found for {0} where one was expected")]
    MultipleResultsFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid transaction state: {0}")]
    TransactionState(String),

    #[error(transparent)]
    Common(#[from] crate::CommonError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    R2d2(#[from] r2d2::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

impl ErrorClassification for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } => true,
            Self::Timeout(_) => true,
            Self::CircuitOpen { .. } => true,
            Self::Connection(_) => true,
            Self::Rusqlite(err) => {
                matches!(
                    err.sqlite_error_code(),
                    Some(rusqlite::ErrorCode::DatabaseBusy)
                        | Some(rusqlite::ErrorCode::DatabaseLocked)
                )
            }
            Self::Common(common_err) => common_err.is_retryable(),
            Self::Security(err) => err.is_retryable(),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Connection(_) => ErrorSeverity::Error,
            Self::Query(_) => ErrorSeverity::Error,
            Self::Encryption(_) => ErrorSeverity::Critical,
            Self::WrongKeyOrNotEncrypted => ErrorSeverity::Critical,
            Self::PoolExhausted { .. } => ErrorSeverity::Warning,
            Self::Timeout(_) => ErrorSeverity::Warning,
            Self::CircuitOpen { .. } => ErrorSeverity::Warning,
            Self::NoResultFound(_) => ErrorSeverity::Info,
            Self::MultipleResultsFound(_) => ErrorSeverity::Error,
            Self::InvalidConfig(_) => ErrorSeverity::Error,
            Self::TransactionState(_) => ErrorSeverity::Error,
            Self::Common(common_err) => common_err.severity(),
            Self::Security(err) => err.severity(),
            Self::Io(_) => ErrorSeverity::Error,
            Self::Rusqlite(_) => ErrorSeverity::Error,
            Self::R2d2(_) => ErrorSeverity::Error,
            Self::SerdeJson(_) => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Encryption(_) | Self::WrongKeyOrNotEncrypted)
            || matches!(self, Self::Common(err) if err.is_critical())
            || matches!(self, Self::Security(err) if err.is_critical())
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after } => *retry_after,
            Self::Common(common_err) => common_err.retry_after(),
            _ => None,
        }
    }
}

impl StorageError {
    /// Add operation context to the error
    pub fn with_operation(self, operation: impl Into<String>) -> Self {
        Self::Common(crate::CommonError::storage(operation, self.to_string()))
    }
}

impl From<KeychainError> for StorageError {
    fn from(e: KeychainError) -> Self {
        Self::Security(SecurityError::Keychain(e))
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for storage::error.
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::Connection("Failed to connect".to_string());
        assert_eq!(err.to_string(), "Database connection error: Failed to connect");

        let err = StorageError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Connection timeout after 1500ms");

        let err = StorageError::PoolExhausted { capacity: 15 };
        assert_eq!(err.to_string(), "Database pool exhausted (15 connections in use)");
    }

    /// Exhaustion and timeout are distinct from driver failures.
    #[test]
    fn test_load_errors_are_distinct() {
        let exhausted = StorageError::PoolExhausted { capacity: 2 };
        let timeout = StorageError::Timeout(Duration::from_secs(1));
        assert!(!matches!(exhausted, StorageError::Connection(_)));
        assert!(!matches!(timeout, StorageError::Connection(_)));
        assert_eq!(exhausted.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_retryability() {
        assert!(StorageError::PoolExhausted { capacity: 1 }.is_retryable());
        assert!(StorageError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(StorageError::CircuitOpen { retry_after: None }.is_retryable());
        assert!(!StorageError::InvalidConfig("test".to_string()).is_retryable());
        assert!(!StorageError::WrongKeyOrNotEncrypted.is_retryable());
    }

    #[test]
    fn test_error_criticality() {
        assert!(StorageError::Encryption("test".to_string()).is_critical());
        assert!(StorageError::WrongKeyOrNotEncrypted.is_critical());
        assert!(!StorageError::NoResultFound("materials".into()).is_critical());
        assert!(!StorageError::PoolExhausted { capacity: 1 }.is_critical());
    }

    #[test]
    fn test_circuit_open_retry_hint() {
        let err = StorageError::CircuitOpen { retry_after: Some(Duration::from_secs(12)) };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_with_operation() {
        let err = StorageError::Query("SELECT failed".to_string()).with_operation("flush");
        match err {
            StorageError::Common(common_err) => assert!(common_err.to_string().contains("flush")),
            other => panic!("Expected Common error variant, got {other:?}"),
        }
    }
}

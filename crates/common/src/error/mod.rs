//! Shared error taxonomy
//!
//! `StorageError` and `SecurityError` wrap [`CommonError`] for conditions
//! that are not specific to either layer. Every error type implements
//! [`ErrorClassification`], which is what the pool and the session factory
//! consult when deciding whether a failure is transient.
//!
//! | Severity | Examples |
//! |----------|----------|
//! | Info | row not found |
//! | Warning | pool exhausted, acquisition timeout, open circuit |
//! | Error | query failure, invalid configuration |
//! | Critical | wrong key, insecure key file |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type CommonResult<T> = Result<T, CommonError>;

/// Conditions shared by the storage and security layers
#[derive(Debug, Clone, Error)]
pub enum CommonError {
    #[error("invalid configuration for '{field}': {message}")]
    Config { field: String, message: String },

    #[error("could not lock {resource}: {message}")]
    Lock { resource: String, message: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("{operation} failed: {message}")]
    Storage { operation: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config { field: field.into(), message: message.into() }
    }

    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage { operation: operation.into(), message: message.into() }
    }
}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Lock { .. } | Self::Timeout { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Lock { .. } | Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Config { .. } | Self::Storage { .. } => ErrorSeverity::Error,
            Self::Internal(_) => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Retry and alerting hints carried by every error type
pub trait ErrorClassification {
    /// Transient failures: pool exhaustion, acquisition timeouts, SQLite
    /// BUSY/LOCKED, an open circuit
    fn is_retryable(&self) -> bool;

    fn severity(&self) -> ErrorSeverity;

    fn is_critical(&self) -> bool;

    /// Suggested delay before retrying, when known
    fn retry_after(&self) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        })
    }
}

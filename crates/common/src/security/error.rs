//! Errors raised while resolving or protecting key material

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::KeychainError;
use crate::error::{ErrorClassification, ErrorSeverity};

pub type SecurityResult<T> = Result<T, SecurityError>;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Key file {path} has insecure permissions {mode:o}; it must not be readable by group or others")]
    InsecurePermissions { path: PathBuf, mode: u32 },

    #[error("Key file not found: {0}")]
    KeyFileMissing(PathBuf),

    #[error("Key path is not a regular file: {0}")]
    NotARegularFile(PathBuf),

    #[error("No secret store for provider '{0}': register one or enable its cargo feature")]
    ProviderUnavailable(String),

    #[error("Failed to fetch secret from {provider}: {message}")]
    SecretFetch { provider: String, message: String },

    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Failed to create key file {path}: {message}")]
    KeyFileCreation { path: PathBuf, message: String },

    #[error("Keychain error: {0}")]
    Keychain(#[from] KeychainError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecurityError {
    pub fn secret_fetch(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SecretFetch { provider: provider.into(), message: message.into() }
    }
}

impl ErrorClassification for SecurityError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::SecretFetch { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::SecretFetch { .. } | Self::Io(_) => ErrorSeverity::Error,
            _ => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for security::error.
    use super::*;

    #[test]
    fn test_insecure_permissions_message() {
        let err = SecurityError::InsecurePermissions { path: PathBuf::from("/k"), mode: 0o644 };
        assert!(err.to_string().contains("644"));
        assert!(err.is_critical());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_secret_fetch_is_retryable() {
        let err = SecurityError::secret_fetch("aws", "throttled");
        assert!(err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }
}

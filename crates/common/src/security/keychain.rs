//! Platform keychain storage for database keys
//!
//! Thin wrapper over `keyring` so a key can live in macOS Keychain, Windows
//! Credential Manager or the Secret Service API instead of a file on disk.

use keyring::Entry;
use thiserror::Error;
use tracing::debug;

use super::{generate_encryption_key, SecureString};

/// Keychain entries for one service name
#[derive(Debug, Clone)]
pub struct KeychainProvider {
    service_name: String,
}

impl KeychainProvider {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into() }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Store a secret under `account`
    pub fn set_secret(&self, account: &str, value: &str) -> Result<(), KeychainError> {
        debug!(service = %self.service_name, account = %account, "Storing secret in keychain");
        let entry = self.create_entry(account)?;
        entry.set_password(value).map_err(|e| {
            KeychainError::AccessFailed(format!("Failed to store secret for {}: {}", account, e))
        })
    }

    /// Fetch the secret stored under `account`
    pub fn get_secret(&self, account: &str) -> Result<SecureString, KeychainError> {
        debug!(service = %self.service_name, account = %account, "Retrieving secret from keychain");
        let entry = self.create_entry(account)?;
        entry.get_password().map(SecureString::new).map_err(|e| {
            if matches!(e, keyring::Error::NoEntry) {
                KeychainError::NotFound
            } else {
                KeychainError::AccessFailed(format!(
                    "Failed to retrieve secret for {}: {}",
                    account, e
                ))
            }
        })
    }

    /// Return the key stored under `account`, generating and storing a fresh
    /// 256-bit hex key when the entry does not exist yet
    pub fn get_or_create_key(&self, account: &str) -> Result<SecureString, KeychainError> {
        match self.get_secret(account) {
            Ok(key) => Ok(key),
            Err(KeychainError::NotFound) => {
                debug!(
                    service = %self.service_name,
                    account = %account,
                    "No key in keychain, generating a new one"
                );
                let key = generate_encryption_key();
                self.set_secret(account, key.expose())?;
                Ok(key)
            }
            Err(e) => Err(e),
        }
    }

    fn create_entry(&self, account: &str) -> Result<Entry, KeychainError> {
        Entry::new(&self.service_name, account).map_err(|e| {
            KeychainError::AccessFailed(format!("Failed to create keychain entry: {}", e))
        })
    }
}

/// Keychain error types
#[derive(Debug, Error)]
pub enum KeychainError {
    /// Keychain access failed (permission denied, no backend, etc.)
    #[error("Keychain access failed: {0}")]
    AccessFailed(String),

    /// Entry not found in keychain
    #[error("Entry not found")]
    NotFound,
}

#[cfg(test)]
mod tests {
    //! Unit tests for security::keychain.
    use super::*;

    #[test]
    fn test_keychain_provider_creation() {
        let keychain = KeychainProvider::new("HideSync.database");
        assert_eq!(keychain.service_name(), "HideSync.database");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(KeychainError::NotFound.to_string(), "Entry not found");
        assert_eq!(
            KeychainError::AccessFailed("locked".into()).to_string(),
            "Keychain access failed: locked"
        );
    }
}

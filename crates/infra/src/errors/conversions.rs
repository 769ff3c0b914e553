//! Conversions from storage and driver errors into the caller-facing
//! `HideSyncError`.
//!
//! Pool exhaustion and acquisition timeouts keep their own variants so
//! callers can tell load problems from a failing database.

use hidesync_common::security::SecurityError;
use hidesync_common::storage::StorageError;
use hidesync_domain::HideSyncError;
use keyring::Error as KeyringError;
use rusqlite::Error as SqlError;

/// Error newtype that keeps conversions on the infrastructure side and can be
/// converted back into the domain error.
#[derive(Debug)]
pub struct InfraError(pub HideSyncError);

impl From<InfraError> for HideSyncError {
    fn from(value: InfraError) -> Self {
        value.0
    }
}

impl From<HideSyncError> for InfraError {
    fn from(value: HideSyncError) -> Self {
        InfraError(value)
    }
}

/// Extension trait to make the conversion logic explicit in tests and within
/// this module.
trait IntoHideSyncError {
    fn into_hidesync(self) -> HideSyncError;
}

/* -------------------------------------------------------------------------- */
/* StorageError → HideSyncError */
/* -------------------------------------------------------------------------- */

impl IntoHideSyncError for StorageError {
    fn into_hidesync(self) -> HideSyncError {
        match self {
            StorageError::PoolExhausted { .. } => HideSyncError::PoolExhausted(self.to_string()),
            StorageError::Timeout(_) | StorageError::CircuitOpen { .. } => {
                HideSyncError::Unavailable(self.to_string())
            }
            StorageError::Encryption(_) | StorageError::WrongKeyOrNotEncrypted => {
                HideSyncError::Encryption(self.to_string())
            }
            StorageError::NoResultFound(_) => HideSyncError::NotFound(self.to_string()),
            StorageError::MultipleResultsFound(_) => HideSyncError::InvalidInput(self.to_string()),
            StorageError::InvalidConfig(msg) => HideSyncError::Config(msg),
            StorageError::Security(err) => err.into_hidesync(),
            StorageError::Rusqlite(err) => err.into_hidesync(),
            other => HideSyncError::Database(other.to_string()),
        }
    }
}

impl From<StorageError> for InfraError {
    fn from(value: StorageError) -> Self {
        InfraError(value.into_hidesync())
    }
}

/* -------------------------------------------------------------------------- */
/* SecurityError → HideSyncError */
/* -------------------------------------------------------------------------- */

impl IntoHideSyncError for SecurityError {
    fn into_hidesync(self) -> HideSyncError {
        match self {
            SecurityError::Keychain(err) => HideSyncError::Security(format!("keychain: {err}")),
            other => HideSyncError::Security(other.to_string()),
        }
    }
}

impl From<SecurityError> for InfraError {
    fn from(value: SecurityError) -> Self {
        InfraError(value.into_hidesync())
    }
}

/* -------------------------------------------------------------------------- */
/* rusqlite::Error → HideSyncError */
/* -------------------------------------------------------------------------- */

impl IntoHideSyncError for SqlError {
    fn into_hidesync(self) -> HideSyncError {
        use rusqlite::ffi::ErrorCode;
        use rusqlite::Error as RE;

        match self {
            RE::SqliteFailure(err, maybe_message) => {
                let message = maybe_message.unwrap_or_default();
                match (err.code, err.extended_code) {
                    (ErrorCode::DatabaseBusy, _) => {
                        HideSyncError::Unavailable("database is busy".into())
                    }
                    (ErrorCode::DatabaseLocked, _) => {
                        HideSyncError::Unavailable("database is locked".into())
                    }
                    (ErrorCode::NotADatabase, _) => HideSyncError::Encryption(
                        "SQLCipher key rejected or database not encrypted".into(),
                    ),
                    (ErrorCode::ConstraintViolation, 2067) => {
                        HideSyncError::InvalidInput("unique constraint violation".into())
                    }
                    (ErrorCode::ConstraintViolation, 787) => {
                        HideSyncError::InvalidInput("foreign key constraint violation".into())
                    }
                    _ => HideSyncError::Database(format!(
                        "sqlite failure {:?} (code {}): {}",
                        err.code, err.extended_code, message
                    )),
                }
            }
            RE::QueryReturnedNoRows => HideSyncError::NotFound("no rows returned by query".into()),
            RE::FromSqlConversionFailure(_, _, cause) => {
                HideSyncError::Database(format!("failed to convert sqlite value: {cause}"))
            }
            RE::InvalidColumnType(_, _, ty) => {
                HideSyncError::Database(format!("invalid column type: {ty}"))
            }
            RE::InvalidPath(path) => HideSyncError::Config(format!(
                "invalid database path: {}",
                path.to_string_lossy()
            )),
            other => HideSyncError::Database(other.to_string()),
        }
    }
}

impl From<SqlError> for InfraError {
    fn from(value: SqlError) -> Self {
        InfraError(value.into_hidesync())
    }
}

/* -------------------------------------------------------------------------- */
/* keyring::Error → HideSyncError */
/* -------------------------------------------------------------------------- */

impl IntoHideSyncError for KeyringError {
    fn into_hidesync(self) -> HideSyncError {
        use KeyringError::*;

        let description = self.to_string();

        match self {
            NoEntry => HideSyncError::NotFound("keychain entry not found".into()),
            BadEncoding(_) => {
                HideSyncError::Security("credential in keychain is not valid UTF-8".into())
            }
            PlatformFailure(err) => {
                HideSyncError::Security(format!("keychain platform error: {err}"))
            }
            NoStorageAccess(err) => {
                HideSyncError::Security(format!("unable to access secure storage: {err}"))
            }
            _ => HideSyncError::Security(description),
        }
    }
}

impl From<KeyringError> for InfraError {
    fn from(value: KeyringError) -> Self {
        InfraError(value.into_hidesync())
    }
}

/// Map a storage error straight to the domain error
pub fn to_domain(err: StorageError) -> HideSyncError {
    InfraError::from(err).into()
}

/* -------------------------------------------------------------------------- */
/* Tests */
/* -------------------------------------------------------------------------- */

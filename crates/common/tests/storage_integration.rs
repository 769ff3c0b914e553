//! Integration tests for storage module
//!
//! Exercises the SQLCipher helpers against real database files:
//! - cipher profile plus connection pragmas on one connection
//! - wrong-key classification
//! - rekeying an existing database

#![cfg(feature = "platform")]

use hidesync_common::error::{ErrorClassification, ErrorSeverity};
use hidesync_common::security::generate_encryption_key;
use hidesync_common::storage::{
    apply_connection_pragmas, configure_sqlcipher, rekey, verify_encryption, ConnectionPragmas,
    SqlCipherConfig, StorageError,
};
use rusqlite::Connection;
use tempfile::TempDir;

fn fast_profile(key: &str) -> SqlCipherConfig {
    SqlCipherConfig::new(key).with_kdf_iter(4000)
}

fn open(path: &std::path::Path, config: &SqlCipherConfig) -> Connection {
    let conn = Connection::open(path).unwrap();
    configure_sqlcipher(&conn, config).unwrap();
    conn
}

/// Data written under one key reads back under the same key with the full
/// pragma stack applied.
#[test]
fn test_encrypted_write_then_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hidesync.db");
    let key = generate_encryption_key();
    let config = fast_profile(key.expose());

    {
        let conn = open(&path, &config);
        apply_connection_pragmas(&conn, &ConnectionPragmas::default()).unwrap();
        conn.execute_batch(
            "CREATE TABLE materials (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO materials (name) VALUES ('veg tan');",
        )
        .unwrap();
    }

    let conn = open(&path, &config);
    verify_encryption(&conn).unwrap();
    let name: String =
        conn.query_row("SELECT name FROM materials WHERE id = 1", [], |r| r.get(0)).unwrap();
    assert_eq!(name, "veg tan");
}

/// The file on disk does not contain the SQLite plaintext header.
#[test]
fn test_file_is_not_plaintext() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cipher.db");
    {
        let conn = open(&path, &fast_profile("passphrase"));
        conn.execute("CREATE TABLE t (x TEXT)", []).unwrap();
    }
    let bytes = std::fs::read(&path).unwrap();
    assert!(!bytes.starts_with(b"SQLite format 3"));
}

/// Wrong keys surface as a critical, non-retryable error.
#[test]
fn test_wrong_key_classification() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locked.db");
    {
        let conn = open(&path, &fast_profile("right"));
        conn.execute("CREATE TABLE t (x TEXT)", []).unwrap();
    }

    let conn = open(&path, &fast_profile("wrong"));
    let err = verify_encryption(&conn).unwrap_err();
    assert!(matches!(err, StorageError::WrongKeyOrNotEncrypted));
    assert!(err.is_critical());
    assert!(!err.is_retryable());
    assert_eq!(err.severity(), ErrorSeverity::Critical);
}

/// After a rekey the old key no longer opens the file.
#[test]
fn test_rekey_invalidates_old_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rotate.db");
    let old = fast_profile("old passphrase");
    let new = old.with_key(generate_encryption_key());

    {
        let conn = open(&path, &old);
        conn.execute("CREATE TABLE t (x TEXT)", []).unwrap();
        rekey(&conn, &new.key).unwrap();
    }

    let conn = open(&path, &old);
    assert!(matches!(verify_encryption(&conn), Err(StorageError::WrongKeyOrNotEncrypted)));
    let conn = open(&path, &new);
    verify_encryption(&conn).unwrap();
}

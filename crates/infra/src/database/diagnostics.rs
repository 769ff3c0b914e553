//! Database diagnostics and key migration helpers

use std::fs;
use std::path::{Path, PathBuf};

use hidesync_common::security::SecureString;
use hidesync_common::storage::{
    configure_sqlcipher, rekey, verify_encryption, StorageError, StorageResult,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::encryption::{database_files, EncryptionManager};

const EXPORT_SCHEMA: &str = "encrypted";

/// Result of [`check_database`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseReport {
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
    /// Opened under the configured key
    pub encrypted: bool,
    pub readable: bool,
    pub tables: Vec<String>,
    /// First row of `PRAGMA integrity_check` (`"ok"` when healthy)
    pub integrity: Option<String>,
    pub sqlcipher_version: Option<String>,
    pub error: Option<String>,
}

impl DatabaseReport {
    pub fn is_healthy(&self) -> bool {
        self.readable && self.integrity.as_deref() == Some("ok")
    }
}

/// Inspect the database at `path` without modifying it
#[instrument(skip(manager, path), fields(path = %path.display()))]
pub fn check_database(manager: &EncryptionManager, path: &Path) -> StorageResult<DatabaseReport> {
    manager.initialize()?;

    let mut report = DatabaseReport {
        path: path.to_path_buf(),
        sqlcipher_version: manager.sqlcipher_version().map(str::to_string),
        ..DatabaseReport::default()
    };
    if !path.is_file() {
        return Ok(report);
    }
    report.exists = true;
    report.size_bytes = fs::metadata(path)?.len();

    let opened = if manager.is_encryption_enabled() {
        manager.get_encrypted_connection(path).map(|conn| (conn, true))
    } else {
        open_plain(path).map(|conn| (conn, false))
    };
    let conn = match opened {
        Ok((conn, encrypted)) => {
            report.encrypted = encrypted;
            conn
        }
        Err(e) => {
            warn!(error = %e, "Database could not be opened");
            report.error = Some(e.to_string());
            return Ok(report);
        }
    };

    report.readable = true;
    report.tables = list_tables(&conn)?;
    report.integrity = Some(conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?);

    info!(
        tables = report.tables.len(),
        encrypted = report.encrypted,
        healthy = report.is_healthy(),
        "Database check complete"
    );
    Ok(report)
}

/// Re-encrypt the database at `path` under `new_key`
///
/// The manager must hold the current key. The new key is verified by
/// reopening the file before returning.
#[instrument(skip(manager, path, new_key), fields(path = %path.display()))]
pub fn rekey_database(
    manager: &EncryptionManager,
    path: &Path,
    new_key: &SecureString,
) -> StorageResult<()> {
    if new_key.is_empty() {
        return Err(StorageError::Encryption("new key must not be empty".into()));
    }

    let conn = manager.get_encrypted_connection(path)?;
    rekey(&conn, new_key)?;
    drop(conn);

    let cipher = manager.cipher_config()?.with_key(new_key.clone());
    let conn = Connection::open(path)?;
    configure_sqlcipher(&conn, &cipher)?;
    verify_encryption(&conn)?;

    info!("Database rekeyed");
    Ok(())
}

/// Copy a plaintext database into a new encrypted file
///
/// `encrypted` is replaced if it exists. The plaintext file is left in place.
#[instrument(skip(manager, plain, encrypted), fields(plain = %plain.display(), encrypted = %encrypted.display()))]
pub fn encrypt_plain_database(
    manager: &EncryptionManager,
    plain: &Path,
    encrypted: &Path,
) -> StorageResult<usize> {
    let cipher = manager.cipher_config()?;
    if !plain.is_file() {
        return Err(StorageError::Connection(format!("{} does not exist", plain.display())));
    }
    for file in database_files(encrypted) {
        if file.exists() {
            warn!(file = %file.display(), "Removing existing database file");
            fs::remove_file(&file)?;
        }
    }

    let conn = Connection::open(plain)?;
    verify_encryption(&conn)?;
    let tables = list_tables(&conn)?.len();

    let key = if cipher.uses_raw_key() {
        SecureString::new(format!("x'{}'", cipher.key.expose()))
    } else {
        cipher.key.clone()
    };
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS {EXPORT_SCHEMA} KEY ?2"),
        rusqlite::params![encrypted.to_string_lossy(), key.expose()],
    )
    .map_err(|e| StorageError::Encryption(format!("Failed to attach encrypted database: {}", e)))?;

    let export = conn
        .execute_batch(&format!(
            "PRAGMA {s}.cipher_page_size = {page};\n\
             PRAGMA {s}.kdf_iter = {kdf};\n\
             PRAGMA {s}.cipher_hmac_algorithm = {hmac};\n\
             PRAGMA {s}.cipher_kdf_algorithm = {kdf_alg};",
            s = EXPORT_SCHEMA,
            page = cipher.cipher_page_size,
            kdf = cipher.kdf_iter,
            hmac = cipher.hmac_algorithm.as_pragma(),
            kdf_alg = cipher.kdf_algorithm.as_pragma(),
        ))
        .and_then(|()| {
            conn.query_row(&format!("SELECT sqlcipher_export('{EXPORT_SCHEMA}')"), [], |_| Ok(()))
        });
    let detach = conn.execute_batch(&format!("DETACH DATABASE {EXPORT_SCHEMA}"));
    export.map_err(|e| StorageError::Encryption(format!("Failed to export database: {}", e)))?;
    detach?;
    drop(conn);

    if !manager.test_encrypted_database(encrypted) {
        return Err(StorageError::Encryption("exported database does not open under the key".into()));
    }
    info!(tables, "Plaintext database encrypted");
    Ok(tables)
}

/// Open an existing file without a key; fails if it is encrypted
fn open_plain(path: &Path) -> StorageResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    verify_encryption(&conn)?;
    Ok(conn)
}

fn list_tables(conn: &Connection) -> StorageResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    //! Unit tests for database::diagnostics.
    use hidesync_domain::{Config, KeyMethod, RuntimeEnvironment};
    use tempfile::TempDir;

    use super::*;
    use crate::database::model::{ColumnDef, TableSchema};
    use crate::database::value::ColumnType;
    use crate::security::KeyManager;

    fn manager(key: Option<&str>) -> EncryptionManager {
        let mut config = Config::default();
        config.environment = RuntimeEnvironment::Test;
        config.encryption.development_key = key.map(str::to_string);
        config.encryption.kdf_iter = 4000;
        config.key_management.method = KeyMethod::Environment;
        config.key_management.key_environment_variable = "HIDESYNC_DIAGNOSTICS_TEST_UNSET".into();
        EncryptionManager::new(&config, KeyManager::from_config(&config))
    }

    fn tools_schema() -> TableSchema {
        TableSchema::new("tools")
            .column(ColumnDef::id("id"))
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
    }

    #[test]
    fn test_check_missing_database() {
        let dir = TempDir::new().unwrap();
        let report = check_database(&manager(Some("diag-key")), &dir.path().join("none.db")).unwrap();
        assert!(!report.exists);
        assert!(!report.readable);
    }

    #[test]
    fn test_check_encrypted_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diag.db");
        let manager = manager(Some("diag-key"));
        manager.create_new_encrypted_database(&path).unwrap();
        manager.create_tables_direct(&path, &[tools_schema()]).unwrap();

        let report = check_database(&manager, &path).unwrap();
        assert!(report.exists);
        assert!(report.encrypted);
        assert!(report.is_healthy());
        assert_eq!(report.tables, vec!["tools".to_string()]);
        assert!(report.size_bytes > 0);
    }

    #[test]
    fn test_check_with_wrong_key_reports_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diag.db");
        manager(Some("right-key")).create_new_encrypted_database(&path).unwrap();

        let report = check_database(&manager(Some("wrong-key")), &path).unwrap();
        assert!(report.exists);
        assert!(!report.readable);
        assert!(report.error.is_some());
    }

    #[test]
    fn test_rekey_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diag.db");
        let old = manager(Some("old-key"));
        old.create_new_encrypted_database(&path).unwrap();

        rekey_database(&old, &path, &SecureString::from("new-key")).unwrap();

        assert!(!old.test_encrypted_database(&path));
        assert!(manager(Some("new-key")).test_encrypted_database(&path));
    }

    #[test]
    fn test_encrypt_plain_database() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain.db");
        let encrypted = dir.path().join("encrypted.db");
        {
            let conn = Connection::open(&plain).unwrap();
            conn.execute_batch(
                "CREATE TABLE tools (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO tools (name) VALUES ('awl'), ('edge beveler');",
            )
            .unwrap();
        }

        let manager = manager(Some("export-key"));
        assert_eq!(encrypt_plain_database(&manager, &plain, &encrypted).unwrap(), 1);

        let conn = manager.get_encrypted_connection(&encrypted).unwrap();
        let count: i64 = conn.query_row("SELECT count(*) FROM tools", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
        assert!(Connection::open(&encrypted)
            .unwrap()
            .query_row("SELECT count(*) FROM sqlite_master", [], |r| r.get::<_, i64>(0))
            .is_err());
    }
}

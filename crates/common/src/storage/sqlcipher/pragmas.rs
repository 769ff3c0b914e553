//! Per-connection PRAGMAs applied after the cipher profile

use std::time::Duration;

use rusqlite::Connection;

use crate::storage::error::{StorageError, StorageResult};

/// Connection-level settings shared by every pooled connection
#[derive(Debug, Clone)]
pub struct ConnectionPragmas {
    pub enable_wal: bool,
    pub enable_foreign_keys: bool,
    pub busy_timeout: Duration,
}

impl Default for ConnectionPragmas {
    fn default() -> Self {
        Self { enable_wal: false, enable_foreign_keys: true, busy_timeout: Duration::from_secs(5) }
    }
}

/// Apply connection-level pragmas
pub fn apply_connection_pragmas(conn: &Connection, pragmas: &ConnectionPragmas) -> StorageResult<()> {
    let mut pragma_sql = String::new();

    if pragmas.enable_wal {
        pragma_sql.push_str("PRAGMA journal_mode=WAL;\n");
        pragma_sql.push_str("PRAGMA wal_autocheckpoint=1000;\n");
        pragma_sql.push_str("PRAGMA synchronous=NORMAL;\n");
    }

    if pragmas.enable_foreign_keys {
        pragma_sql.push_str("PRAGMA foreign_keys=ON;\n");
    }

    if !pragma_sql.is_empty() {
        conn.execute_batch(&pragma_sql)
            .map_err(|e| StorageError::Query(format!("Failed to apply pragmas: {}", e)))?;
    }

    conn.busy_timeout(pragmas.busy_timeout)
        .map_err(|e| StorageError::Query(format!("Failed to set busy timeout: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    //! Unit tests for storage::sqlcipher::pragmas.
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_apply_pragmas() {
        let temp_dir = TempDir::new().unwrap();
        let conn = Connection::open(temp_dir.path().join("test.db")).unwrap();
        let pragmas = ConnectionPragmas { enable_wal: true, ..ConnectionPragmas::default() };

        apply_connection_pragmas(&conn, &pragmas).unwrap();

        let journal_mode: String =
            conn.pragma_query_value(None, "journal_mode", |row| row.get(0)).unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let foreign_keys: i32 =
            conn.pragma_query_value(None, "foreign_keys", |row| row.get(0)).unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn test_defaults_leave_journal_mode() {
        let conn = Connection::open_in_memory().unwrap();
        apply_connection_pragmas(&conn, &ConnectionPragmas::default()).unwrap();
        let foreign_keys: i32 =
            conn.pragma_query_value(None, "foreign_keys", |row| row.get(0)).unwrap();
        assert_eq!(foreign_keys, 1);
    }
}

//! SQLCipher encryption manager
//!
//! Owns the resolved database key and the cipher profile. State is loaded
//! once by [`EncryptionManager::initialize`]; later calls are no-ops. When
//! encryption is mandatory a missing key or a driver without cipher support
//! fails initialization, otherwise the manager reports encryption as
//! disabled and callers fall back to plain SQLite.

use std::fs;
use std::path::{Path, PathBuf};

use hidesync_common::security::SecureString;
use hidesync_common::storage::{
    apply_connection_pragmas, configure_sqlcipher, sqlcipher_version, verify_encryption,
    ConnectionPragmas, SqlCipherConfig, StorageError, StorageResult,
};
use hidesync_domain::Config;
use once_cell::sync::OnceCell;
use rusqlite::Connection;
use tracing::{debug, error, info, instrument, warn};

use super::model::TableSchema;
use super::pool::{
    connection_pragmas, EncryptedConnectionFactory, EnhancedConnectionPool, PoolOptions,
};
use crate::security::KeyManager;

const PROBE_TABLE: &str = "_hidesync_probe";

struct EncryptionState {
    key: Option<SecureString>,
    sqlcipher_version: Option<String>,
}

/// Key, driver detection and raw encrypted connections
pub struct EncryptionManager {
    key_manager: KeyManager,
    use_sqlcipher: bool,
    mandatory: bool,
    cipher_page_size: u32,
    kdf_iter: u32,
    pragmas: ConnectionPragmas,
    state: OnceCell<EncryptionState>,
}

impl std::fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("use_sqlcipher", &self.use_sqlcipher)
            .field("mandatory", &self.mandatory)
            .field("initialized", &self.state.get().is_some())
            .field("enabled", &self.is_encryption_enabled())
            .finish()
    }
}

impl EncryptionManager {
    pub fn new(config: &Config, key_manager: KeyManager) -> Self {
        Self {
            key_manager,
            use_sqlcipher: config.encryption.use_sqlcipher,
            mandatory: config.encryption_mandatory(),
            cipher_page_size: config.encryption.cipher_page_size,
            kdf_iter: config.encryption.kdf_iter,
            pragmas: connection_pragmas(&config.database),
            state: OnceCell::new(),
        }
    }

    /// Load the key and detect the driver
    ///
    /// Idempotent: the first successful call fixes the state.
    ///
    /// # Errors
    /// Fails when encryption is mandatory and either no key was resolved or
    /// the linked SQLite has no cipher support, and on any key-source
    /// security violation.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> StorageResult<()> {
        self.state.get_or_try_init(|| self.load_state()).map(|_| ())
    }

    fn load_state(&self) -> StorageResult<EncryptionState> {
        if !self.use_sqlcipher {
            if self.mandatory {
                return Err(StorageError::Encryption(
                    "encryption is mandatory but SQLCipher is disabled".into(),
                ));
            }
            info!("SQLCipher disabled, database will not be encrypted");
            return Ok(EncryptionState { key: None, sqlcipher_version: None });
        }

        let version = sqlcipher_version();
        if version.is_none() {
            if self.mandatory {
                error!("SQLCipher support missing from the SQLite driver");
                return Err(StorageError::Encryption(
                    "encryption is mandatory but the SQLite driver has no cipher support".into(),
                ));
            }
            warn!("SQLite driver has no cipher support, continuing unencrypted");
        }

        let key = self.key_manager.get_database_encryption_key()?;
        let key = (!key.is_empty()).then_some(key);
        if key.is_none() && self.mandatory {
            return Err(StorageError::Encryption(
                "encryption is mandatory but no database key is available".into(),
            ));
        }

        info!(
            sqlcipher_version = version.as_deref().unwrap_or("none"),
            key_loaded = key.is_some(),
            method = %self.key_manager.method(),
            "Encryption manager initialized"
        );
        Ok(EncryptionState { key, sqlcipher_version: version })
    }

    /// Whether encrypted connections can be opened
    pub fn is_encryption_enabled(&self) -> bool {
        self.state.get().is_some_and(|s| s.key.is_some() && s.sqlcipher_version.is_some())
    }

    pub fn sqlcipher_version(&self) -> Option<&str> {
        self.state.get().and_then(|s| s.sqlcipher_version.as_deref())
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.key_manager
    }

    /// Cipher profile carrying the loaded key
    pub fn cipher_config(&self) -> StorageResult<SqlCipherConfig> {
        self.initialize()?;
        match self.state.get().and_then(|s| s.key.as_ref()) {
            Some(key) if self.is_encryption_enabled() => Ok(SqlCipherConfig::new(key.clone())
                .with_page_size(self.cipher_page_size)
                .with_kdf_iter(self.kdf_iter)),
            _ => Err(StorageError::Encryption("database encryption is not enabled".into())),
        }
    }

    /// Connection factory for a pool over `path`
    pub fn connection_factory(
        &self,
        path: impl Into<PathBuf>,
    ) -> StorageResult<EncryptedConnectionFactory> {
        let factory = EncryptedConnectionFactory::new(path, self.cipher_config()?);
        Ok(factory.with_pragmas(self.pragmas.clone()))
    }

    /// Pool of encrypted connections to `path`
    pub fn create_pool(
        &self,
        path: impl Into<PathBuf>,
        options: PoolOptions,
    ) -> StorageResult<EnhancedConnectionPool> {
        EnhancedConnectionPool::new(self.connection_factory(path)?, options)
    }

    /// Open a keyed connection and check the key against the first page
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn get_encrypted_connection(&self, path: &Path) -> StorageResult<Connection> {
        let cipher = self.cipher_config()?;
        let conn = Connection::open(path).map_err(|e| {
            StorageError::Connection(format!("Failed to open {}: {}", path.display(), e))
        })?;
        configure_sqlcipher(&conn, &cipher)?;
        verify_encryption(&conn)?;
        apply_connection_pragmas(&conn, &self.pragmas)?;
        Ok(conn)
    }

    /// Replace whatever is at `path` with a fresh encrypted database
    ///
    /// Writes and drops a probe table so the file is proven writable under
    /// the key before returning.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn create_new_encrypted_database(&self, path: &Path) -> StorageResult<()> {
        let cipher = self.cipher_config()?;

        for file in database_files(path) {
            if file.exists() {
                warn!(file = %file.display(), "Removing existing database file");
                fs::remove_file(&file)?;
            }
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        configure_sqlcipher(&conn, &cipher)?;
        conn.execute_batch(&format!(
            "CREATE TABLE {PROBE_TABLE} (id INTEGER PRIMARY KEY, value TEXT);\n\
             INSERT INTO {PROBE_TABLE} (value) VALUES ('ok');\n\
             DROP TABLE {PROBE_TABLE};"
        ))
        .map_err(|e| StorageError::Encryption(format!("Failed to write encrypted database: {}", e)))?;
        verify_encryption(&conn)?;

        info!("Created new encrypted database");
        Ok(())
    }

    /// Whether the file at `path` opens under the current key
    ///
    /// Never fails: a wrong key, a plaintext file or corruption all yield
    /// `false`.
    pub fn test_encrypted_database(&self, path: &Path) -> bool {
        if !path.is_file() {
            debug!(path = %path.display(), "No database file to test");
            return false;
        }

        match self.get_encrypted_connection(path).and_then(|conn| {
            conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
                .map_err(StorageError::from)
        }) {
            Ok(objects) => {
                debug!(path = %path.display(), objects, "Encrypted database opened");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Encrypted database test failed");
                false
            }
        }
    }

    /// Run `CREATE TABLE IF NOT EXISTS` for every schema in one transaction
    #[instrument(skip(self, path, schemas), fields(path = %path.display(), tables = schemas.len()))]
    pub fn create_tables_direct(&self, path: &Path, schemas: &[TableSchema]) -> StorageResult<usize> {
        let mut conn = self.get_encrypted_connection(path)?;
        let tx = conn.transaction()?;
        for schema in schemas {
            debug!(table = %schema.name, "Creating table");
            tx.execute_batch(&schema.create_sql())?;
        }
        tx.commit()?;

        info!(tables = schemas.len(), "Tables created on encrypted database");
        Ok(schemas.len())
    }
}

/// The database file and its WAL/shared-memory companions
pub(crate) fn database_files(path: &Path) -> [PathBuf; 3] {
    let with_suffix = |suffix: &str| {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    };
    [path.to_path_buf(), with_suffix("-wal"), with_suffix("-shm")]
}

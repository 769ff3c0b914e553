//! SQLCipher configuration
//!
//! Key application order matters: `PRAGMA key` first, then the cipher
//! profile, then a read of `sqlite_master`. SQLCipher only checks the key when
//! the first page is decrypted, so without the probe a wrong key would surface
//! on some later, unrelated query.

use std::fmt;

use rusqlite::Connection;
use tracing::{debug, error};

use crate::security::{is_raw_hex_key, SecureString};
use crate::storage::error::{StorageError, StorageResult};

/// HMAC algorithm for page authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HmacAlgorithm {
    pub fn as_pragma(self) -> &'static str {
        match self {
            Self::Sha1 => "HMAC_SHA1",
            Self::Sha256 => "HMAC_SHA256",
            Self::Sha512 => "HMAC_SHA512",
        }
    }
}

/// Key derivation algorithm applied to passphrases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl KdfAlgorithm {
    pub fn as_pragma(self) -> &'static str {
        match self {
            Self::Sha1 => "PBKDF2_HMAC_SHA1",
            Self::Sha256 => "PBKDF2_HMAC_SHA256",
            Self::Sha512 => "PBKDF2_HMAC_SHA512",
        }
    }
}

/// SQLCipher configuration
#[derive(Clone)]
pub struct SqlCipherConfig {
    /// Encryption key (passphrase, or 64 hex characters for a raw key)
    pub key: SecureString,

    /// Page size in bytes (default: 4096)
    pub cipher_page_size: u32,

    /// PBKDF2 iterations (default: 256000)
    pub kdf_iter: u32,

    /// Page HMAC (default: HMAC_SHA512)
    pub hmac_algorithm: HmacAlgorithm,

    /// Passphrase KDF (default: PBKDF2_HMAC_SHA512)
    pub kdf_algorithm: KdfAlgorithm,
}

impl fmt::Debug for SqlCipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlCipherConfig")
            .field("key", &"SecureString(***)")
            .field("cipher_page_size", &self.cipher_page_size)
            .field("kdf_iter", &self.kdf_iter)
            .field("hmac_algorithm", &self.hmac_algorithm)
            .field("kdf_algorithm", &self.kdf_algorithm)
            .finish()
    }
}

impl SqlCipherConfig {
    /// HideSync cipher profile with the given key
    pub fn new(key: impl Into<SecureString>) -> Self {
        Self {
            key: key.into(),
            cipher_page_size: 4096,
            kdf_iter: 256_000,
            hmac_algorithm: HmacAlgorithm::Sha512,
            kdf_algorithm: KdfAlgorithm::Sha512,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.cipher_page_size = page_size;
        self
    }

    pub fn with_kdf_iter(mut self, iterations: u32) -> Self {
        self.kdf_iter = iterations;
        self
    }

    /// Same profile with a different key, used for rekeying
    pub fn with_key(&self, key: impl Into<SecureString>) -> Self {
        Self { key: key.into(), ..self.clone() }
    }

    /// Whether the key will be applied as a raw 256-bit key
    pub fn uses_raw_key(&self) -> bool {
        is_raw_hex_key(self.key.expose())
    }

    fn profile_sql(&self) -> String {
        format!(
            "PRAGMA cipher_page_size = {};\n\
             PRAGMA kdf_iter = {};\n\
             PRAGMA cipher_hmac_algorithm = {};\n\
             PRAGMA cipher_kdf_algorithm = {};",
            self.cipher_page_size,
            self.kdf_iter,
            self.hmac_algorithm.as_pragma(),
            self.kdf_algorithm.as_pragma()
        )
    }
}

/// Apply `PRAGMA key` (or `rekey`) in raw or passphrase form
fn apply_key(conn: &Connection, pragma: &str, key: &SecureString) -> rusqlite::Result<()> {
    if is_raw_hex_key(key.expose()) {
        // Hex digits only, safe to inline.
        conn.execute_batch(&format!("PRAGMA {} = \"x'{}'\";", pragma, key.expose()))
    } else {
        conn.pragma_update(None, pragma, key.expose())
    }
}

/// Configure SQLCipher for a freshly opened connection
///
/// Must run before anything else touches the database. Does not verify the
/// key; call [`verify_encryption`] afterwards.
pub fn configure_sqlcipher(conn: &Connection, config: &SqlCipherConfig) -> StorageResult<()> {
    let start = std::time::Instant::now();

    apply_key(conn, "key", &config.key).map_err(|e| {
        error!(error = %e, "SQLCipher key setup failed");
        if is_wrong_key_error(&e) {
            StorageError::WrongKeyOrNotEncrypted
        } else {
            StorageError::Encryption(format!("Failed to set encryption key: {}", e))
        }
    })?;

    conn.execute_batch(&config.profile_sql()).map_err(|e| {
        error!(error = %e, "Failed to apply cipher profile");
        StorageError::Encryption(format!("Failed to apply cipher profile: {}", e))
    })?;

    debug!(
        duration_ms = start.elapsed().as_millis() as u64,
        raw_key = config.uses_raw_key(),
        "SQLCipher configuration applied"
    );

    Ok(())
}

/// Whether a driver error means the key is wrong or the file is not encrypted
pub fn is_wrong_key_error(err: &rusqlite::Error) -> bool {
    if matches!(err.sqlite_error_code(), Some(rusqlite::ErrorCode::NotADatabase)) {
        return true;
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("file is not a database")
        || msg.contains("file is encrypted")
        || msg.contains("database disk image is malformed")
        || msg.contains("notadb")
}

/// Force a page read to check the key
///
/// Returns `WrongKeyOrNotEncrypted` if the key does not decrypt the file.
pub fn verify_encryption(conn: &Connection) -> StorageResult<()> {
    let result = conn
        .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .map_err(|e| {
            if is_wrong_key_error(&e) {
                StorageError::WrongKeyOrNotEncrypted
            } else {
                StorageError::from(e)
            }
        });

    match &result {
        Ok(()) => debug!("Encryption verification successful"),
        Err(e) => error!(error = %e, "Encryption verification failed"),
    }

    result
}

/// Re-encrypt an open, keyed database under a new key
pub fn rekey(conn: &Connection, new_key: &SecureString) -> StorageResult<()> {
    apply_key(conn, "rekey", new_key)
        .map_err(|e| StorageError::Encryption(format!("Failed to rekey database: {}", e)))
}

/// SQLCipher library version, or `None` when the linked SQLite has no cipher
/// support
pub fn sqlcipher_version() -> Option<String> {
    let conn = Connection::open_in_memory().ok()?;
    conn.query_row("PRAGMA cipher_version", [], |row| row.get::<_, String>(0))
        .ok()
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    //! Unit tests for storage::sqlcipher::cipher.
    use rusqlite::Connection;
    use tempfile::TempDir;

    use super::*;

    const TEST_KEY: &str = "test_passphrase_for_hidesync_unit_tests";

    #[test]
    fn test_profile_defaults() {
        let config = SqlCipherConfig::new(TEST_KEY);
        assert_eq!(config.cipher_page_size, 4096);
        assert_eq!(config.kdf_iter, 256_000);
        assert_eq!(config.hmac_algorithm.as_pragma(), "HMAC_SHA512");
        assert_eq!(config.kdf_algorithm.as_pragma(), "PBKDF2_HMAC_SHA512");
        assert!(!config.uses_raw_key());
    }

    #[test]
    fn test_debug_hides_key() {
        let rendered = format!("{:?}", SqlCipherConfig::new(TEST_KEY));
        assert!(!rendered.contains(TEST_KEY));
    }

    #[test]
    fn test_sqlcipher_is_linked() {
        assert!(sqlcipher_version().is_some());
    }

    #[test]
    fn test_configure_and_verify() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let conn = Connection::open(&db_path).unwrap();
        let config = SqlCipherConfig::new(TEST_KEY).with_kdf_iter(4000);
        configure_sqlcipher(&conn, &config).unwrap();
        verify_encryption(&conn).unwrap();
    }

    /// A raw hex key opens the database it created.
    #[test]
    fn test_raw_hex_key() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("raw.db");
        let config = SqlCipherConfig::new("ab".repeat(32));
        assert!(config.uses_raw_key());

        {
            let conn = Connection::open(&db_path).unwrap();
            configure_sqlcipher(&conn, &config).unwrap();
            conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", []).unwrap();
        }

        let conn = Connection::open(&db_path).unwrap();
        configure_sqlcipher(&conn, &config).unwrap();
        verify_encryption(&conn).unwrap();
    }

    #[test]
    fn test_wrong_encryption_key() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        {
            let conn = Connection::open(&db_path).unwrap();
            configure_sqlcipher(&conn, &SqlCipherConfig::new(TEST_KEY).with_kdf_iter(4000))
                .unwrap();
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", []).unwrap();
        }

        let conn = Connection::open(&db_path).unwrap();
        configure_sqlcipher(&conn, &SqlCipherConfig::new("wrong key").with_kdf_iter(4000))
            .unwrap();
        let result = verify_encryption(&conn);
        assert!(matches!(result, Err(StorageError::WrongKeyOrNotEncrypted)));
    }

    #[test]
    fn test_rekey() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("rekey.db");
        let old = SqlCipherConfig::new(TEST_KEY).with_kdf_iter(4000);
        let new = old.with_key("replacement passphrase");

        {
            let conn = Connection::open(&db_path).unwrap();
            configure_sqlcipher(&conn, &old).unwrap();
            conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", []).unwrap();
            rekey(&conn, &new.key).unwrap();
        }

        let conn = Connection::open(&db_path).unwrap();
        configure_sqlcipher(&conn, &new).unwrap();
        verify_encryption(&conn).unwrap();
    }
}

//! Storage constants
//!
//! Defaults for the connection pool and query layer, and the SQLCipher
//! profile every encrypted HideSync database is created with.

// Database
pub const DEFAULT_DATABASE_PATH: &str = "hidesync.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// Connection pool
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_MAX_OVERFLOW: usize = 10;
pub const DEFAULT_POOL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_POOL_RECYCLE_SECS: u64 = 3_600;
pub const DEFAULT_MAX_IDLE_SECS: u64 = 300;
pub const DEFAULT_MAX_USAGE: u64 = 1_000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u64 = 5;
pub const DEFAULT_CIRCUIT_RESET_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

// Query layer
pub const DEFAULT_QUERY_LIMIT: usize = 10_000;
pub const DEFAULT_FETCH_BATCH_SIZE: usize = 500;

// SQLCipher profile (changing these makes existing files unreadable)
pub const CIPHER_PAGE_SIZE: u32 = 4_096;
pub const CIPHER_KDF_ITER: u32 = 256_000;
pub const CIPHER_HMAC_ALGORITHM: &str = "HMAC_SHA512";
pub const CIPHER_KDF_ALGORITHM: &str = "PBKDF2_HMAC_SHA512";

// Key management
pub const DEFAULT_KEY_FILE_PATH: &str = "/etc/hidesync/keys/db.key";
pub const DEFAULT_KEY_ENV_VAR: &str = "HIDESYNC_DB_KEY";
pub const DEFAULT_KEYCHAIN_SERVICE: &str = "HideSync.database";
pub const DEFAULT_KEYCHAIN_ACCOUNT: &str = "db_encryption_key";

//! Configuration tree for the storage stack
//!
//! Every section deserializes with defaults, so a file only needs the keys it
//! overrides. Loading from the environment lives in `hidesync-infra`.

use serde::{Deserialize, Serialize};

use crate::constants::{
    CIPHER_KDF_ITER, CIPHER_PAGE_SIZE, DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_CIRCUIT_RESET_TIMEOUT_SECS,
    DEFAULT_CONNECT_RETRIES, DEFAULT_DATABASE_PATH, DEFAULT_FETCH_BATCH_SIZE,
    DEFAULT_HEALTH_CHECK_INTERVAL_SECS, DEFAULT_KEYCHAIN_ACCOUNT, DEFAULT_KEYCHAIN_SERVICE,
    DEFAULT_KEY_ENV_VAR, DEFAULT_KEY_FILE_PATH, DEFAULT_MAX_CONSECUTIVE_ERRORS,
    DEFAULT_MAX_IDLE_SECS, DEFAULT_MAX_OVERFLOW, DEFAULT_MAX_USAGE, DEFAULT_POOL_RECYCLE_SECS,
    DEFAULT_POOL_SIZE, DEFAULT_POOL_TIMEOUT_SECS, DEFAULT_QUERY_LIMIT, DEFAULT_RETRY_BASE_DELAY_MS,
};
use crate::{impl_config_enum, HideSyncError, Result};

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Production,
    Test,
}

impl_config_enum!(RuntimeEnvironment {
    Development => "development",
    Production => "production",
    Test => "test",
});

/// Where the database key comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMethod {
    #[default]
    File,
    Environment,
    Keychain,
    Aws,
    Azure,
    Gcp,
}

impl_config_enum!(KeyMethod {
    File => "file",
    Environment => "environment",
    Keychain => "keychain",
    Aws => "aws",
    Azure => "azure",
    Gcp => "gcp",
});

impl KeyMethod {
    /// Methods that fetch from a remote secret manager
    pub fn is_cloud(&self) -> bool {
        matches!(self, Self::Aws | Self::Azure | Self::Gcp)
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: RuntimeEnvironment,
    pub database: DatabaseConfig,
    pub encryption: EncryptionConfig,
    pub key_management: KeyManagementConfig,
    pub pool: PoolConfig,
    pub query: QueryConfig,
}

/// Database file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub enable_wal: bool,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_DATABASE_PATH.to_string(),
            enable_wal: false,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// SQLCipher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Use the encrypted session path
    pub use_sqlcipher: bool,
    /// Refuse to start without a key and a cipher-capable driver
    pub require_encryption: bool,
    /// Explicit key for development; ignored in production
    #[serde(skip_serializing)]
    pub development_key: Option<String>,
    pub cipher_page_size: u32,
    pub kdf_iter: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            use_sqlcipher: true,
            require_encryption: false,
            development_key: None,
            cipher_page_size: CIPHER_PAGE_SIZE,
            kdf_iter: CIPHER_KDF_ITER,
        }
    }
}

/// Key resolution parameters, one group per method
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyManagementConfig {
    pub method: KeyMethod,
    pub key_file_path: String,
    pub enforce_key_file_permissions: bool,
    pub key_environment_variable: String,
    pub keychain_service: String,
    pub keychain_account: String,
    pub aws_secret_name: Option<String>,
    pub aws_region: Option<String>,
    pub azure_vault_url: Option<String>,
    pub azure_secret_name: Option<String>,
    pub gcp_project_id: Option<String>,
    pub gcp_secret_id: Option<String>,
    /// Field to extract when a cloud secret is a JSON object
    pub secret_json_field: Option<String>,
}

impl Default for KeyManagementConfig {
    fn default() -> Self {
        Self {
            method: KeyMethod::File,
            key_file_path: DEFAULT_KEY_FILE_PATH.to_string(),
            enforce_key_file_permissions: true,
            key_environment_variable: DEFAULT_KEY_ENV_VAR.to_string(),
            keychain_service: DEFAULT_KEYCHAIN_SERVICE.to_string(),
            keychain_account: DEFAULT_KEYCHAIN_ACCOUNT.to_string(),
            aws_secret_name: None,
            aws_region: None,
            azure_vault_url: None,
            azure_secret_name: None,
            gcp_project_id: None,
            gcp_secret_id: None,
            secret_json_field: None,
        }
    }
}

/// Connection pool sizing and health parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub max_overflow: usize,
    pub timeout_secs: u64,
    pub recycle_secs: u64,
    pub max_idle_secs: u64,
    pub max_usage: u64,
    pub health_check_interval_secs: u64,
    pub max_consecutive_errors: u64,
    pub circuit_reset_timeout_secs: u64,
    pub connect_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            timeout_secs: DEFAULT_POOL_TIMEOUT_SECS,
            recycle_secs: DEFAULT_POOL_RECYCLE_SECS,
            max_idle_secs: DEFAULT_MAX_IDLE_SECS,
            max_usage: DEFAULT_MAX_USAGE,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            circuit_reset_timeout_secs: DEFAULT_CIRCUIT_RESET_TIMEOUT_SECS,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

impl PoolConfig {
    /// Hard cap on open connections
    pub fn capacity(&self) -> usize {
        self.pool_size + self.max_overflow
    }
}

/// Query layer limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Row cap applied to `all()` without an explicit limit
    pub default_limit: usize,
    /// Rows read from the cursor per batch
    pub batch_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { default_limit: DEFAULT_QUERY_LIMIT, batch_size: DEFAULT_FETCH_BATCH_SIZE }
    }
}

impl Config {
    /// Reject configurations the pool or session layer cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(HideSyncError::Config(msg.to_string()));

        if self.database.path.trim().is_empty() {
            return fail("database path must not be empty");
        }
        if self.pool.pool_size == 0 {
            return fail("pool_size must be greater than 0");
        }
        if self.pool.timeout_secs == 0 {
            return fail("pool timeout must be greater than 0");
        }
        if self.pool.max_consecutive_errors == 0 {
            return fail("max_consecutive_errors must be greater than 0");
        }
        if self.pool.circuit_reset_timeout_secs == 0 {
            return fail("circuit_reset_timeout must be greater than 0");
        }
        if self.pool.connect_retries == 0 {
            return fail("connect_retries must be greater than 0");
        }
        if self.query.batch_size == 0 {
            return fail("query batch_size must be greater than 0");
        }
        if self.query.default_limit == 0 {
            return fail("query default_limit must be greater than 0");
        }
        Ok(())
    }

    /// Whether a missing key is fatal
    pub fn encryption_mandatory(&self) -> bool {
        self.encryption.require_encryption || self.environment == RuntimeEnvironment::Production
    }
}

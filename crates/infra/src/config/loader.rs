//! Configuration loader
//!
//! Loads the storage configuration from a file and/or environment variables.
//!
//! ## Loading Strategy
//! 1. If `HIDESYNC_CONFIG` names a file, that file is the base configuration
//! 2. Otherwise the standard locations are probed for a config file
//! 3. With no file, the built-in defaults are the base
//! 4. Environment variables are applied on top of the base
//! 5. The result is validated
//!
//! Missing variables keep the base value. A variable that is set but cannot
//! be parsed is a configuration error, never silently ignored.
//!
//! ## Environment Variables
//! - `ENVIRONMENT`: `development` | `production` | `test`
//! - `DATABASE_PATH`, `DATABASE_ENABLE_WAL`
//! - `USE_SQLCIPHER`, `REQUIRE_ENCRYPTION`, `DATABASE_ENCRYPTION_KEY`
//! - `KEY_MANAGEMENT_METHOD`: `file` | `environment` | `keychain` | `aws` |
//!   `azure` | `gcp`
//! - `KEY_FILE_PATH`, `ENFORCE_KEY_FILE_PERMISSIONS`,
//!   `KEY_ENVIRONMENT_VARIABLE`, `KEYCHAIN_SERVICE`, `KEYCHAIN_ACCOUNT`
//! - `AWS_SECRET_NAME`, `AWS_REGION`, `AZURE_VAULT_URL`, `AZURE_SECRET_NAME`,
//!   `GCP_PROJECT_ID`, `GCP_SECRET_ID`, `SECRET_JSON_FIELD`
//! - `DB_POOL_SIZE`, `DB_MAX_OVERFLOW`, `DB_POOL_TIMEOUT`, `DB_POOL_RECYCLE`,
//!   `DB_MAX_IDLE_TIME`, `DB_MAX_USAGE`, `DB_HEALTH_CHECK_INTERVAL`,
//!   `DB_MAX_CONSECUTIVE_ERRORS`, `DB_CIRCUIT_RESET_TIMEOUT`,
//!   `DB_CONNECT_RETRIES` (durations in seconds)
//! - `DB_QUERY_DEFAULT_LIMIT`, `DB_QUERY_BATCH_SIZE`
//!
//! ## File Locations
//! The loader probes the following names (in order) in the current working
//! directory, its two parent directories, and next to the executable:
//! `hidesync.toml`, `hidesync.json`, `config.toml`, `config.json`.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use hidesync_domain::{Config, HideSyncError, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "HIDESYNC_CONFIG";

const CONFIG_FILE_NAMES: &[&str] = &["hidesync.toml", "hidesync.json", "config.toml", "config.json"];

/// Load configuration with automatic fallback strategy
///
/// # Errors
/// Returns `HideSyncError::Config` if:
/// - An explicitly named file is missing or malformed
/// - An environment variable holds a value that cannot be parsed
/// - The merged configuration fails validation
pub fn load() -> Result<Config> {
    let mut config = match std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.trim().is_empty()) {
        Some(path) => load_from_file(Some(PathBuf::from(path)))?,
        None => match probe_config_paths() {
            Some(path) => load_from_file(Some(path))?,
            None => {
                tracing::debug!("No config file found, starting from defaults");
                Config::default()
            }
        },
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;

    tracing::info!(
        environment = %config.environment,
        database = %config.database.path,
        key_method = %config.key_management.method,
        use_sqlcipher = config.encryption.use_sqlcipher,
        "Configuration loaded"
    );
    Ok(config)
}

/// Load configuration from environment variables over the built-in defaults
///
/// # Errors
/// Returns `HideSyncError::Config` for malformed values or an invalid result.
pub fn load_from_env() -> Result<Config> {
    let mut config = Config::default();
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. Supports JSON and
/// TOML (detected by file extension). Keys absent from the file keep their
/// defaults.
///
/// # Errors
/// Returns `HideSyncError::Config` if the file is missing, unreadable or
/// malformed.
pub fn load_from_file(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(HideSyncError::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            HideSyncError::Config(
                "No config file found in any of the standard locations".to_string(),
            )
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| HideSyncError::Config(format!("Failed to read config file: {}", e)))?;

    parse_config(&contents, &config_path)
}

/// Parse configuration from string content, format chosen by extension
fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| HideSyncError::Config(format!("Invalid TOML format: {}", e))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| HideSyncError::Config(format!("Invalid JSON format: {}", e))),
        _ => Err(HideSyncError::Config(format!("Unsupported config format: {}", extension))),
    }
}

/// Probe the standard locations for a configuration file
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd.clone());
        dirs.extend(cwd.ancestors().skip(1).take(2).map(Path::to_path_buf));
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            dirs.push(exe_dir.to_path_buf());
        }
    }

    dirs.iter()
        .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|path| path.is_file())
}

/// Apply every recognised environment variable to `config`
///
/// # Errors
/// Returns `HideSyncError::Config` naming the first malformed variable.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(environment) = env_parse("ENVIRONMENT")? {
        config.environment = environment;
    }

    let database = &mut config.database;
    if let Some(path) = env_string("DATABASE_PATH") {
        database.path = path;
    }
    if let Some(wal) = env_bool("DATABASE_ENABLE_WAL")? {
        database.enable_wal = wal;
    }

    let encryption = &mut config.encryption;
    if let Some(use_sqlcipher) = env_bool("USE_SQLCIPHER")? {
        encryption.use_sqlcipher = use_sqlcipher;
    }
    if let Some(require) = env_bool("REQUIRE_ENCRYPTION")? {
        encryption.require_encryption = require;
    }
    if let Some(key) = env_string("DATABASE_ENCRYPTION_KEY") {
        encryption.development_key = Some(key);
    }

    let keys = &mut config.key_management;
    if let Some(method) = env_parse("KEY_MANAGEMENT_METHOD")? {
        keys.method = method;
    }
    if let Some(path) = env_string("KEY_FILE_PATH") {
        keys.key_file_path = path;
    }
    if let Some(enforce) = env_bool("ENFORCE_KEY_FILE_PERMISSIONS")? {
        keys.enforce_key_file_permissions = enforce;
    }
    if let Some(var) = env_string("KEY_ENVIRONMENT_VARIABLE") {
        keys.key_environment_variable = var;
    }
    if let Some(service) = env_string("KEYCHAIN_SERVICE") {
        keys.keychain_service = service;
    }
    if let Some(account) = env_string("KEYCHAIN_ACCOUNT") {
        keys.keychain_account = account;
    }
    override_opt(&mut keys.aws_secret_name, "AWS_SECRET_NAME");
    override_opt(&mut keys.aws_region, "AWS_REGION");
    override_opt(&mut keys.azure_vault_url, "AZURE_VAULT_URL");
    override_opt(&mut keys.azure_secret_name, "AZURE_SECRET_NAME");
    override_opt(&mut keys.gcp_project_id, "GCP_PROJECT_ID");
    override_opt(&mut keys.gcp_secret_id, "GCP_SECRET_ID");
    override_opt(&mut keys.secret_json_field, "SECRET_JSON_FIELD");

    let pool = &mut config.pool;
    override_parsed(&mut pool.pool_size, "DB_POOL_SIZE")?;
    override_parsed(&mut pool.max_overflow, "DB_MAX_OVERFLOW")?;
    override_parsed(&mut pool.timeout_secs, "DB_POOL_TIMEOUT")?;
    override_parsed(&mut pool.recycle_secs, "DB_POOL_RECYCLE")?;
    override_parsed(&mut pool.max_idle_secs, "DB_MAX_IDLE_TIME")?;
    override_parsed(&mut pool.max_usage, "DB_MAX_USAGE")?;
    override_parsed(&mut pool.health_check_interval_secs, "DB_HEALTH_CHECK_INTERVAL")?;
    override_parsed(&mut pool.max_consecutive_errors, "DB_MAX_CONSECUTIVE_ERRORS")?;
    override_parsed(&mut pool.circuit_reset_timeout_secs, "DB_CIRCUIT_RESET_TIMEOUT")?;
    override_parsed(&mut pool.connect_retries, "DB_CONNECT_RETRIES")?;

    override_parsed(&mut config.query.default_limit, "DB_QUERY_DEFAULT_LIMIT")?;
    override_parsed(&mut config.query.batch_size, "DB_QUERY_BATCH_SIZE")?;

    Ok(())
}

/// Non-empty, trimmed value of an environment variable
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    env_string(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| HideSyncError::Config(format!("Invalid value for {}: {}", key, e)))
        })
        .transpose()
}

/// Parse boolean from environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`
/// (case-insensitive). Anything else is an error.
fn env_bool(key: &str) -> Result<Option<bool>> {
    env_string(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(HideSyncError::Config(format!(
                "Invalid value for {}: '{}' is not a boolean",
                key, raw
            ))),
        })
        .transpose()
}

fn override_opt(target: &mut Option<String>, key: &str) {
    if let Some(value) = env_string(key) {
        *target = Some(value);
    }
}

fn override_parsed<T>(target: &mut T, key: &str) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = env_parse(key)? {
        *target = value;
    }
    Ok(())
}

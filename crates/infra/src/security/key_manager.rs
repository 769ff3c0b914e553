//! Database encryption key resolution
//!
//! Resolution order:
//! 1. An explicitly configured development key, unless running in
//!    production (where it is ignored with a warning)
//! 2. The configured [`KeyMethod`]: key file, environment variable, platform
//!    keychain, or a cloud [`SecretStore`] (one registered with
//!    [`KeyManager::with_secret_store`], else the client compiled in by the
//!    `aws`/`azure`/`gcp` feature)
//!
//! The first successfully resolved key is cached for the lifetime of the
//! manager. Security violations (loose key-file permissions under
//! enforcement, a cloud method with no available store, a failed fetch) are
//! always errors. A method that simply finds nothing is fatal only when
//! encryption is mandatory; otherwise an empty key is returned and the
//! caller runs unencrypted.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hidesync_common::security::{
    generate_encryption_key, KeychainProvider, SecureString, SecurityError, SecurityResult,
};
use hidesync_domain::{Config, KeyManagementConfig, KeyMethod, RuntimeEnvironment};
use once_cell::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::cloud;
use super::secret_store::{extract_secret, SecretLocator, SecretStore};

/// Owner read/write on the key directory
#[cfg(unix)]
const KEY_DIR_MODE: u32 = 0o700;
/// Owner read-only on the key file
#[cfg(unix)]
const KEY_FILE_MODE: u32 = 0o400;
/// Group and other permission bits
#[cfg(unix)]
const GROUP_OTHER_MASK: u32 = 0o077;

/// Resolves and caches the database encryption key
pub struct KeyManager {
    settings: KeyManagementConfig,
    environment: RuntimeEnvironment,
    development_key: Option<SecureString>,
    mandatory: bool,
    secret_stores: HashMap<KeyMethod, Arc<dyn SecretStore>>,
    builtin_store: OnceCell<Option<Arc<dyn SecretStore>>>,
    cached: OnceCell<SecureString>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("method", &self.settings.method)
            .field("environment", &self.environment)
            .field("mandatory", &self.mandatory)
            .field("cached", &self.cached.get().is_some())
            .finish()
    }
}

impl KeyManager {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settings: config.key_management.clone(),
            environment: config.environment,
            development_key: config
                .encryption
                .development_key
                .as_deref()
                .map(SecureString::from)
                .filter(|k| !k.is_empty()),
            mandatory: config.encryption_mandatory(),
            secret_stores: HashMap::new(),
            builtin_store: OnceCell::new(),
            cached: OnceCell::new(),
        }
    }

    /// Register the client used for a cloud key method
    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_stores.insert(store.provider(), store);
        self
    }

    pub fn method(&self) -> KeyMethod {
        self.settings.method
    }

    /// Whether a missing key is fatal
    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// Resolve the database key, caching the first non-empty result
    ///
    /// # Errors
    /// - `SecurityError::InsecurePermissions` when the key file is readable
    ///   by group/other and enforcement is on
    /// - `SecurityError::ProviderUnavailable` / `SecretFetch` for cloud
    ///   methods without a store or with a failing store
    /// - `SecurityError::KeyUnavailable` when nothing was found and
    ///   encryption is mandatory
    #[instrument(skip(self), fields(method = %self.settings.method))]
    pub fn get_database_encryption_key(&self) -> SecurityResult<SecureString> {
        if let Some(key) = self.cached.get() {
            return Ok(key.clone());
        }

        match self.resolve()? {
            Some(key) => {
                let key = self.cached.get_or_init(|| key);
                Ok(key.clone())
            }
            None if self.mandatory => Err(SecurityError::KeyUnavailable(format!(
                "no key resolved via '{}' and encryption is mandatory",
                self.settings.method
            ))),
            None => {
                warn!(
                    method = %self.settings.method,
                    "No database encryption key resolved, continuing without encryption"
                );
                Ok(SecureString::empty())
            }
        }
    }

    /// Forget the cached key so the next call resolves again
    pub fn clear_cache(&mut self) {
        self.cached.take();
    }

    fn resolve(&self) -> SecurityResult<Option<SecureString>> {
        if let Some(key) = &self.development_key {
            if self.environment == RuntimeEnvironment::Production {
                warn!("Configured development key ignored in production");
            } else {
                debug!("Using configured development key");
                return Ok(Some(key.clone()));
            }
        }

        let key = match self.settings.method {
            KeyMethod::File => self.key_from_file()?,
            KeyMethod::Environment => self.key_from_environment(),
            KeyMethod::Keychain => self.key_from_keychain()?,
            method @ (KeyMethod::Aws | KeyMethod::Azure | KeyMethod::Gcp) => {
                self.key_from_secret_store(method)?
            }
        };

        Ok(key.filter(|k| !k.is_empty()))
    }

    fn key_from_file(&self) -> SecurityResult<Option<SecureString>> {
        let path = Path::new(&self.settings.key_file_path);

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Key file not found");
                return Ok(None);
            }
            Err(err) => return Err(SecurityError::Io(err)),
        };

        if !metadata.is_file() {
            return Err(SecurityError::NotARegularFile(path.to_path_buf()));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mode = metadata.permissions().mode() & 0o777;
            if mode & GROUP_OTHER_MASK != 0 {
                if self.settings.enforce_key_file_permissions {
                    return Err(SecurityError::InsecurePermissions {
                        path: path.to_path_buf(),
                        mode,
                    });
                }
                warn!(
                    path = %path.display(),
                    mode = %format!("{:o}", mode),
                    "Key file is readable by group or others"
                );
            }
        }

        let contents = fs::read_to_string(path)?;
        let key = SecureString::new(contents).trimmed();
        debug!(path = %path.display(), "Key loaded from file");
        Ok(Some(key))
    }

    fn key_from_environment(&self) -> Option<SecureString> {
        let var = &self.settings.key_environment_variable;
        match std::env::var(var) {
            Ok(value) => Some(SecureString::new(value).trimmed()),
            Err(_) => {
                warn!(variable = %var, "Key environment variable is not set");
                None
            }
        }
    }

    fn key_from_keychain(&self) -> SecurityResult<Option<SecureString>> {
        let provider = KeychainProvider::new(&self.settings.keychain_service);
        let key = provider.get_or_create_key(&self.settings.keychain_account)?;
        debug!(service = %provider.service_name(), "Key loaded from keychain");
        Ok(Some(key))
    }

    /// Registered store for `method`, else the compiled-in client
    fn secret_store(&self, method: KeyMethod) -> SecurityResult<Arc<dyn SecretStore>> {
        if let Some(store) = self.secret_stores.get(&method) {
            return Ok(Arc::clone(store));
        }
        self.builtin_store
            .get_or_try_init(|| cloud::default_store(method, &self.settings))?
            .clone()
            .ok_or_else(|| SecurityError::ProviderUnavailable(method.as_str().to_string()))
    }

    fn key_from_secret_store(&self, method: KeyMethod) -> SecurityResult<Option<SecureString>> {
        let store = self.secret_store(method)?;

        let locator = SecretLocator::from_config(method, &self.settings)?;
        let raw = store.fetch_secret(&locator)?;
        let key = extract_secret(method, &raw, self.settings.secret_json_field.as_deref())?;
        info!(provider = %method, secret = %locator.name, "Key fetched from secret store");
        Ok(Some(key))
    }

    /// Write a key file at the configured path
    ///
    /// See [`create_key_file_at`](Self::create_key_file_at).
    pub fn create_key_file(&self, key: Option<SecureString>) -> SecurityResult<SecureString> {
        Self::create_key_file_at(Path::new(&self.settings.key_file_path), key)
    }

    /// Write `key` (or a freshly generated 256-bit hex key) to `path`
    ///
    /// A missing parent directory is created owner-only; the file ends up
    /// owner read-only. An existing file at `path` is replaced.
    #[instrument(skip(key), fields(path = %path.display()))]
    pub fn create_key_file_at(
        path: &Path,
        key: Option<SecureString>,
    ) -> SecurityResult<SecureString> {
        let key = key.filter(|k| !k.is_empty()).unwrap_or_else(generate_encryption_key);
        let failure = |message: String| SecurityError::KeyFileCreation {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| failure(format!("cannot create directory: {e}")))?;
                #[cfg(unix)]
                set_mode(parent, KEY_DIR_MODE)
                    .map_err(|e| failure(format!("cannot secure directory: {e}")))?;
            }
        }

        if path.exists() {
            fs::remove_file(path).map_err(|e| failure(format!("cannot replace file: {e}")))?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(|e| failure(format!("cannot create: {e}")))?;
        file.write_all(key.expose().as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| failure(format!("cannot write: {e}")))?;
        drop(file);

        #[cfg(unix)]
        set_mode(path, KEY_FILE_MODE).map_err(|e| failure(format!("cannot secure file: {e}")))?;

        info!(path = %path.display(), "Key file created");
        Ok(key)
    }

    /// Path of the configured key file
    pub fn key_file_path(&self) -> PathBuf {
        PathBuf::from(&self.settings.key_file_path)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    //! Unit tests for security::key_manager.
    use hidesync_domain::Config;
    use tempfile::TempDir;

    use super::*;
    use crate::security::secret_store::InMemorySecretStore;

    fn file_config(path: &Path, enforce: bool) -> Config {
        let mut config = Config::default();
        config.key_management.method = KeyMethod::File;
        config.key_management.key_file_path = path.to_string_lossy().to_string();
        config.key_management.enforce_key_file_permissions = enforce;
        config
    }

    #[test]
    fn test_development_key_wins_outside_production() {
        let mut config = Config::default();
        config.encryption.development_key = Some("dev-key".into());
        config.key_management.key_file_path = "/nonexistent/db.key".into();

        let manager = KeyManager::from_config(&config);
        assert_eq!(manager.get_database_encryption_key().unwrap().expose(), "dev-key");
    }

    #[test]
    fn test_development_key_ignored_in_production() {
        let mut config = Config::default();
        config.environment = RuntimeEnvironment::Production;
        config.encryption.development_key = Some("dev-key".into());
        config.key_management.key_file_path = "/nonexistent/db.key".into();

        let manager = KeyManager::from_config(&config);
        let err = manager.get_database_encryption_key().unwrap_err();
        assert!(matches!(err, SecurityError::KeyUnavailable(_)));
    }

    #[test]
    fn test_missing_key_optional_returns_empty() {
        let config = file_config(Path::new("/nonexistent/db.key"), true);
        let manager = KeyManager::from_config(&config);
        assert!(manager.get_database_encryption_key().unwrap().is_empty());
    }

    #[test]
    fn test_missing_key_mandatory_fails() {
        let mut config = file_config(Path::new("/nonexistent/db.key"), true);
        config.encryption.require_encryption = true;
        let manager = KeyManager::from_config(&config);
        assert!(matches!(
            manager.get_database_encryption_key(),
            Err(SecurityError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn test_create_and_read_key_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("db.key");
        let manager = KeyManager::from_config(&file_config(&path, true));

        let created = manager.create_key_file(None).unwrap();
        assert_eq!(created.len(), 64);
        assert_eq!(manager.get_database_encryption_key().unwrap(), created);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
            assert_eq!(file_mode, 0o400);
            assert_eq!(dir_mode, 0o700);
        }
    }

    #[test]
    fn test_create_key_file_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.key");

        KeyManager::create_key_file_at(&path, Some("first".into())).unwrap();
        KeyManager::create_key_file_at(&path, Some("second".into())).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_key_file_contents_trimmed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.key");
        KeyManager::create_key_file_at(&path, Some("  padded-key\n".into())).unwrap();

        let manager = KeyManager::from_config(&file_config(&path, true));
        assert_eq!(manager.get_database_encryption_key().unwrap().expose(), "padded-key");
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_permissions_enforced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.key");
        fs::write(&path, "group-readable-key").unwrap();
        set_mode(&path, 0o640).unwrap();

        let manager = KeyManager::from_config(&file_config(&path, true));
        match manager.get_database_encryption_key() {
            Err(SecurityError::InsecurePermissions { mode, .. }) => assert_eq!(mode, 0o640),
            other => panic!("expected insecure permissions error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_permissions_warn_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.key");
        fs::write(&path, "world-readable-key").unwrap();
        set_mode(&path, 0o644).unwrap();

        let manager = KeyManager::from_config(&file_config(&path, false));
        assert_eq!(manager.get_database_encryption_key().unwrap().expose(), "world-readable-key");
    }

    #[test]
    fn test_directory_is_not_a_key_file() {
        let dir = TempDir::new().unwrap();
        let manager = KeyManager::from_config(&file_config(dir.path(), true));
        assert!(matches!(
            manager.get_database_encryption_key(),
            Err(SecurityError::NotARegularFile(_))
        ));
    }

    #[test]
    fn test_environment_method() {
        let mut config = Config::default();
        config.key_management.method = KeyMethod::Environment;
        config.key_management.key_environment_variable = "HIDESYNC_TEST_KM_ENV_KEY".into();

        std::env::set_var("HIDESYNC_TEST_KM_ENV_KEY", "env-key\n");
        let manager = KeyManager::from_config(&config);
        assert_eq!(manager.get_database_encryption_key().unwrap().expose(), "env-key");
        std::env::remove_var("HIDESYNC_TEST_KM_ENV_KEY");
    }

    #[cfg(feature = "azure")]
    #[test]
    fn test_builtin_store_used_when_none_registered() {
        let mut config = Config::default();
        config.key_management.method = KeyMethod::Azure;
        config.key_management.azure_secret_name = Some("db-key".into());

        let manager = KeyManager::from_config(&config);
        let err = manager.get_database_encryption_key().unwrap_err();
        assert!(matches!(err, SecurityError::SecretFetch { .. }));
        assert!(err.to_string().contains("AZURE_VAULT_URL"));
    }

    #[cfg(not(feature = "aws"))]
    #[test]
    fn test_cloud_method_without_store() {
        let mut config = Config::default();
        config.key_management.method = KeyMethod::Aws;
        config.key_management.aws_secret_name = Some("prod/hidesync".into());

        let manager = KeyManager::from_config(&config);
        assert!(matches!(
            manager.get_database_encryption_key(),
            Err(SecurityError::ProviderUnavailable(_))
        ));
    }

    #[test]
    fn test_cloud_key_is_cached() {
        let mut config = Config::default();
        config.key_management.method = KeyMethod::Aws;
        config.key_management.aws_secret_name = Some("prod/hidesync".into());
        config.key_management.secret_json_field = Some("key".into());

        let store = Arc::new(
            InMemorySecretStore::new(KeyMethod::Aws)
                .with_secret("prod/hidesync", r#"{"key": "cloud-key"}"#),
        );
        let manager = KeyManager::from_config(&config).with_secret_store(store.clone());

        assert_eq!(manager.get_database_encryption_key().unwrap().expose(), "cloud-key");
        assert_eq!(manager.get_database_encryption_key().unwrap().expose(), "cloud-key");
        assert_eq!(store.fetch_count(), 1);
    }

    #[test]
    fn test_failed_fetch_is_security_error() {
        let mut config = Config::default();
        config.key_management.method = KeyMethod::Gcp;
        config.key_management.gcp_secret_id = Some("missing".into());

        let store = Arc::new(InMemorySecretStore::new(KeyMethod::Gcp));
        let manager = KeyManager::from_config(&config).with_secret_store(store);
        assert!(matches!(
            manager.get_database_encryption_key(),
            Err(SecurityError::SecretFetch { .. })
        ));
    }
}

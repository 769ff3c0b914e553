//! Remote secret store seam
//!
//! The cloud key methods (`aws`, `azure`, `gcp`) fetch the database key
//! through a [`SecretStore`] registered on the
//! [`KeyManager`](super::KeyManager). No store is compiled in by default; a
//! deployment that uses a cloud method registers a client for it at startup,
//! and resolution fails with a `SecurityError` when none was registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use hidesync_common::security::{SecureString, SecurityError, SecurityResult};
use hidesync_domain::{KeyManagementConfig, KeyMethod};
use parking_lot::RwLock;

/// Where a secret lives inside a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretLocator {
    /// Secret name (AWS), secret name (Azure) or secret id (GCP)
    pub name: String,
    /// Region (AWS), vault URL (Azure) or project id (GCP)
    pub scope: Option<String>,
}

impl SecretLocator {
    /// Build the locator for a cloud method from the key configuration
    ///
    /// # Errors
    /// `SecurityError::SecretFetch` when the method's secret name is not
    /// configured.
    pub fn from_config(method: KeyMethod, config: &KeyManagementConfig) -> SecurityResult<Self> {
        let (name, scope, setting) = match method {
            KeyMethod::Aws => {
                (config.aws_secret_name.clone(), config.aws_region.clone(), "AWS_SECRET_NAME")
            }
            KeyMethod::Azure => (
                config.azure_secret_name.clone(),
                config.azure_vault_url.clone(),
                "AZURE_SECRET_NAME",
            ),
            KeyMethod::Gcp => {
                (config.gcp_secret_id.clone(), config.gcp_project_id.clone(), "GCP_SECRET_ID")
            }
            other => {
                return Err(SecurityError::secret_fetch(
                    other.as_str(),
                    "not a remote secret method",
                ))
            }
        };

        let name = name.filter(|n| !n.trim().is_empty()).ok_or_else(|| {
            SecurityError::secret_fetch(method.as_str(), format!("{} is not configured", setting))
        })?;

        Ok(Self { name, scope })
    }
}

/// A client for one remote secret manager
pub trait SecretStore: Send + Sync {
    /// Key method this store serves
    fn provider(&self) -> KeyMethod;

    /// Fetch the raw secret text
    fn fetch_secret(&self, locator: &SecretLocator) -> SecurityResult<SecureString>;
}

/// Turn raw secret text into a key
///
/// When `json_field` is set and the secret is a JSON object, the field's
/// string value is the key. Anything else is used as-is.
pub fn extract_secret(
    provider: KeyMethod,
    raw: &SecureString,
    json_field: Option<&str>,
) -> SecurityResult<SecureString> {
    let Some(field) = json_field else {
        return Ok(raw.trimmed());
    };

    match serde_json::from_str::<serde_json::Value>(raw.expose()) {
        Ok(serde_json::Value::Object(map)) => match map.get(field) {
            Some(serde_json::Value::String(value)) => Ok(SecureString::from(value.trim())),
            Some(_) => Err(SecurityError::secret_fetch(
                provider.as_str(),
                format!("secret field '{}' is not a string", field),
            )),
            None => Err(SecurityError::secret_fetch(
                provider.as_str(),
                format!("secret has no field '{}'", field),
            )),
        },
        _ => Ok(raw.trimmed()),
    }
}

/// Secret store backed by a map, for tests and local tooling
#[derive(Debug)]
pub struct InMemorySecretStore {
    provider: KeyMethod,
    secrets: RwLock<HashMap<String, String>>,
    fetches: AtomicUsize,
}

impl InMemorySecretStore {
    pub fn new(provider: KeyMethod) -> Self {
        Self { provider, secrets: RwLock::new(HashMap::new()), fetches: AtomicUsize::new(0) }
    }

    pub fn with_secret(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.write().insert(name.into(), value.into());
        self
    }

    /// Number of fetches served, including failed ones
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SecretStore for InMemorySecretStore {
    fn provider(&self) -> KeyMethod {
        self.provider
    }

    fn fetch_secret(&self, locator: &SecretLocator) -> SecurityResult<SecureString> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.secrets.read().get(&locator.name).map(|s| SecureString::from(s.as_str())).ok_or_else(
            || {
                SecurityError::secret_fetch(
                    self.provider.as_str(),
                    format!("secret '{}' not found", locator.name),
                )
            },
        )
    }
}

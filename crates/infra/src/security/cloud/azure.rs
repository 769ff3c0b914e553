//! Azure Key Vault client over the REST API

use hidesync_common::security::{SecureString, SecurityResult};
use hidesync_domain::KeyMethod;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::http::{client, fetch_error, get_json, token_from_env, AccessToken};
use crate::security::{SecretLocator, SecretStore};

/// Bearer token used instead of the managed identity endpoint when set
pub const TOKEN_ENV: &str = "AZURE_ACCESS_TOKEN";

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const VAULT_RESOURCE: &str = "https://vault.azure.net";
const VAULT_API_VERSION: &str = "7.4";

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

/// Reads secrets from the vault named by `AZURE_VAULT_URL`
#[derive(Debug)]
pub struct AzureKeyVaultStore {
    client: Client,
}

impl AzureKeyVaultStore {
    pub fn new() -> SecurityResult<Self> {
        Ok(Self { client: client(KeyMethod::Azure)? })
    }

    fn access_token(&self) -> SecurityResult<SecureString> {
        if let Some(token) = token_from_env(TOKEN_ENV) {
            debug!("Using Azure token from environment");
            return Ok(token);
        }
        let request = self
            .client
            .get(IMDS_TOKEN_URL)
            .query(&[("api-version", IMDS_API_VERSION), ("resource", VAULT_RESOURCE)])
            .header("Metadata", "true");
        let token: AccessToken = get_json(KeyMethod::Azure, request)?;
        Ok(SecureString::new(token.access_token))
    }
}

impl SecretStore for AzureKeyVaultStore {
    fn provider(&self) -> KeyMethod {
        KeyMethod::Azure
    }

    #[instrument(skip(self), fields(secret = %locator.name))]
    fn fetch_secret(&self, locator: &SecretLocator) -> SecurityResult<SecureString> {
        let vault = locator
            .scope
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| fetch_error(KeyMethod::Azure, "AZURE_VAULT_URL is not configured"))?;

        let token = self.access_token()?;
        let request = self
            .client
            .get(secret_url(vault, &locator.name))
            .query(&[("api-version", VAULT_API_VERSION)])
            .bearer_auth(token.expose());
        let bundle: SecretBundle = get_json(KeyMethod::Azure, request)?;
        Ok(SecureString::new(bundle.value))
    }
}

fn secret_url(vault_url: &str, name: &str) -> String {
    format!("{}/secrets/{}", vault_url.trim().trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    //! Unit tests for security::cloud::azure.
    use super::*;

    #[test]
    fn test_secret_url() {
        assert_eq!(
            secret_url("https://hidesync.vault.azure.net/", "db-key"),
            "https://hidesync.vault.azure.net/secrets/db-key"
        );
    }

    #[test]
    fn test_secret_bundle_parses() {
        let bundle: SecretBundle = serde_json::from_str(
            r#"{"value":"s3cret","id":"https://v.vault.azure.net/secrets/db-key/abc","attributes":{}}"#,
        )
        .unwrap();
        assert_eq!(bundle.value, "s3cret");
    }

    #[test]
    fn test_missing_vault_url() {
        let store = AzureKeyVaultStore::new().unwrap();
        let locator = SecretLocator { name: "db-key".into(), scope: None };
        let err = store.fetch_secret(&locator).unwrap_err();
        assert!(err.to_string().contains("AZURE_VAULT_URL"));
    }
}

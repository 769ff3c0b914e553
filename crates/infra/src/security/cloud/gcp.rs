//! Google Secret Manager client over the REST API

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hidesync_common::security::{SecureString, SecurityResult};
use hidesync_domain::KeyMethod;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::http::{client, fetch_error, get_json, token_from_env, AccessToken};
use crate::security::{SecretLocator, SecretStore};

/// Bearer token used instead of the metadata server when set
pub const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const SECRET_MANAGER_URL: &str = "https://secretmanager.googleapis.com/v1";

#[derive(Deserialize)]
struct AccessSecretVersion {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

/// Reads the latest version of a secret in `GCP_PROJECT_ID`
#[derive(Debug)]
pub struct GcpSecretManagerStore {
    client: Client,
}

impl GcpSecretManagerStore {
    pub fn new() -> SecurityResult<Self> {
        Ok(Self { client: client(KeyMethod::Gcp)? })
    }

    fn access_token(&self) -> SecurityResult<SecureString> {
        if let Some(token) = token_from_env(TOKEN_ENV) {
            debug!("Using Google token from environment");
            return Ok(token);
        }
        let request = self.client.get(METADATA_TOKEN_URL).header("Metadata-Flavor", "Google");
        let token: AccessToken = get_json(KeyMethod::Gcp, request)?;
        Ok(SecureString::new(token.access_token))
    }
}

impl SecretStore for GcpSecretManagerStore {
    fn provider(&self) -> KeyMethod {
        KeyMethod::Gcp
    }

    #[instrument(skip(self), fields(secret = %locator.name))]
    fn fetch_secret(&self, locator: &SecretLocator) -> SecurityResult<SecureString> {
        let project = locator
            .scope
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| fetch_error(KeyMethod::Gcp, "GCP_PROJECT_ID is not configured"))?;

        let token = self.access_token()?;
        let request =
            self.client.get(version_url(project.trim(), &locator.name)).bearer_auth(token.expose());
        let version: AccessSecretVersion = get_json(KeyMethod::Gcp, request)?;
        decode_payload(&version.payload)
    }
}

fn version_url(project: &str, secret: &str) -> String {
    format!("{SECRET_MANAGER_URL}/projects/{project}/secrets/{secret}/versions/latest:access")
}

fn decode_payload(payload: &SecretPayload) -> SecurityResult<SecureString> {
    let bytes = STANDARD
        .decode(payload.data.trim())
        .map_err(|e| fetch_error(KeyMethod::Gcp, format!("payload is not base64: {e}")))?;
    String::from_utf8(bytes)
        .map(SecureString::new)
        .map_err(|_| fetch_error(KeyMethod::Gcp, "payload is not UTF-8"))
}

#[cfg(test)]
mod tests {
    //! Unit tests for security::cloud::gcp.
    use super::*;

    #[test]
    fn test_version_url() {
        assert_eq!(
            version_url("hidesync-prod", "db-key"),
            "https://secretmanager.googleapis.com/v1/projects/hidesync-prod/secrets/db-key/versions/latest:access"
        );
    }

    #[test]
    fn test_decode_payload() {
        let version: AccessSecretVersion = serde_json::from_str(
            r#"{"name":"projects/1/secrets/db-key/versions/3","payload":{"data":"czNjcmV0","dataCrc32c":"1"}}"#,
        )
        .unwrap();
        assert_eq!(decode_payload(&version.payload).unwrap().expose(), "s3cret");

        let bad = SecretPayload { data: "%%%".into() };
        assert!(decode_payload(&bad).is_err());
    }

    #[test]
    fn test_missing_project() {
        let store = GcpSecretManagerStore::new().unwrap();
        let locator = SecretLocator { name: "db-key".into(), scope: None };
        let err = store.fetch_secret(&locator).unwrap_err();
        assert!(err.to_string().contains("GCP_PROJECT_ID"));
    }
}

//! Blocking HTTP helpers shared by the REST-based secret stores

use std::time::Duration;

use hidesync_common::security::{SecureString, SecurityError, SecurityResult};
use hidesync_domain::KeyMethod;
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 200;

/// OAuth token response from a metadata/identity endpoint
#[derive(Deserialize)]
pub(super) struct AccessToken {
    pub access_token: String,
}

pub(super) fn client(provider: KeyMethod) -> SecurityResult<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| fetch_error(provider, format!("cannot build HTTP client: {e}")))
}

/// Send `request` and decode a JSON body, mapping every failure to `SecretFetch`
pub(super) fn get_json<T: DeserializeOwned>(
    provider: KeyMethod,
    request: RequestBuilder,
) -> SecurityResult<T> {
    let response =
        request.send().map_err(|e| fetch_error(provider, format!("request failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(fetch_error(provider, format!("HTTP {}: {}", status, truncate(&body))));
    }
    response.json::<T>().map_err(|e| fetch_error(provider, format!("unexpected response: {e}")))
}

/// A non-empty bearer token from `var`
pub(super) fn token_from_env(var: &str) -> Option<SecureString> {
    std::env::var(var).ok().map(SecureString::new).map(|t| t.trimmed()).filter(|t| !t.is_empty())
}

pub(super) fn fetch_error(provider: KeyMethod, message: impl Into<String>) -> SecurityError {
    SecurityError::secret_fetch(provider.as_str(), message)
}

fn truncate(body: &str) -> String {
    let mut chars = body.trim().chars();
    let head: String = chars.by_ref().take(MAX_ERROR_BODY).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

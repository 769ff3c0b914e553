//! AWS Secrets Manager client

use aws_config::{BehaviorVersion, Region};
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use aws_sdk_secretsmanager::Client;
use hidesync_common::security::{SecureString, SecurityError, SecurityResult};
use hidesync_domain::KeyMethod;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, instrument};

use crate::security::{SecretLocator, SecretStore};

/// Fetches secrets with the AWS SDK default credential chain
///
/// The SDK is async; calls are driven on a private current-thread runtime,
/// so this store must not be used from inside another Tokio runtime.
pub struct AwsSecretsManagerStore {
    runtime: Runtime,
    client: Client,
}

impl std::fmt::Debug for AwsSecretsManagerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecretsManagerStore").finish_non_exhaustive()
    }
}

impl AwsSecretsManagerStore {
    /// Load the SDK configuration, overriding the region when given
    ///
    /// # Errors
    /// `SecurityError::SecretFetch` when the runtime cannot be started.
    pub fn new(region: Option<&str>) -> SecurityResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| fetch_error(format!("cannot start runtime: {e}")))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region.filter(|r| !r.trim().is_empty()) {
            loader = loader.region(Region::new(region.trim().to_string()));
        }
        let sdk_config = runtime.block_on(loader.load());
        debug!(region = ?sdk_config.region(), "AWS Secrets Manager client configured");

        Ok(Self { runtime, client: Client::new(&sdk_config) })
    }
}

impl SecretStore for AwsSecretsManagerStore {
    fn provider(&self) -> KeyMethod {
        KeyMethod::Aws
    }

    #[instrument(skip(self), fields(secret = %locator.name))]
    fn fetch_secret(&self, locator: &SecretLocator) -> SecurityResult<SecureString> {
        let output = self
            .runtime
            .block_on(self.client.get_secret_value().secret_id(&locator.name).send())
            .map_err(|e| fetch_error(DisplayErrorContext(&e).to_string()))?;

        if let Some(text) = output.secret_string() {
            return Ok(SecureString::from(text));
        }
        match output.secret_binary() {
            Some(blob) => String::from_utf8(blob.as_ref().to_vec())
                .map(SecureString::new)
                .map_err(|_| fetch_error("binary secret is not UTF-8".to_string())),
            None => Err(fetch_error(format!("secret '{}' has no value", locator.name))),
        }
    }
}

fn fetch_error(message: String) -> SecurityError {
    SecurityError::secret_fetch(KeyMethod::Aws.as_str(), message)
}

#[cfg(test)]
mod tests {
    //! Unit tests for security::cloud::aws.
    use super::*;

    #[test]
    fn test_builds_offline_with_explicit_region() {
        let store = AwsSecretsManagerStore::new(Some("eu-west-1")).unwrap();
        assert_eq!(store.provider(), KeyMethod::Aws);
    }
}

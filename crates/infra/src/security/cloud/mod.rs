//! Built-in clients for the cloud key methods
//!
//! Each provider is compiled in by its cargo feature:
//!
//! | Feature | Method  | Client |
//! |---------|---------|--------|
//! | `aws`   | `aws`   | `aws-sdk-secretsmanager` |
//! | `azure` | `azure` | Key Vault REST API, managed identity token |
//! | `gcp`   | `gcp`   | Secret Manager REST API, metadata server token |
//!
//! [`default_store`] builds the client for a method when its feature is
//! enabled. The key manager uses it when no store was registered explicitly.

use std::sync::Arc;

use hidesync_common::security::SecurityResult;
use hidesync_domain::{KeyManagementConfig, KeyMethod};
use tracing::debug;

use super::SecretStore;

#[cfg(feature = "aws")]
mod aws;
#[cfg(feature = "azure")]
mod azure;
#[cfg(feature = "gcp")]
mod gcp;
#[cfg(any(feature = "azure", feature = "gcp"))]
mod http;

#[cfg(feature = "aws")]
pub use aws::AwsSecretsManagerStore;
#[cfg(feature = "azure")]
pub use azure::AzureKeyVaultStore;
#[cfg(feature = "gcp")]
pub use gcp::GcpSecretManagerStore;

/// Build the compiled-in client for `method`
///
/// Returns `Ok(None)` when `method` is not a cloud method or its feature is
/// not enabled.
#[cfg_attr(not(feature = "aws"), allow(unused_variables))]
pub fn default_store(
    method: KeyMethod,
    settings: &KeyManagementConfig,
) -> SecurityResult<Option<Arc<dyn SecretStore>>> {
    let store: Option<Arc<dyn SecretStore>> = match method {
        #[cfg(feature = "aws")]
        KeyMethod::Aws => Some(Arc::new(AwsSecretsManagerStore::new(settings.aws_region.as_deref())?)),
        #[cfg(feature = "azure")]
        KeyMethod::Azure => Some(Arc::new(AzureKeyVaultStore::new()?)),
        #[cfg(feature = "gcp")]
        KeyMethod::Gcp => Some(Arc::new(GcpSecretManagerStore::new()?)),
        _ => None,
    };
    if store.is_some() {
        debug!(provider = %method, "Built-in secret store created");
    }
    Ok(store)
}

/// Cloud methods with a compiled-in client
pub fn available_providers() -> Vec<KeyMethod> {
    let mut providers = Vec::new();
    #[cfg(feature = "aws")]
    providers.push(KeyMethod::Aws);
    #[cfg(feature = "azure")]
    providers.push(KeyMethod::Azure);
    #[cfg(feature = "gcp")]
    providers.push(KeyMethod::Gcp);
    providers
}

#[cfg(test)]
mod tests {
    //! Unit tests for security::cloud.
    use super::*;

    #[test]
    fn test_local_methods_have_no_store() {
        let settings = KeyManagementConfig::default();
        for method in [KeyMethod::File, KeyMethod::Environment, KeyMethod::Keychain] {
            assert!(default_store(method, &settings).unwrap().is_none());
        }
    }

    #[test]
    fn test_available_providers_are_cloud_methods() {
        for method in available_providers() {
            assert!(matches!(method, KeyMethod::Aws | KeyMethod::Azure | KeyMethod::Gcp));
        }
    }

    #[cfg(not(any(feature = "aws", feature = "azure", feature = "gcp")))]
    #[test]
    fn test_no_cloud_store_without_features() {
        let settings = KeyManagementConfig::default();
        for method in [KeyMethod::Aws, KeyMethod::Azure, KeyMethod::Gcp] {
            assert!(default_store(method, &settings).unwrap().is_none());
        }
        assert!(available_providers().is_empty());
    }
}

//! Key resolution for the encrypted database

pub mod cloud;
pub mod key_manager;
pub mod secret_store;

pub use key_manager::KeyManager;
pub use secret_store::{extract_secret, InMemorySecretStore, SecretLocator, SecretStore};

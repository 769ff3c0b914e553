//! Security primitives for database key handling
//!
//! - [`SecureString`]: key material that zeroes itself on drop
//! - [`generate_encryption_key`]: 256-bit random key, hex encoded
//! - [`KeychainProvider`]: platform keychain storage via `keyring`
//! - [`SecurityError`]: failures resolving or protecting key material

pub mod error;
pub mod keychain;
pub mod keys;
pub mod secure_string;

pub use error::{SecurityError, SecurityResult};
pub use keychain::{KeychainError, KeychainProvider};
pub use keys::{generate_encryption_key, is_raw_hex_key, KEY_BYTES};
pub use secure_string::SecureString;

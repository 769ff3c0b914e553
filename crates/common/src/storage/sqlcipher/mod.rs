//! SQLCipher key and PRAGMA handling
//!
//! Every connection to an encrypted database must be configured with the same
//! cipher profile that created the file. Changing any of the profile values
//! makes existing files unreadable.

pub mod cipher;
pub mod pragmas;

pub use cipher::{
    configure_sqlcipher, is_wrong_key_error, rekey, sqlcipher_version, verify_encryption,
    HmacAlgorithm, KdfAlgorithm, SqlCipherConfig,
};
pub use pragmas::{apply_connection_pragmas, ConnectionPragmas};

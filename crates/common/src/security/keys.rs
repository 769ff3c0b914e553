//! Encryption key generation

use rand::rngs::OsRng;
use rand::RngCore;

use super::SecureString;

/// Size of a generated database key in bytes (256 bits)
pub const KEY_BYTES: usize = 32;

/// Generate a random 256-bit key encoded as 64 lowercase hex characters
///
/// Bytes come from the operating system CSPRNG and the intermediate buffer
/// is wiped before returning.
pub fn generate_encryption_key() -> SecureString {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let key = hex::encode(bytes);
    zeroize::Zeroize::zeroize(&mut bytes);
    SecureString::new(key)
}

/// True when `key` is exactly 64 hex characters and can be used as a raw key
pub fn is_raw_hex_key(key: &str) -> bool {
    key.len() == KEY_BYTES * 2 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

//! Nonces and their hashed form for replay tracking

use std::fmt;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Size of an `XChaCha20` nonce (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Size of a hashed nonce as kept by nonce stores (32 bytes).
pub const NONCE_HASH_SIZE: usize = 32;

/// A 24-byte nonce, unique per sender and key.
///
/// `Debug` does not print the bytes; nonces stay out of logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Wrap raw nonce bytes.
    pub const fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nonce(..)")
    }
}

/// Hash a nonce for storage: `HMAC-SHA256(hash_key, nonce)`.
///
/// Stores only ever see this value, so a leaked nonce history does not
/// reveal which nonces were used without the hash key.
pub fn hash_nonce(hash_key: &[u8], nonce: &Nonce) -> [u8; NONCE_HASH_SIZE] {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(hash_key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(&nonce.0);
    mac.finalize().into_bytes().into()
}

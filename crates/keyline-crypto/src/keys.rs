//! X25519 key pairs and Diffie-Hellman agreement
//!
//! Secrets are zeroized on drop. Public keys are plain 32-byte values that
//! can be copied, compared and serialized freely.

use std::fmt;

use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Size of an X25519 key (32 bytes).
pub const KEY_LEN: usize = 32;

/// X25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Wrap raw public key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a public key from a slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_LEN, actual: bytes.len() })?;
        Ok(Self(array))
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// X25519 private key. Zeroized on drop, never printed.
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Build a secret key from 32 bytes of key material.
    ///
    /// Callers supply the randomness (see `Environment` in keyline-core), so
    /// key generation is deterministic under test.
    pub fn from_bytes(mut bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        Self(secret)
    }

    /// Public half of this key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    /// X25519 agreement with `peer`.
    ///
    /// # Errors
    ///
    /// - `WeakPublicKey`: `peer` is a low-order point and the output is all
    ///   zeros. Such a secret carries no entropy and must not seed a ratchet.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&x25519_dalek::PublicKey::from(peer.0));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakPublicKey);
        }
        Ok(SharedSecret(shared.to_bytes()))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Raw X25519 output. Input to the KDF only, never used as a key directly.
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// X25519 key pair.
#[derive(Debug)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Derive a key pair from 32 bytes of secret key material.
    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = SecretKey::from_bytes(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Public half.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Private half.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Split into the private and public halves.
    pub fn into_parts(self) -> (SecretKey, PublicKey) {
        (self.secret, self.public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        let bob = KeyPair::from_secret_bytes([2u8; 32]);

        let ab = alice.secret_key().diffie_hellman(&bob.public_key()).unwrap();
        let ba = bob.secret_key().diffie_hellman(&alice.public_key()).unwrap();

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn low_order_point_is_rejected() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        let identity_point = PublicKey::from_bytes([0u8; 32]);

        let result = alice.secret_key().diffie_hellman(&identity_point);
        assert!(matches!(result, Err(CryptoError::WeakPublicKey)));
    }

    #[test]
    fn public_key_from_short_slice_fails() {
        let result = PublicKey::from_slice(&[0u8; 31]);
        assert_eq!(result, Err(CryptoError::InvalidKeyLength { expected: 32, actual: 31 }));
    }

    #[test]
    fn different_secrets_give_different_public_keys() {
        let a = KeyPair::from_secret_bytes([1u8; 32]);
        let b = KeyPair::from_secret_bytes([2u8; 32]);
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn secret_debug_is_redacted() {
        let pair = KeyPair::from_secret_bytes([9u8; 32]);
        let debug = format!("{pair:?}");
        assert!(debug.contains("SecretKey(..)"));
    }
}

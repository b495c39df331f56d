//! Authenticated encryption using `XChaCha20-Poly1305`
//!
//! Both the long-term ("box") path and the ratchet path use the same cipher
//! with a caller-provided 24-byte nonce. The long-term key for a pair of
//! identities is `KDF(DH(my_secret, peer_public), "box")`.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    kdf::{KEY_SIZE, derive_key},
    keys::{PublicKey, SecretKey},
    nonce::Nonce,
};

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Label for the long-term box key
const BOX_KEY_SALT: &[u8] = b"box";

/// Encrypt `plaintext` under `key` and `nonce`.
///
/// Returns ciphertext with the 16-byte tag appended.
pub fn seal(key: &[u8; KEY_SIZE], nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce.as_bytes()), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Decrypt and authenticate `ciphertext`.
///
/// # Errors
///
/// - `AuthenticationFailed`: wrong key, wrong nonce or tampered ciphertext
pub fn open(key: &[u8; KEY_SIZE], nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());

    cipher
        .decrypt(XNonce::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Long-term box key between `secret` and `peer`.
fn box_key(secret: &SecretKey, peer: &PublicKey) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let shared = secret.diffie_hellman(peer)?;
    Ok(Zeroizing::new(derive_key(shared.as_bytes(), BOX_KEY_SALT)))
}

/// Encrypt with the long-term keys of sender (`secret`) and recipient.
pub fn seal_box(
    secret: &SecretKey,
    recipient: &PublicKey,
    nonce: &Nonce,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = box_key(secret, recipient)?;
    Ok(seal(&key, nonce, plaintext))
}

/// Decrypt with the long-term keys of recipient (`secret`) and sender.
pub fn open_box(
    secret: &SecretKey,
    sender: &PublicKey,
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = box_key(secret, sender)?;
    open(&key, nonce, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn seal_then_open() {
        let nonce = Nonce::from_bytes([1u8; 24]);
        let ciphertext = seal(&KEY, &nonce, b"hello");

        assert_eq!(ciphertext.len(), 5 + TAG_SIZE);
        assert_eq!(open(&KEY, &nonce, &ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn wrong_nonce_fails() {
        let ciphertext = seal(&KEY, &Nonce::from_bytes([1u8; 24]), b"hello");
        let result = open(&KEY, &Nonce::from_bytes([2u8; 24]), &ciphertext);
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let nonce = Nonce::from_bytes([1u8; 24]);
        let mut ciphertext = seal(&KEY, &nonce, b"hello");
        ciphertext[0] ^= 0x01;

        assert_eq!(open(&KEY, &nonce, &ciphertext), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let nonce = Nonce::from_bytes([1u8; 24]);
        assert_eq!(open(&KEY, &nonce, &[0u8; 3]), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn box_round_trip_between_peers() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        let bob = KeyPair::from_secret_bytes([2u8; 32]);
        let nonce = Nonce::from_bytes([3u8; 24]);

        let ciphertext =
            seal_box(alice.secret_key(), &bob.public_key(), &nonce, b"long-term").unwrap();
        let plaintext =
            open_box(bob.secret_key(), &alice.public_key(), &nonce, &ciphertext).unwrap();

        assert_eq!(plaintext, b"long-term");
    }

    #[test]
    fn box_for_someone_else_fails() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        let bob = KeyPair::from_secret_bytes([2u8; 32]);
        let eve = KeyPair::from_secret_bytes([3u8; 32]);
        let nonce = Nonce::from_bytes([3u8; 24]);

        let ciphertext = seal_box(alice.secret_key(), &bob.public_key(), &nonce, b"x").unwrap();
        let result = open_box(eve.secret_key(), &alice.public_key(), &nonce, &ciphertext);

        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }
}

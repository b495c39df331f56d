//! Identities, message ids and the local identity store.

use std::{fmt, str::FromStr, sync::Arc};

use keyline_crypto::{CryptoError, KeyPair, Nonce, PublicKey, SharedSecret, open_box, seal_box};
use serde::{Deserialize, Serialize};

use crate::{env::Environment, error::IdentityError};

/// Length of an identity in bytes.
pub const IDENTITY_LEN: usize = 8;

/// Globally unique account identity: eight characters from `A-Z`, `0-9`, `*`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    /// Parse and validate an identity string.
    pub fn new(identity: &str) -> Result<Self, IdentityError> {
        Self::from_slice(identity.as_bytes())
    }

    /// Validate raw identity bytes (as found on the wire).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let array: [u8; IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength { actual: bytes.len() })?;

        if let Some(position) = array.iter().position(|&b| !is_identity_char(b)) {
            return Err(IdentityError::InvalidCharacter { position });
        }

        Ok(Self(array))
    }

    /// Raw identity bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Identity as a string slice.
    pub fn as_str(&self) -> &str {
        let Ok(s) = std::str::from_utf8(&self.0) else {
            unreachable!("identity bytes are validated ASCII");
        };
        s
    }
}

fn is_identity_char(byte: u8) -> bool {
    byte.is_ascii_uppercase() || byte.is_ascii_digit() || byte == b'*'
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.as_str())
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.as_str().to_owned()
    }
}

/// 64-bit message identifier, unique per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Fresh random id.
    pub fn random<E: Environment>(env: &E) -> Self {
        Self(env.random_u64())
    }

    /// Raw id value.
    pub fn value(self) -> u64 {
        self.0
    }

    /// Little-endian wire encoding.
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decode from the little-endian wire encoding.
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Local identity and long-term key operations.
///
/// The private key never leaves the implementation: callers get DH outputs
/// and box encryption, nothing else.
pub trait IdentityStore: Send + Sync {
    /// Our identity.
    fn identity(&self) -> Identity;

    /// Our long-term public key.
    fn public_key(&self) -> PublicKey;

    /// Public nickname sent along with outgoing messages, if any.
    fn nickname(&self) -> Option<String>;

    /// `DH(our long-term secret, peer)`.
    fn compute_shared_secret(&self, peer: &PublicKey) -> Result<SharedSecret, CryptoError>;

    /// Long-term box encryption for `recipient`.
    fn encrypt(
        &self,
        plaintext: &[u8],
        nonce: &Nonce,
        recipient: &PublicKey,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Long-term box decryption from `sender`.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &Nonce,
        sender: &PublicKey,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// In-memory [`IdentityStore`] holding a long-term key pair.
///
/// Clone shares the same key pair.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    identity: Identity,
    key_pair: Arc<KeyPair>,
    nickname: Option<String>,
}

impl LocalIdentity {
    /// Create an identity with a fresh long-term key pair.
    pub fn generate<E: Environment>(identity: Identity, env: &E) -> Self {
        Self::from_key_pair(identity, KeyPair::from_secret_bytes(env.random_array()))
    }

    /// Create an identity from an existing key pair.
    pub fn from_key_pair(identity: Identity, key_pair: KeyPair) -> Self {
        Self { identity, key_pair: Arc::new(key_pair), nickname: None }
    }

    /// Set the public nickname.
    #[must_use]
    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }
}

impl IdentityStore for LocalIdentity {
    fn identity(&self) -> Identity {
        self.identity
    }

    fn public_key(&self) -> PublicKey {
        self.key_pair.public_key()
    }

    fn nickname(&self) -> Option<String> {
        self.nickname.clone()
    }

    fn compute_shared_secret(&self, peer: &PublicKey) -> Result<SharedSecret, CryptoError> {
        self.key_pair.secret_key().diffie_hellman(peer)
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        nonce: &Nonce,
        recipient: &PublicKey,
    ) -> Result<Vec<u8>, CryptoError> {
        seal_box(self.key_pair.secret_key(), recipient, nonce, plaintext)
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &Nonce,
        sender: &PublicKey,
    ) -> Result<Vec<u8>, CryptoError> {
        open_box(self.key_pair.secret_key(), sender, nonce, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SeededEnv;

    #[test]
    fn valid_identities_parse() {
        for raw in ["ALICE001", "*GATEWAY", "01234567"] {
            let identity = Identity::new(raw).unwrap();
            assert_eq!(identity.as_str(), raw);
            assert_eq!(identity.to_string(), raw);
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(Identity::new("SHORT"), Err(IdentityError::InvalidLength { actual: 5 }));
        assert_eq!(Identity::new("TOOLONG99"), Err(IdentityError::InvalidLength { actual: 9 }));
    }

    #[test]
    fn lowercase_is_rejected() {
        assert_eq!(
            Identity::new("ALICe001"),
            Err(IdentityError::InvalidCharacter { position: 4 })
        );
    }

    #[test]
    fn identity_debug_shows_string() {
        let identity = Identity::new("BOB00001").unwrap();
        assert_eq!(format!("{identity:?}"), "Identity(BOB00001)");
    }

    #[test]
    fn message_id_wire_encoding_is_little_endian() {
        let id = MessageId::new(0x0102_0304_0506_0708);
        assert_eq!(id.to_le_bytes(), [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(MessageId::from_le_bytes(id.to_le_bytes()), id);
        assert_eq!(id.to_string(), "0102030405060708");
    }

    #[test]
    fn local_identities_agree_on_shared_secret() {
        let env = SeededEnv::new(1);
        let alice = LocalIdentity::generate(Identity::new("ALICE001").unwrap(), &env);
        let bob = LocalIdentity::generate(Identity::new("BOB00001").unwrap(), &env);

        let ab = alice.compute_shared_secret(&bob.public_key()).unwrap();
        let ba = bob.compute_shared_secret(&alice.public_key()).unwrap();

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn local_identity_box_round_trip() {
        let env = SeededEnv::new(2);
        let alice = LocalIdentity::generate(Identity::new("ALICE001").unwrap(), &env);
        let bob = LocalIdentity::generate(Identity::new("BOB00001").unwrap(), &env);
        let nonce = Nonce::from_bytes(env.random_array());

        let ciphertext = alice.encrypt(b"hi bob", &nonce, &bob.public_key()).unwrap();
        let plaintext = bob.decrypt(&ciphertext, &nonce, &alice.public_key()).unwrap();

        assert_eq!(plaintext, b"hi bob");
    }
}

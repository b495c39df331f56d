//! Keyline Cryptographic Primitives
//!
//! Building blocks for the keyline forward-secrecy session layer. Pure
//! functions with deterministic outputs: callers provide all random bytes
//! (secret keys, nonces), so every primitive is reproducible under test.
//!
//! # Key Lifecycle
//!
//! ```text
//! DH(long-term, long-term) ‖ DH(ephemeral, long-term) [‖ ES ‖ EE]
//!        │
//!        ▼
//! HKDF → initial chain key (per session, per direction)
//!        │
//!        ▼
//! KDF Ratchet → one encryption key per counter value
//!        │
//!        ▼
//! XChaCha20-Poly1305 → ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Ratchet turns overwrite the chain key; earlier keys cannot be recomputed
//! - Ephemeral private keys are dropped once the 4-DH ratchets exist
//!
//! Replay resistance:
//! - Nonces are tracked as `HMAC-SHA256(hash_key, nonce)` by the caller's
//!   nonce store; the raw nonce is never persisted

#![forbid(unsafe_code)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod nonce;
pub mod ratchet;

pub use aead::{TAG_SIZE, open, open_box, seal, seal_box};
pub use error::{CryptoError, RatchetError};
pub use kdf::{KEY_SIZE, derive_key, derive_key_from_parts};
pub use keys::{KeyPair, PublicKey, SecretKey, SharedSecret};
pub use nonce::{NONCE_HASH_SIZE, NONCE_SIZE, Nonce, hash_nonce};
pub use ratchet::{EncryptionKey, KdfRatchet, MAX_COUNTER_INCREMENT};

//! Forward-secure DH sessions.
//!
//! A session between two identities starts with a 2-DH key agreement
//! (static-static plus ephemeral-static) so the initiator can send
//! immediately, and upgrades to 4-DH once the responder's ephemeral key is
//! known. Each direction then runs its own [`KdfRatchet`].
//!
//! ```text
//! Initiator                         Responder
//!   initiate()  ── Init{eph_i} ──▶   respond()        2-DH + 4-DH ready
//!   process_accept() ◀── Accept{eph_r} ──             4-DH only from here
//! ```
//!
//! [`KdfRatchet`]: keyline_crypto::KdfRatchet

mod dh;
mod handshake;
mod store;

use std::fmt;

use keyline_crypto::EncryptionKey;
use serde::{Deserialize, Serialize};

pub use dh::{DhSession, SessionState};
pub use handshake::{HANDSHAKE_PAYLOAD_LEN, HandshakePayload, VersionRange};
pub use store::{DhSessionStore, MemorySessionStore, SharedSession};

use crate::env::Environment;

/// Length of a session id in bytes.
pub const SESSION_ID_LEN: usize = 16;

/// 16 random bytes identifying a session between two identities.
///
/// Ordered so that "lowest id wins" tie-breaks are deterministic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Wrap raw session id bytes.
    pub const fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random session id.
    pub fn random<E: Environment>(env: &E) -> Self {
        Self(env.random_array())
    }

    /// Raw session id bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Which key agreement a ratchet (and the message it encrypted) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DhType {
    /// Static-static plus ephemeral-static agreement
    TwoDh,
    /// All four static/ephemeral combinations
    FourDh,
}

impl DhType {
    /// Wire value.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::TwoDh => 1,
            Self::FourDh => 2,
        }
    }

    /// Parse a wire value.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::TwoDh),
            2 => Some(Self::FourDh),
            _ => None,
        }
    }
}

impl fmt::Display for DhType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TwoDh => f.write_str("2DH"),
            Self::FourDh => f.write_str("4DH"),
        }
    }
}

/// Key for exactly one message, taken from a session ratchet.
///
/// Carries the ratchet position so the receiver can catch up to it.
#[derive(Debug, Clone)]
pub struct SessionKey {
    /// Session the key belongs to
    pub session_id: SessionId,
    /// Ratchet family the key came from
    pub dh_type: DhType,
    /// Ratchet counter the key was derived at
    pub counter: u64,
    /// Encryption key (zeroized on drop)
    pub key: EncryptionKey,
}

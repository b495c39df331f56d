//! Handshake payload and version negotiation.
//!
//! Wire layout of the `Init` and `Accept` payloads (50 bytes):
//!
//! ```text
//! session_id (16) | version_min (u8) | version_max (u8) | ephemeral_public_key (32)
//! ```

use std::fmt;

use keyline_crypto::PublicKey;
use serde::{Deserialize, Serialize};

use super::{SESSION_ID_LEN, SessionId};
use crate::error::SessionError;

/// Size of an encoded [`HandshakePayload`].
pub const HANDSHAKE_PAYLOAD_LEN: usize = SESSION_ID_LEN + 2 + 32;

/// Inclusive range of protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    /// Lowest supported version
    pub min: u8,
    /// Highest supported version
    pub max: u8,
}

impl VersionRange {
    /// Versions this implementation speaks.
    pub const SUPPORTED: Self = Self { min: 1, max: 2 };

    /// Create a range, rejecting `min > max`.
    pub fn new(min: u8, max: u8) -> Result<Self, SessionError> {
        if min > max {
            return Err(SessionError::MalformedHandshake { reason: "version min exceeds max" });
        }
        Ok(Self { min, max })
    }

    /// Intersection of two ranges.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVersion`: the ranges do not overlap
    pub fn negotiate(self, remote: Self) -> Result<Self, SessionError> {
        let min = self.min.max(remote.min);
        let max = self.max.min(remote.max);
        if min > max {
            return Err(SessionError::UnsupportedVersion { local: self, remote });
        }
        Ok(Self { min, max })
    }

    /// Whether `version` lies in the range.
    pub fn contains(self, version: u8) -> bool {
        (self.min..=self.max).contains(&version)
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::SUPPORTED
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// Body of an `Init` or `Accept` control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Session being established
    pub session_id: SessionId,
    /// Versions offered (Init) or negotiated (Accept)
    pub versions: VersionRange,
    /// Sender's ephemeral public key
    pub ephemeral_public_key: PublicKey,
}

impl HandshakePayload {
    /// Encode to the 50-byte wire layout.
    pub fn encode(&self) -> [u8; HANDSHAKE_PAYLOAD_LEN] {
        let mut out = [0u8; HANDSHAKE_PAYLOAD_LEN];
        out[..SESSION_ID_LEN].copy_from_slice(self.session_id.as_bytes());
        out[SESSION_ID_LEN] = self.versions.min;
        out[SESSION_ID_LEN + 1] = self.versions.max;
        out[SESSION_ID_LEN + 2..].copy_from_slice(self.ephemeral_public_key.as_bytes());
        out
    }

    /// Decode from the wire layout.
    ///
    /// # Errors
    ///
    /// - `MalformedHandshake`: wrong length or `min > max`
    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() != HANDSHAKE_PAYLOAD_LEN {
            return Err(SessionError::MalformedHandshake { reason: "wrong payload length" });
        }

        let (id, rest) = bytes.split_at(SESSION_ID_LEN);
        let Ok(id) = <[u8; SESSION_ID_LEN]>::try_from(id) else {
            unreachable!("split_at yields exactly SESSION_ID_LEN bytes");
        };
        let versions = VersionRange::new(rest[0], rest[1])?;
        let Ok(ephemeral_public_key) = PublicKey::from_slice(&rest[2..]) else {
            unreachable!("length checked above");
        };

        Ok(Self { session_id: SessionId::from_bytes(id), versions, ephemeral_public_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> HandshakePayload {
        HandshakePayload {
            session_id: SessionId::from_bytes([0x11; 16]),
            versions: VersionRange { min: 1, max: 2 },
            ephemeral_public_key: PublicKey::from_bytes([0x22; 32]),
        }
    }

    #[test]
    fn encoded_layout() {
        let bytes = payload().encode();

        assert_eq!(bytes.len(), 50);
        assert_eq!(&bytes[..16], &[0x11; 16]);
        assert_eq!(bytes[16], 1);
        assert_eq!(bytes[17], 2);
        assert_eq!(&bytes[18..], &[0x22; 32]);
        assert_eq!(HandshakePayload::decode(&bytes), Ok(payload()));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let bytes = payload().encode();
        assert!(matches!(
            HandshakePayload::decode(&bytes[..49]),
            Err(SessionError::MalformedHandshake { .. })
        ));
    }

    #[test]
    fn inverted_versions_are_malformed() {
        let mut bytes = payload().encode();
        bytes[16] = 3;
        bytes[17] = 1;
        assert!(matches!(
            HandshakePayload::decode(&bytes),
            Err(SessionError::MalformedHandshake { .. })
        ));
    }

    #[test]
    fn negotiate_takes_intersection() {
        let local = VersionRange { min: 1, max: 3 };
        let remote = VersionRange { min: 2, max: 5 };
        assert_eq!(local.negotiate(remote), Ok(VersionRange { min: 2, max: 3 }));
    }

    #[test]
    fn disjoint_ranges_are_unsupported() {
        let local = VersionRange { min: 1, max: 2 };
        let remote = VersionRange { min: 3, max: 4 };
        assert_eq!(
            local.negotiate(remote),
            Err(SessionError::UnsupportedVersion { local, remote })
        );
    }

    #[test]
    fn range_contains() {
        assert!(VersionRange::SUPPORTED.contains(1));
        assert!(VersionRange::SUPPORTED.contains(2));
        assert!(!VersionRange::SUPPORTED.contains(3));
    }
}

//! DH session state machine.

use std::fmt;

use keyline_crypto::{KdfRatchet, KeyPair, PublicKey, SecretKey, SharedSecret, derive_key_from_parts};

use super::{DhType, SessionId, SessionKey, VersionRange};
use crate::{
    contacts::Contact,
    env::Environment,
    error::SessionError,
    identity::{Identity, IdentityStore},
};

/// Salt prefix for 2-DH root keys, followed by the owning identity
const KE_SALT_2DH_PREFIX: &str = "ke-2dh-";

/// Salt prefix for 4-DH root keys, followed by the owning identity
const KE_SALT_4DH_PREFIX: &str = "ke-4dh-";

/// Counter value of a freshly derived ratchet
const INITIAL_COUNTER: u64 = 1;

/// Key agreement progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Only 2-DH ratchets exist; waiting for the peer's `Accept`
    TwoDhOnly,
    /// 4-DH ratchets exist (terminal)
    FourDh,
}

/// A forward-secure session with one peer.
///
/// Owns the ephemeral key pair and up to two ratchet pairs (2-DH and 4-DH).
///
/// # Invariants
///
/// - At least one ratchet pair exists after construction
/// - The ephemeral private key is present iff the 4-DH ratchets are not yet
///   derived on the initiator; it is dropped (and zeroized) exactly when they
///   are
/// - Our own 2-DH ratchet never coexists with our own 4-DH ratchet
/// - The peer 2-DH ratchet survives until the first 4-DH message from the
///   peer, so 2-DH messages still in flight can be decrypted
pub struct DhSession {
    id: SessionId,
    my_identity: Identity,
    peer_identity: Identity,
    my_ephemeral_private_key: Option<SecretKey>,
    my_ephemeral_public_key: PublicKey,
    peer_ephemeral_public_key: Option<PublicKey>,
    my_ratchet_2dh: Option<KdfRatchet>,
    peer_ratchet_2dh: Option<KdfRatchet>,
    my_ratchet_4dh: Option<KdfRatchet>,
    peer_ratchet_4dh: Option<KdfRatchet>,
    versions: VersionRange,
}

impl DhSession {
    /// Start a new session as initiator.
    ///
    /// Generates an ephemeral key pair and derives both 2-DH ratchets from
    /// `SS || SE`, where `SS = DH(my_lt, peer_lt)` and
    /// `SE = DH(my_eph, peer_lt)`. The ephemeral private key is kept for
    /// [`process_accept`](Self::process_accept).
    pub fn initiate<I, E>(
        peer: &Contact,
        identity: &I,
        versions: VersionRange,
        env: &E,
    ) -> Result<Self, SessionError>
    where
        I: IdentityStore + ?Sized,
        E: Environment,
    {
        let id = SessionId::random(env);
        let (ephemeral_secret, ephemeral_public) =
            KeyPair::from_secret_bytes(env.random_array()).into_parts();
        let key_agreement = |source| SessionError::KeyAgreement { session_id: id, source };

        let ss = identity.compute_shared_secret(&peer.public_key).map_err(key_agreement)?;
        let se = ephemeral_secret.diffie_hellman(&peer.public_key).map_err(key_agreement)?;

        let my_identity = identity.identity();
        let my_ratchet = derive_2dh(&ss, &se, &my_identity);
        let peer_ratchet = derive_2dh(&ss, &se, &peer.identity);

        tracing::debug!(session_id = %id, peer = %peer.identity, "initiated 2DH session");

        Ok(Self {
            id,
            my_identity,
            peer_identity: peer.identity,
            my_ephemeral_private_key: Some(ephemeral_secret),
            my_ephemeral_public_key: ephemeral_public,
            peer_ephemeral_public_key: None,
            my_ratchet_2dh: Some(my_ratchet),
            peer_ratchet_2dh: Some(peer_ratchet),
            my_ratchet_4dh: None,
            peer_ratchet_4dh: None,
            versions,
        })
    }

    /// Create the responder side of a session from a peer's `Init`.
    ///
    /// Negotiates versions against `local_versions`, derives the peer's 2-DH
    /// ratchet (byte-identical to the initiator's own 2-DH ratchet) and both
    /// 4-DH ratchets. Our own 2-DH ratchet is not kept since its 4-DH
    /// counterpart already exists. The ephemeral private key is dropped
    /// before returning; only its public half remains for the `Accept`.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVersion`: the offered range does not overlap ours
    /// - `KeyAgreement`: a peer key is a low-order point
    pub fn respond<I, E>(
        session_id: SessionId,
        offered_versions: VersionRange,
        peer_ephemeral_public_key: &PublicKey,
        peer: &Contact,
        identity: &I,
        local_versions: VersionRange,
        env: &E,
    ) -> Result<Self, SessionError>
    where
        I: IdentityStore + ?Sized,
        E: Environment,
    {
        let versions = local_versions.negotiate(offered_versions)?;
        let key_agreement = |source| SessionError::KeyAgreement { session_id, source };

        let (ephemeral_secret, ephemeral_public) =
            KeyPair::from_secret_bytes(env.random_array()).into_parts();

        // Initiator perspective: SE = initiator ephemeral x our static,
        // ES = initiator static x our ephemeral.
        let ss = identity.compute_shared_secret(&peer.public_key).map_err(key_agreement)?;
        let se = identity.compute_shared_secret(peer_ephemeral_public_key).map_err(key_agreement)?;
        let es = ephemeral_secret.diffie_hellman(&peer.public_key).map_err(key_agreement)?;
        let ee = ephemeral_secret.diffie_hellman(peer_ephemeral_public_key).map_err(key_agreement)?;
        drop(ephemeral_secret);

        let my_identity = identity.identity();
        let peer_ratchet_2dh = derive_2dh(&ss, &se, &peer.identity);
        let my_ratchet_4dh = derive_4dh(&ss, &se, &es, &ee, &my_identity);
        let peer_ratchet_4dh = derive_4dh(&ss, &se, &es, &ee, &peer.identity);

        tracing::debug!(
            %session_id,
            peer = %peer.identity,
            %versions,
            "responder session established with 4DH"
        );

        Ok(Self {
            id: session_id,
            my_identity,
            peer_identity: peer.identity,
            my_ephemeral_private_key: None,
            my_ephemeral_public_key: ephemeral_public,
            peer_ephemeral_public_key: Some(*peer_ephemeral_public_key),
            my_ratchet_2dh: None,
            peer_ratchet_2dh: Some(peer_ratchet_2dh),
            my_ratchet_4dh: Some(my_ratchet_4dh),
            peer_ratchet_4dh: Some(peer_ratchet_4dh),
            versions,
        })
    }

    /// Complete the handshake as initiator from the peer's `Accept`.
    ///
    /// Derives both 4-DH ratchets, drops both 2-DH ratchets and zeroizes the
    /// ephemeral private key.
    ///
    /// # Errors
    ///
    /// - `MissingEphemeralPrivateKey`: already accepted, or this side is the
    ///   responder
    /// - `UnsupportedVersion`: accepted range does not overlap ours
    /// - `KeyAgreement`: the peer ephemeral key is a low-order point
    pub fn process_accept<I>(
        &mut self,
        accepted_versions: VersionRange,
        peer_ephemeral_public_key: &PublicKey,
        peer: &Contact,
        identity: &I,
    ) -> Result<(), SessionError>
    where
        I: IdentityStore + ?Sized,
    {
        let session_id = self.id;
        let Some(ephemeral_secret) = self.my_ephemeral_private_key.as_ref() else {
            return Err(SessionError::MissingEphemeralPrivateKey { session_id });
        };

        let versions = self.versions.negotiate(accepted_versions)?;
        let key_agreement = |source| SessionError::KeyAgreement { session_id, source };

        let ss = identity.compute_shared_secret(&peer.public_key).map_err(key_agreement)?;
        let se = ephemeral_secret.diffie_hellman(&peer.public_key).map_err(key_agreement)?;
        let es = identity.compute_shared_secret(peer_ephemeral_public_key).map_err(key_agreement)?;
        let ee = ephemeral_secret.diffie_hellman(peer_ephemeral_public_key).map_err(key_agreement)?;

        self.my_ratchet_4dh = Some(derive_4dh(&ss, &se, &es, &ee, &self.my_identity));
        self.peer_ratchet_4dh = Some(derive_4dh(&ss, &se, &es, &ee, &peer.identity));
        self.my_ratchet_2dh = None;
        self.peer_ratchet_2dh = None;
        self.my_ephemeral_private_key = None;
        self.peer_ephemeral_public_key = Some(*peer_ephemeral_public_key);
        self.versions = versions;

        tracing::debug!(%session_id, peer = %peer.identity, %versions, "initiator session upgraded to 4DH");
        Ok(())
    }

    /// Key for the next outgoing message; advances our ratchet.
    ///
    /// Uses the 4-DH ratchet when available, the 2-DH ratchet otherwise.
    pub fn next_outgoing_key(&mut self) -> Result<SessionKey, SessionError> {
        let session_id = self.id;
        let (dh_type, ratchet) = match (&mut self.my_ratchet_4dh, &mut self.my_ratchet_2dh) {
            (Some(ratchet), _) => (DhType::FourDh, ratchet),
            (None, Some(ratchet)) => (DhType::TwoDh, ratchet),
            (None, None) => {
                return Err(SessionError::MissingRatchet { session_id, dh_type: DhType::FourDh });
            },
        };

        let key = ratchet.current_encryption_key();
        let counter = ratchet.counter();
        ratchet.turn().map_err(|source| SessionError::Ratchet { session_id, source })?;

        Ok(SessionKey { session_id, dh_type, counter, key })
    }

    /// Key for an incoming message at `counter`.
    ///
    /// Turns the matching peer ratchet forward to `counter` and returns the
    /// key together with the number of skipped positions (messages that were
    /// lost or are still in flight). The ratchet is not turned past the
    /// message; call [`complete_incoming`](Self::complete_incoming) once the
    /// message decrypted.
    pub fn incoming_key(
        &mut self,
        dh_type: DhType,
        counter: u64,
    ) -> Result<(SessionKey, u64), SessionError> {
        let session_id = self.id;
        let ratchet = match dh_type {
            DhType::TwoDh => self.peer_ratchet_2dh.as_mut(),
            DhType::FourDh => self.peer_ratchet_4dh.as_mut(),
        }
        .ok_or(SessionError::MissingRatchet { session_id, dh_type })?;

        let skipped =
            ratchet.turn_until(counter).map_err(|source| SessionError::Ratchet { session_id, source })?;
        if skipped > 0 {
            tracing::debug!(%session_id, %dh_type, skipped, "peer ratchet skipped ahead");
        }

        let key = SessionKey { session_id, dh_type, counter, key: ratchet.current_encryption_key() };
        Ok((key, skipped))
    }

    /// Advance the peer ratchet past a successfully decrypted message.
    ///
    /// Returns true if this was the first 4-DH message from the peer, in
    /// which case the peer 2-DH ratchet has been discarded.
    pub fn complete_incoming(&mut self, dh_type: DhType) -> Result<bool, SessionError> {
        let session_id = self.id;
        let ratchet = match dh_type {
            DhType::TwoDh => self.peer_ratchet_2dh.as_mut(),
            DhType::FourDh => self.peer_ratchet_4dh.as_mut(),
        }
        .ok_or(SessionError::MissingRatchet { session_id, dh_type })?;

        ratchet.turn().map_err(|source| SessionError::Ratchet { session_id, source })?;

        if dh_type == DhType::FourDh && self.peer_ratchet_2dh.is_some() {
            self.discard_peer_ratchet_2dh();
            tracing::debug!(%session_id, "first 4DH message from peer");
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop the peer 2-DH ratchet.
    pub fn discard_peer_ratchet_2dh(&mut self) {
        self.peer_ratchet_2dh = None;
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Our identity.
    pub fn my_identity(&self) -> Identity {
        self.my_identity
    }

    /// Peer identity.
    pub fn peer_identity(&self) -> Identity {
        self.peer_identity
    }

    /// Our ephemeral public key (sent in `Init` or `Accept`).
    pub fn my_ephemeral_public_key(&self) -> PublicKey {
        self.my_ephemeral_public_key
    }

    /// Peer ephemeral public key, once known.
    pub fn peer_ephemeral_public_key(&self) -> Option<PublicKey> {
        self.peer_ephemeral_public_key
    }

    /// Whether the ephemeral private key is still held.
    pub fn has_ephemeral_private_key(&self) -> bool {
        self.my_ephemeral_private_key.is_some()
    }

    /// Negotiated (or, before `Accept`, offered) version range.
    pub fn versions(&self) -> VersionRange {
        self.versions
    }

    /// Key agreement progress.
    pub fn state(&self) -> SessionState {
        if self.my_ratchet_4dh.is_some() || self.peer_ratchet_4dh.is_some() {
            SessionState::FourDh
        } else {
            SessionState::TwoDhOnly
        }
    }

    /// Counter of our ratchet of the given type, if present.
    pub fn my_counter(&self, dh_type: DhType) -> Option<u64> {
        match dh_type {
            DhType::TwoDh => self.my_ratchet_2dh.as_ref(),
            DhType::FourDh => self.my_ratchet_4dh.as_ref(),
        }
        .map(KdfRatchet::counter)
    }

    /// Counter of the peer ratchet of the given type, if present.
    pub fn peer_counter(&self, dh_type: DhType) -> Option<u64> {
        match dh_type {
            DhType::TwoDh => self.peer_ratchet_2dh.as_ref(),
            DhType::FourDh => self.peer_ratchet_4dh.as_ref(),
        }
        .map(KdfRatchet::counter)
    }
}

impl fmt::Debug for DhSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhSession")
            .field("id", &self.id)
            .field("my_identity", &self.my_identity)
            .field("peer_identity", &self.peer_identity)
            .field("state", &self.state())
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

fn derive_2dh(ss: &SharedSecret, se: &SharedSecret, owner: &Identity) -> KdfRatchet {
    let salt = format!("{KE_SALT_2DH_PREFIX}{owner}");
    let chain_key = derive_key_from_parts(&[ss.as_bytes(), se.as_bytes()], salt.as_bytes());
    KdfRatchet::new(INITIAL_COUNTER, chain_key)
}

fn derive_4dh(
    ss: &SharedSecret,
    se: &SharedSecret,
    es: &SharedSecret,
    ee: &SharedSecret,
    owner: &Identity,
) -> KdfRatchet {
    let salt = format!("{KE_SALT_4DH_PREFIX}{owner}");
    let chain_key = derive_key_from_parts(
        &[ss.as_bytes(), se.as_bytes(), es.as_bytes(), ee.as_bytes()],
        salt.as_bytes(),
    );
    KdfRatchet::new(INITIAL_COUNTER, chain_key)
}

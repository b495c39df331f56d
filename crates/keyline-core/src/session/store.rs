//! Session registry per peer.
//!
//! Sessions are handed out as [`SharedSession`] handles. Ratchet turns
//! happen only under the handle's lock, and callers must release it before
//! calling back into the store (lock order is always store, then session).

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use super::{DhSession, SessionId, SessionState};
use crate::identity::Identity;

/// Mutex-guarded handle to a stored session.
pub type SharedSession = Arc<Mutex<DhSession>>;

/// Storage for DH sessions, keyed by peer and session id.
pub trait DhSessionStore: Send + Sync {
    /// Session `session_id` with `peer`.
    fn get(&self, peer: &Identity, session_id: &SessionId) -> Option<SharedSession>;

    /// Preferred session with `peer`.
    ///
    /// 4-DH sessions win over 2-DH sessions; ties go to the lowest session
    /// id so both sides converge on the same session.
    fn best(&self, peer: &Identity) -> Option<SharedSession>;

    /// Insert or replace a session and return its handle.
    fn store(&self, session: DhSession) -> SharedSession;

    /// Remove one session. Returns true if it existed.
    fn delete(&self, peer: &Identity, session_id: &SessionId) -> bool;

    /// Remove every session with `peer` except `keep`.
    ///
    /// With `four_dh_only`, 2-DH sessions survive (a handshake with them may
    /// still be in flight). Returns the ids of the removed sessions.
    fn delete_all_except(
        &self,
        peer: &Identity,
        keep: &SessionId,
        four_dh_only: bool,
    ) -> Vec<SessionId>;

    /// Remove every session with `peer`. Returns the removed ids.
    fn delete_all(&self, peer: &Identity) -> Vec<SessionId>;
}

/// In-memory session store.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying storage.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<Mutex<HashMap<Identity, BTreeMap<SessionId, SharedSession>>>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with `peer`.
    pub fn session_count(&self, peer: &Identity) -> usize {
        let inner = self.inner.lock().expect("MemorySessionStore mutex poisoned");
        inner.get(peer).map_or(0, BTreeMap::len)
    }
}

fn state_of(session: &SharedSession) -> SessionState {
    session.lock().expect("DhSession mutex poisoned").state()
}

impl DhSessionStore for MemorySessionStore {
    fn get(&self, peer: &Identity, session_id: &SessionId) -> Option<SharedSession> {
        let inner = self.inner.lock().expect("MemorySessionStore mutex poisoned");
        inner.get(peer)?.get(session_id).cloned()
    }

    fn best(&self, peer: &Identity) -> Option<SharedSession> {
        let inner = self.inner.lock().expect("MemorySessionStore mutex poisoned");
        let sessions = inner.get(peer)?;

        // BTreeMap iterates in ascending id order, so the first match is the
        // lowest id of its class.
        sessions
            .values()
            .find(|session| state_of(session) == SessionState::FourDh)
            .or_else(|| sessions.values().next())
            .cloned()
    }

    fn store(&self, session: DhSession) -> SharedSession {
        let peer = session.peer_identity();
        let session_id = session.id();
        let shared = Arc::new(Mutex::new(session));

        let mut inner = self.inner.lock().expect("MemorySessionStore mutex poisoned");
        inner.entry(peer).or_default().insert(session_id, Arc::clone(&shared));

        tracing::debug!(%session_id, %peer, "stored session");
        shared
    }

    fn delete(&self, peer: &Identity, session_id: &SessionId) -> bool {
        let mut inner = self.inner.lock().expect("MemorySessionStore mutex poisoned");
        let Some(sessions) = inner.get_mut(peer) else {
            return false;
        };

        let removed = sessions.remove(session_id).is_some();
        if sessions.is_empty() {
            inner.remove(peer);
        }
        if removed {
            tracing::debug!(%session_id, %peer, "deleted session");
        }
        removed
    }

    fn delete_all_except(
        &self,
        peer: &Identity,
        keep: &SessionId,
        four_dh_only: bool,
    ) -> Vec<SessionId> {
        let mut inner = self.inner.lock().expect("MemorySessionStore mutex poisoned");
        let Some(sessions) = inner.get_mut(peer) else {
            return Vec::new();
        };

        let doomed: Vec<SessionId> = sessions
            .iter()
            .filter(|(id, session)| {
                *id != keep && (!four_dh_only || state_of(session) == SessionState::FourDh)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &doomed {
            sessions.remove(id);
        }
        if sessions.is_empty() {
            inner.remove(peer);
        }

        if !doomed.is_empty() {
            tracing::debug!(%peer, kept = %keep, removed = doomed.len(), "evicted sessions");
        }
        doomed
    }

    fn delete_all(&self, peer: &Identity) -> Vec<SessionId> {
        let mut inner = self.inner.lock().expect("MemorySessionStore mutex poisoned");
        inner.remove(peer).map(|sessions| sessions.into_keys().collect()).unwrap_or_default()
    }
}

//! Outbound message queue.
//!
//! Tracks every encoded box until the server acknowledges it, so pending
//! messages can be re-sent after a reconnect. Entries are keyed by
//! `(message id, recipient)`; a message fanned out to several recipients
//! has one entry per recipient.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    coder::MessageBox,
    identity::{Identity, MessageId},
    session::SessionId,
    transport::Transport,
};

/// Key of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueMessageId {
    /// Message id
    pub message_id: MessageId,
    /// Recipient of this copy
    pub recipient: Identity,
}

impl QueueMessageId {
    /// Key of a box.
    pub fn of(message: &MessageBox) -> Self {
        Self { message_id: message.message_id, recipient: message.to }
    }
}

impl fmt::Display for QueueMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.message_id, self.recipient)
    }
}

/// An encoded message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Queue key
    pub id: QueueMessageId,
    /// Encoded box
    pub message: MessageBox,
    /// Insertion sequence (send order)
    pub seq: u64,
}

/// Queue snapshot encoding or decoding failed.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// CBOR encoding failed
    #[error("snapshot encoding failed: {0}")]
    Encode(String),

    /// CBOR decoding failed
    #[error("snapshot decoding failed: {0}")]
    Decode(String),
}

/// Thread-safe outbound queue.
///
/// Clone shares the same underlying queue. Every operation takes the one
/// internal lock, so an ack racing an enqueue resolves by lock order.
#[derive(Clone, Default)]
pub struct MessageQueue {
    inner: Arc<Mutex<QueueInner>>,
}

#[derive(Default)]
struct QueueInner {
    entries: HashMap<QueueMessageId, QueuedMessage>,
    next_seq: u64,
}

impl QueueInner {
    fn in_send_order(&self) -> Vec<QueuedMessage> {
        let mut entries: Vec<QueuedMessage> = self.entries.values().cloned().collect();
        entries.sort_unstable_by_key(|entry| entry.seq);
        entries
    }
}

/// Persisted form of the queue.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<QueuedMessage>,
    next_seq: u64,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `message` until acknowledged. Re-enqueueing the same key
    /// replaces the entry and moves it to the back.
    pub fn enqueue(&self, message: MessageBox) -> QueueMessageId {
        let id = QueueMessageId::of(&message);
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(id, QueuedMessage { id, message, seq });

        tracing::trace!(%id, seq, "enqueued message");
        id
    }

    /// Retire an acknowledged message. Unknown ids are ignored.
    ///
    /// Returns true if an entry was removed.
    pub fn process_ack(&self, id: &QueueMessageId) -> bool {
        let removed = self.remove(id);
        if removed {
            tracing::debug!(%id, "message acknowledged");
        }
        removed
    }

    /// Cancel a message locally. Returns the removed box.
    pub fn dequeue(&self, id: &QueueMessageId) -> Option<MessageBox> {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        inner.entries.remove(id).map(|entry| entry.message)
    }

    /// Remove every copy of `message_id`, for any recipient.
    ///
    /// Returns the number of removed entries.
    pub fn dequeue_all(&self, message_id: MessageId) -> usize {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|id, _| id.message_id != message_id);
        before - inner.entries.len()
    }

    /// Remove every entry encrypted under `session_id`.
    ///
    /// The peer cannot decrypt them once the session is gone. Returns the
    /// removed keys in send order.
    pub fn dequeue_session(&self, session_id: SessionId) -> Vec<QueueMessageId> {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");

        let mut removed: Vec<(u64, QueueMessageId)> = inner
            .entries
            .values()
            .filter(|entry| {
                entry.message.session.is_some_and(|header| header.session_id == session_id)
            })
            .map(|entry| (entry.seq, entry.id))
            .collect();
        removed.sort_unstable_by_key(|(seq, _)| *seq);

        for (_, id) in &removed {
            inner.entries.remove(id);
        }
        if !removed.is_empty() {
            tracing::debug!(%session_id, count = removed.len(), "retired session messages");
        }
        removed.into_iter().map(|(_, id)| id).collect()
    }

    /// Whether `id` is awaiting acknowledgement.
    pub fn is_queued(&self, id: &QueueMessageId) -> bool {
        self.inner.lock().expect("MessageQueue mutex poisoned").entries.contains_key(id)
    }

    /// Number of entries awaiting acknowledgement.
    pub fn queue_size(&self) -> usize {
        self.inner.lock().expect("MessageQueue mutex poisoned").entries.len()
    }

    /// Pending entries in send order.
    pub fn pending(&self) -> Vec<QueuedMessage> {
        self.inner.lock().expect("MessageQueue mutex poisoned").in_send_order()
    }

    /// Re-send every pending entry in send order.
    ///
    /// Entries stay queued until acknowledged. Stops at the first transport
    /// error. Returns the number of boxes handed to the transport.
    pub fn flush<T: Transport>(&self, transport: &T) -> Result<usize, T::Error> {
        // Snapshot first: the transport may deliver acks synchronously.
        let pending = self.pending();
        for entry in &pending {
            transport.send(&entry.message)?;
        }

        tracing::debug!(count = pending.len(), "flushed queue");
        Ok(pending.len())
    }

    /// Serialize the queue (CBOR) for persistence across restarts.
    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let snapshot = {
            let inner = self.inner.lock().expect("MessageQueue mutex poisoned");
            Snapshot { entries: inner.in_send_order(), next_seq: inner.next_seq }
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&snapshot, &mut bytes)
            .map_err(|err| SnapshotError::Encode(err.to_string()))?;
        Ok(bytes)
    }

    /// Rebuild a queue from [`snapshot`](Self::snapshot) bytes.
    pub fn restore(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot =
            ciborium::from_reader(bytes).map_err(|err| SnapshotError::Decode(err.to_string()))?;

        let next_seq =
            snapshot.entries.iter().map(|entry| entry.seq + 1).fold(snapshot.next_seq, u64::max);
        let entries = snapshot.entries.into_iter().map(|entry| (entry.id, entry)).collect();
        Ok(Self { inner: Arc::new(Mutex::new(QueueInner { entries, next_seq })) })
    }

    fn remove(&self, id: &QueueMessageId) -> bool {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        inner.entries.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, convert::Infallible};

    use keyline_crypto::Nonce;

    use super::*;
    use crate::{coder::SessionHeader, message::MessageFlags, session::DhType};

    fn identity(raw: &str) -> Identity {
        Identity::new(raw).unwrap()
    }

    fn message_box(message_id: u64, to: &str) -> MessageBox {
        MessageBox {
            from: identity("ALICE001"),
            to: identity(to),
            message_id: MessageId::new(message_id),
            flags: MessageFlags::SEND_PUSH,
            session: None,
            nonce: Nonce::from_bytes([message_id as u8; 24]),
            ciphertext: vec![1, 2, 3],
        }
    }

    fn session_box(message_id: u64, session: u8) -> MessageBox {
        MessageBox {
            session: Some(SessionHeader {
                session_id: SessionId::from_bytes([session; 16]),
                dh_type: DhType::FourDh,
                counter: message_id,
            }),
            ..message_box(message_id, "BOB00001")
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: RefCell<Vec<MessageId>>,
    }

    impl Transport for RecordingTransport {
        type Error = Infallible;

        fn send(&self, message: &MessageBox) -> Result<(), Self::Error> {
            self.sent.borrow_mut().push(message.message_id);
            Ok(())
        }
    }

    #[test]
    fn sizing_example() {
        let queue = MessageQueue::new();
        queue.enqueue(message_box(1, "AAAAAAAA"));
        queue.enqueue(message_box(2, "AAAAAAAA"));
        queue.enqueue(message_box(1, "BBBBBBBB"));
        assert_eq!(queue.queue_size(), 3);

        assert_eq!(queue.dequeue_all(MessageId::new(1)), 2);
        assert_eq!(queue.queue_size(), 1);
        assert!(queue.is_queued(&QueueMessageId {
            message_id: MessageId::new(2),
            recipient: identity("AAAAAAAA"),
        }));
    }

    #[test]
    fn ack_is_idempotent() {
        let queue = MessageQueue::new();
        let id = queue.enqueue(message_box(1, "BOB00001"));

        assert!(queue.process_ack(&id));
        assert!(!queue.process_ack(&id));
        assert!(!queue.is_queued(&id));
        assert_eq!(queue.queue_size(), 0);
    }

    #[test]
    fn ack_for_unknown_id_is_noop() {
        let queue = MessageQueue::new();
        queue.enqueue(message_box(1, "BOB00001"));

        let unknown = QueueMessageId { message_id: MessageId::new(9), recipient: identity("BOB00001") };
        assert!(!queue.process_ack(&unknown));
        assert_eq!(queue.queue_size(), 1);
    }

    #[test]
    fn dequeue_returns_box() {
        let queue = MessageQueue::new();
        let original = message_box(4, "BOB00001");
        let id = queue.enqueue(original.clone());

        assert_eq!(queue.dequeue(&id), Some(original));
        assert_eq!(queue.dequeue(&id), None);
    }

    #[test]
    fn dequeue_session_only_touches_that_session() {
        let queue = MessageQueue::new();
        queue.enqueue(session_box(3, 0xaa));
        queue.enqueue(session_box(2, 0xbb));
        queue.enqueue(session_box(1, 0xaa));
        queue.enqueue(message_box(4, "BOB00001"));

        let removed = queue.dequeue_session(SessionId::from_bytes([0xaa; 16]));

        // Send order, not message id order
        let removed_ids: Vec<u64> = removed.iter().map(|id| id.message_id.value()).collect();
        assert_eq!(removed_ids, vec![3, 1]);
        assert_eq!(queue.queue_size(), 2);
    }

    #[test]
    fn flush_resends_in_order_and_keeps_entries() {
        let queue = MessageQueue::new();
        queue.enqueue(message_box(3, "BOB00001"));
        queue.enqueue(message_box(1, "BOB00001"));
        queue.enqueue(message_box(2, "BOB00001"));

        let transport = RecordingTransport::default();
        assert_eq!(queue.flush(&transport).unwrap(), 3);

        let sent: Vec<u64> = transport.sent.borrow().iter().map(|id| id.value()).collect();
        assert_eq!(sent, vec![3, 1, 2]);
        assert_eq!(queue.queue_size(), 3);
    }

    #[test]
    fn reenqueue_moves_entry_to_back() {
        let queue = MessageQueue::new();
        queue.enqueue(message_box(1, "BOB00001"));
        queue.enqueue(message_box(2, "BOB00001"));
        queue.enqueue(message_box(1, "BOB00001"));

        let order: Vec<u64> =
            queue.pending().iter().map(|entry| entry.id.message_id.value()).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn snapshot_restores_entries_and_order() {
        let queue = MessageQueue::new();
        queue.enqueue(message_box(1, "AAAAAAAA"));
        queue.enqueue(session_box(2, 0xcc));

        let restored = MessageQueue::restore(&queue.snapshot().unwrap()).unwrap();

        assert_eq!(restored.pending(), queue.pending());
        let next = restored.enqueue(message_box(3, "AAAAAAAA"));
        assert_eq!(restored.pending().last().map(|entry| entry.id), Some(next));
    }

    #[test]
    fn garbage_snapshot_fails() {
        assert!(matches!(MessageQueue::restore(&[0xff, 0x00, 0x13]), Err(SnapshotError::Decode(_))));
    }

    #[test]
    fn clones_share_entries() {
        let queue = MessageQueue::new();
        let clone = queue.clone();
        let id = clone.enqueue(message_box(1, "BOB00001"));

        assert!(queue.is_queued(&id));
    }
}

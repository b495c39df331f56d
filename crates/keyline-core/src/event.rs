//! Actions and events produced by the forward-security processor.
//!
//! The processor performs no I/O. Every call returns a list of
//! [`FsAction`]s; the caller hands `Send` boxes to its transport, `Deliver`
//! messages to the application and `Event`s to whatever reports session
//! status to the user.

use crate::{
    coder::MessageBox,
    identity::{Identity, MessageId},
    message::{Message, RejectCause, TerminateCause},
    session::SessionId,
};

/// Something the caller must do after a processor call.
#[derive(Debug, Clone, PartialEq)]
pub enum FsAction {
    /// Hand a box to the transport. It is already tracked by the message
    /// queue unless it carries `NO_SERVER_ACK`.
    Send(MessageBox),

    /// Pass a decrypted message to the application.
    Deliver(Message),

    /// Report a session status change.
    Event(FsEvent),
}

/// Session status changes worth surfacing to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEvent {
    /// We sent an `Init` for a new session.
    SessionInitiated {
        /// Peer the session is with
        peer: Identity,
        /// New session
        session_id: SessionId,
    },

    /// We accepted a peer's `Init`.
    ResponderSessionEstablished {
        /// Peer the session is with
        peer: Identity,
        /// New session
        session_id: SessionId,
        /// Older 4-DH sessions were discarded in favor of this one
        preempted: bool,
    },

    /// The peer accepted our `Init`; the session is now 4-DH.
    InitiatorSessionEstablished {
        /// Peer the session is with
        peer: Identity,
        /// Upgraded session
        session_id: SessionId,
    },

    /// A message or `Accept` referred to a session we do not have.
    SessionNotFound {
        /// Sender
        peer: Identity,
        /// Unknown session
        session_id: SessionId,
    },

    /// The peer could not process one of our messages.
    RejectReceived {
        /// Peer that rejected
        peer: Identity,
        /// Session the rejected message used
        session_id: SessionId,
        /// Our rejected message
        rejected_message_id: MessageId,
        /// Reason given by the peer
        cause: RejectCause,
    },

    /// A session ended, by our choice or the peer's.
    SessionTerminated {
        /// Peer the session was with
        peer: Identity,
        /// Ended session
        session_id: SessionId,
        /// Reason given when the session was terminated
        cause: TerminateCause,
    },

    /// Ratchet positions were skipped to reach an incoming message.
    MessagesSkipped {
        /// Sender
        peer: Identity,
        /// Session used
        session_id: SessionId,
        /// Number of skipped positions
        count: u64,
    },

    /// The first 4-DH message from the peer arrived.
    First4DhMessageReceived {
        /// Sender
        peer: Identity,
        /// Session used
        session_id: SessionId,
    },

    /// A message arrived behind the ratchet and was dropped.
    MessageOutOfOrder {
        /// Sender
        peer: Identity,
        /// Session used
        session_id: SessionId,
        /// Dropped message
        message_id: MessageId,
    },

    /// A session message could not be decrypted; the session was discarded
    /// and a `Reject` sent.
    DecryptionFailed {
        /// Sender
        peer: Identity,
        /// Discarded session
        session_id: SessionId,
        /// Undecryptable message
        message_id: MessageId,
        /// Cause sent back in the `Reject`
        cause: RejectCause,
    },

    /// A peer we share a session with sent a message that could have been
    /// forward-secure but used the long-term keys.
    MessageWithoutForwardSecurity {
        /// Sender
        peer: Identity,
        /// Session the message should have used
        session_id: SessionId,
        /// Message in question (still delivered)
        message_id: MessageId,
    },
}

impl FsEvent {
    /// Peer the event concerns.
    pub fn peer(&self) -> Identity {
        match self {
            Self::SessionInitiated { peer, .. }
            | Self::ResponderSessionEstablished { peer, .. }
            | Self::InitiatorSessionEstablished { peer, .. }
            | Self::SessionNotFound { peer, .. }
            | Self::RejectReceived { peer, .. }
            | Self::SessionTerminated { peer, .. }
            | Self::MessagesSkipped { peer, .. }
            | Self::First4DhMessageReceived { peer, .. }
            | Self::MessageOutOfOrder { peer, .. }
            | Self::DecryptionFailed { peer, .. }
            | Self::MessageWithoutForwardSecurity { peer, .. } => *peer,
        }
    }
}

//! Protocol messages.
//!
//! A closed set of message kinds, each with a one-byte type and a body
//! layout. The body codec lives here; framing, padding and encryption are
//! the coder's job.
//!
//! | Type   | Kind                      | Body                                   |
//! |--------|---------------------------|----------------------------------------|
//! | `0x01` | text                      | UTF-8                                  |
//! | `0x10` | location                  | `lat,lng[,accuracy]` + `\n` + name     |
//! | `0x80` | delivery receipt          | receipt type (u8), message ids (8 LE)* |
//! | `0x90` | typing indicator          | 0 or 1                                 |
//! | `0xa0` | forward-security control  | control type (u8), payload             |
//! | `0xfc` | empty (session refresh)   | none                                   |

use std::{fmt, ops::BitOr};

use serde::{Deserialize, Serialize};

use crate::{
    error::MalformedBody,
    identity::{Identity, MessageId},
    session::{HANDSHAKE_PAYLOAD_LEN, HandshakePayload, SESSION_ID_LEN, SessionId},
};

/// Wire type of a text message
pub const TYPE_TEXT: u8 = 0x01;
/// Wire type of a location message
pub const TYPE_LOCATION: u8 = 0x10;
/// Wire type of a delivery receipt
pub const TYPE_DELIVERY_RECEIPT: u8 = 0x80;
/// Wire type of a typing indicator
pub const TYPE_TYPING_INDICATOR: u8 = 0x90;
/// Wire type of a forward-security control message
pub const TYPE_FORWARD_SECURITY: u8 = 0xa0;
/// Wire type of an empty message
pub const TYPE_EMPTY: u8 = 0xfc;

const CONTROL_INIT: u8 = 0x01;
const CONTROL_ACCEPT: u8 = 0x02;
const CONTROL_REJECT: u8 = 0x03;
const CONTROL_TERMINATE: u8 = 0x04;

/// Delivery flags carried in the clear next to the box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// Server should send a push notification
    pub const SEND_PUSH: Self = Self(0x01);
    /// Server must not queue the message when the recipient is offline
    pub const NO_SERVER_QUEUING: Self = Self(0x02);
    /// Server does not acknowledge the message
    pub const NO_SERVER_ACK: Self = Self(0x04);
    /// Message is part of a group conversation
    pub const GROUP: Self = Self(0x10);
    /// Server may drop the message after a short time
    pub const SHORT_LIVED: Self = Self(0x20);

    /// No flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw flag bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Wrap raw bits; unknown bits are kept.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Kind of delivery receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiptType {
    /// Message arrived on the recipient's device
    Received,
    /// Recipient opened the message
    Read,
    /// Recipient acknowledged (thumbs up)
    UserAck,
    /// Recipient declined (thumbs down)
    UserDec,
}

impl ReceiptType {
    fn to_wire(self) -> u8 {
        match self {
            Self::Received => 1,
            Self::Read => 2,
            Self::UserAck => 3,
            Self::UserDec => 4,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Received),
            2 => Some(Self::Read),
            3 => Some(Self::UserAck),
            4 => Some(Self::UserDec),
            _ => None,
        }
    }
}

/// Why a peer rejected a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectCause {
    /// The session id is not known to the receiver
    UnknownSession,
    /// The session exists but could not decrypt the message
    StateMismatch,
}

impl RejectCause {
    fn to_wire(self) -> u8 {
        match self {
            Self::UnknownSession => 0,
            Self::StateMismatch => 1,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::UnknownSession),
            1 => Some(Self::StateMismatch),
            _ => None,
        }
    }
}

impl fmt::Display for RejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSession => f.write_str("unknown session"),
            Self::StateMismatch => f.write_str("state mismatch"),
        }
    }
}

/// Why a session was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminateCause {
    /// The receiver of an `Accept` does not know the session
    UnknownSession,
    /// The session was reset after an error
    Reset,
    /// The sender turned forward security off
    DisabledByLocal,
    /// The sender learned the peer turned forward security off
    DisabledByRemote,
}

impl TerminateCause {
    /// Whether the terminating side starts a fresh session afterwards.
    pub fn renews_session(self) -> bool {
        matches!(self, Self::UnknownSession | Self::Reset)
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::UnknownSession => 0,
            Self::Reset => 1,
            Self::DisabledByLocal => 2,
            Self::DisabledByRemote => 3,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::UnknownSession),
            1 => Some(Self::Reset),
            2 => Some(Self::DisabledByLocal),
            3 => Some(Self::DisabledByRemote),
            _ => None,
        }
    }
}

impl fmt::Display for TerminateCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSession => f.write_str("unknown session"),
            Self::Reset => f.write_str("reset"),
            Self::DisabledByLocal => f.write_str("disabled by local"),
            Self::DisabledByRemote => f.write_str("disabled by remote"),
        }
    }
}

/// Forward-security control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsControl {
    /// Initiator offers a new session
    Init(HandshakePayload),
    /// Responder accepts a session
    Accept(HandshakePayload),
    /// Receiver could not process a session message
    Reject {
        /// Session the rejected message used
        session_id: SessionId,
        /// Rejected message
        rejected_message_id: MessageId,
        /// Reason
        cause: RejectCause,
    },
    /// Sender discarded a session
    Terminate {
        /// Discarded session
        session_id: SessionId,
        /// Reason
        cause: TerminateCause,
    },
}

impl FsControl {
    /// Session the control message refers to.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Init(payload) | Self::Accept(payload) => payload.session_id,
            Self::Reject { session_id, .. } | Self::Terminate { session_id, .. } => *session_id,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Init(payload) => {
                out.push(CONTROL_INIT);
                out.extend_from_slice(&payload.encode());
            },
            Self::Accept(payload) => {
                out.push(CONTROL_ACCEPT);
                out.extend_from_slice(&payload.encode());
            },
            Self::Reject { session_id, rejected_message_id, cause } => {
                out.push(CONTROL_REJECT);
                out.extend_from_slice(session_id.as_bytes());
                out.extend_from_slice(&rejected_message_id.to_le_bytes());
                out.push(cause.to_wire());
            },
            Self::Terminate { session_id, cause } => {
                out.push(CONTROL_TERMINATE);
                out.extend_from_slice(session_id.as_bytes());
                out.push(cause.to_wire());
            },
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, MalformedBody> {
        let Some((&control_type, payload)) = bytes.split_first() else {
            return Err(MalformedBody { reason: "empty control message" });
        };

        match control_type {
            CONTROL_INIT | CONTROL_ACCEPT => {
                if payload.len() != HANDSHAKE_PAYLOAD_LEN {
                    return Err(MalformedBody { reason: "bad handshake length" });
                }
                let payload = HandshakePayload::decode(payload)
                    .map_err(|_| MalformedBody { reason: "bad handshake payload" })?;
                Ok(if control_type == CONTROL_INIT {
                    Self::Init(payload)
                } else {
                    Self::Accept(payload)
                })
            },
            CONTROL_REJECT => {
                if payload.len() != SESSION_ID_LEN + 8 + 1 {
                    return Err(MalformedBody { reason: "bad reject length" });
                }
                let session_id = read_session_id(payload);
                let rejected_message_id = MessageId::from_le_bytes(read_array(
                    &payload[SESSION_ID_LEN..SESSION_ID_LEN + 8],
                ));
                let cause = RejectCause::from_wire(payload[SESSION_ID_LEN + 8])
                    .ok_or(MalformedBody { reason: "unknown reject cause" })?;
                Ok(Self::Reject { session_id, rejected_message_id, cause })
            },
            CONTROL_TERMINATE => {
                if payload.len() != SESSION_ID_LEN + 1 {
                    return Err(MalformedBody { reason: "bad terminate length" });
                }
                let cause = TerminateCause::from_wire(payload[SESSION_ID_LEN])
                    .ok_or(MalformedBody { reason: "unknown terminate cause" })?;
                Ok(Self::Terminate { session_id: read_session_id(payload), cause })
            },
            _ => Err(MalformedBody { reason: "unknown control type" }),
        }
    }
}

/// A shared location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees, -90..=90
    pub latitude: f64,
    /// Longitude in degrees, -180..=180
    pub longitude: f64,
    /// Accuracy radius in meters
    pub accuracy: Option<f64>,
    /// Place name
    pub name: Option<String>,
}

impl Location {
    fn encode(&self, out: &mut Vec<u8>) {
        let mut text = format!("{},{}", self.latitude, self.longitude);
        if let Some(accuracy) = self.accuracy {
            text.push_str(&format!(",{accuracy}"));
        }
        if let Some(name) = &self.name {
            text.push('\n');
            text.push_str(name);
        }
        out.extend_from_slice(text.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, MalformedBody> {
        let text =
            std::str::from_utf8(bytes).map_err(|_| MalformedBody { reason: "location not UTF-8" })?;
        let (coordinates, name) = match text.split_once('\n') {
            Some((coordinates, name)) => (coordinates, Some(name.to_owned())),
            None => (text, None),
        };

        let parse = |part: &str| {
            part.trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or(MalformedBody { reason: "bad location coordinate" })
        };

        let parts: Vec<&str> = coordinates.split(',').collect();
        let (latitude, longitude, accuracy) = match parts.as_slice() {
            [lat, lng] => (parse(lat)?, parse(lng)?, None),
            [lat, lng, acc] => (parse(lat)?, parse(lng)?, Some(parse(acc)?)),
            _ => return Err(MalformedBody { reason: "bad location field count" }),
        };

        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(MalformedBody { reason: "location out of range" });
        }

        Ok(Self { latitude, longitude, accuracy, name })
    }
}

/// Message content, one variant per message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Plain text
    Text(String),
    /// Shared location
    Location(Location),
    /// Receipt for one or more earlier messages
    DeliveryReceipt {
        /// Kind of receipt
        receipt_type: ReceiptType,
        /// Messages the receipt covers (at least one)
        message_ids: Vec<MessageId>,
    },
    /// Typing started (`true`) or stopped (`false`)
    TypingIndicator(bool),
    /// Session management
    ForwardSecurity(FsControl),
    /// No content; advances the session (refresh)
    Empty,
}

impl MessageBody {
    /// Wire type byte.
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::Text(_) => TYPE_TEXT,
            Self::Location(_) => TYPE_LOCATION,
            Self::DeliveryReceipt { .. } => TYPE_DELIVERY_RECEIPT,
            Self::TypingIndicator(_) => TYPE_TYPING_INDICATOR,
            Self::ForwardSecurity(_) => TYPE_FORWARD_SECURITY,
            Self::Empty => TYPE_EMPTY,
        }
    }

    /// Flags a message of this kind is sent with by default.
    pub fn default_flags(&self) -> MessageFlags {
        match self {
            Self::Text(_) | Self::Location(_) => MessageFlags::SEND_PUSH,
            Self::TypingIndicator(_) => {
                MessageFlags::NO_SERVER_QUEUING | MessageFlags::NO_SERVER_ACK
            },
            Self::DeliveryReceipt { .. } | Self::ForwardSecurity(_) | Self::Empty => {
                MessageFlags::empty()
            },
        }
    }

    /// Whether this kind may travel inside a forward-secure session.
    ///
    /// Control messages manage sessions and always use the long-term keys.
    pub fn allows_session(&self) -> bool {
        !matches!(self, Self::ForwardSecurity(_))
    }

    /// Append the body (without type byte) to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Text(text) => out.extend_from_slice(text.as_bytes()),
            Self::Location(location) => location.encode(out),
            Self::DeliveryReceipt { receipt_type, message_ids } => {
                out.push(receipt_type.to_wire());
                for id in message_ids {
                    out.extend_from_slice(&id.to_le_bytes());
                }
            },
            Self::TypingIndicator(typing) => out.push(u8::from(*typing)),
            Self::ForwardSecurity(control) => control.encode(out),
            Self::Empty => {},
        }
    }

    /// Parse a body of wire type `type_byte`.
    pub fn decode(type_byte: u8, bytes: &[u8]) -> Result<Self, MalformedBody> {
        match type_byte {
            TYPE_TEXT => String::from_utf8(bytes.to_vec())
                .map(Self::Text)
                .map_err(|_| MalformedBody { reason: "text not UTF-8" }),
            TYPE_LOCATION => Location::decode(bytes).map(Self::Location),
            TYPE_DELIVERY_RECEIPT => {
                let Some((&receipt_type, ids)) = bytes.split_first() else {
                    return Err(MalformedBody { reason: "empty receipt" });
                };
                let receipt_type = ReceiptType::from_wire(receipt_type)
                    .ok_or(MalformedBody { reason: "unknown receipt type" })?;
                if ids.is_empty() || ids.len() % 8 != 0 {
                    return Err(MalformedBody { reason: "bad receipt id list" });
                }
                let message_ids =
                    ids.chunks_exact(8).map(|id| MessageId::from_le_bytes(read_array(id))).collect();
                Ok(Self::DeliveryReceipt { receipt_type, message_ids })
            },
            TYPE_TYPING_INDICATOR => match bytes {
                [0] => Ok(Self::TypingIndicator(false)),
                [1] => Ok(Self::TypingIndicator(true)),
                _ => Err(MalformedBody { reason: "bad typing indicator" }),
            },
            TYPE_FORWARD_SECURITY => FsControl::decode(bytes).map(Self::ForwardSecurity),
            TYPE_EMPTY if bytes.is_empty() => Ok(Self::Empty),
            TYPE_EMPTY => Err(MalformedBody { reason: "empty message with body" }),
            _ => Err(MalformedBody { reason: "unknown message type" }),
        }
    }
}

/// A plaintext protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Sender
    pub from: Identity,
    /// Recipient
    pub to: Identity,
    /// Sender-chosen id
    pub id: MessageId,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at: u64,
    /// Delivery flags
    pub flags: MessageFlags,
    /// Sender's public nickname
    pub nickname: Option<String>,
    /// Content
    pub body: MessageBody,
}

impl Message {
    /// Create a message with the body's default flags and no nickname.
    pub fn new(
        from: Identity,
        to: Identity,
        id: MessageId,
        created_at: u64,
        body: MessageBody,
    ) -> Self {
        let flags = body.default_flags();
        Self { from, to, id, created_at, flags, nickname: None, body }
    }

    /// Replace the delivery flags.
    #[must_use]
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the nickname. An empty nickname is the same as none, which is
    /// how it travels on the wire.
    #[must_use]
    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into()).filter(|nickname| !nickname.is_empty());
        self
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let Ok(array) = bytes.try_into() else {
        unreachable!("caller checked the length");
    };
    array
}

fn read_session_id(bytes: &[u8]) -> SessionId {
    SessionId::from_bytes(read_array(&bytes[..SESSION_ID_LEN]))
}

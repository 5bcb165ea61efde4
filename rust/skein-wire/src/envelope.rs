use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-call correlation number.
///
/// Assigned by the client when a call starts and echoed back by the server
/// in the REPLY or EXCEPTION that answers it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub i32);

impl SequenceId {
    /// Placeholder id used when the id of the offending message is unknown
    /// (for example, when its envelope could not be decoded).
    pub const NONE: SequenceId = SequenceId(0);

    pub fn get(self) -> i32 {
        self.0
    }
}

impl From<i32> for SequenceId {
    fn from(value: i32) -> Self {
        SequenceId(value)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message kind carried in every envelope.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    /// A request that expects exactly one REPLY or EXCEPTION.
    Call = 1,
    /// A successful answer to a CALL.
    Reply = 2,
    /// A structured application-level failure answering a CALL.
    Exception = 3,
    /// A request for which no answer is sent.
    Oneway = 4,
}

impl MessageKind {
    /// Whether this kind answers a call (and so must be correlated).
    pub fn is_response(self) -> bool {
        matches!(self, MessageKind::Reply | MessageKind::Exception)
    }

    /// Whether this kind starts a call on the server.
    pub fn is_request(self) -> bool {
        matches!(self, MessageKind::Call | MessageKind::Oneway)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = UnknownMessageKind;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Reply),
            3 => Ok(MessageKind::Exception),
            4 => Ok(MessageKind::Oneway),
            _ => Err(UnknownMessageKind(v)),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Call => write!(f, "CALL"),
            MessageKind::Reply => write!(f, "REPLY"),
            MessageKind::Exception => write!(f, "EXCEPTION"),
            MessageKind::Oneway => write!(f, "ONEWAY"),
        }
    }
}

/// Error when converting from an unknown message kind value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMessageKind(pub u8);

impl fmt::Display for UnknownMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind: {}", self.0)
    }
}

impl std::error::Error for UnknownMessageKind {}

/// Logical message header: method name, kind and sequence id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub kind: MessageKind,
    pub seq_id: SequenceId,
}

impl Envelope {
    pub fn new(name: impl Into<String>, kind: MessageKind, seq_id: SequenceId) -> Self {
        Envelope {
            name: name.into(),
            kind,
            seq_id,
        }
    }

    pub fn call(name: impl Into<String>, seq_id: SequenceId) -> Self {
        Self::new(name, MessageKind::Call, seq_id)
    }

    pub fn oneway(name: impl Into<String>, seq_id: SequenceId) -> Self {
        Self::new(name, MessageKind::Oneway, seq_id)
    }

    /// Build the REPLY envelope answering this request.
    pub fn reply(&self) -> Self {
        Self::new(self.name.clone(), MessageKind::Reply, self.seq_id)
    }

    /// Build the EXCEPTION envelope answering this request.
    pub fn exception(&self) -> Self {
        Self::new(self.name.clone(), MessageKind::Exception, self.seq_id)
    }
}

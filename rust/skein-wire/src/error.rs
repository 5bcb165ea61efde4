use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric kind of an application-level error.
///
/// Carried in the body of EXCEPTION replies. The numbering follows the
/// long-standing cross-language convention so peers in other languages
/// can interpret it; values this side does not know decode as
/// [`ErrorKind::Unknown`].
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ErrorKind {
    Unknown = 0,
    UnknownMethod = 1,
    InvalidMessageType = 2,
    WrongMethodName = 3,
    BadSequenceId = 4,
    MissingResult = 5,
    InternalError = 6,
    ProtocolError = 7,
    InvalidTransform = 8,
    InvalidProtocol = 9,
    UnsupportedClientType = 10,
    TimedOut = 11,
    /// A fault the handler declares as part of its contract.
    Declared = 100,
}

impl ErrorKind {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::UnknownMethod => "unknown method",
            ErrorKind::InvalidMessageType => "invalid message type",
            ErrorKind::WrongMethodName => "wrong method name",
            ErrorKind::BadSequenceId => "bad sequence id",
            ErrorKind::MissingResult => "missing result",
            ErrorKind::InternalError => "internal error",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::InvalidTransform => "invalid transform",
            ErrorKind::InvalidProtocol => "invalid protocol",
            ErrorKind::UnsupportedClientType => "unsupported client type",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::Declared => "declared",
        }
    }
}

impl From<i32> for ErrorKind {
    fn from(v: i32) -> Self {
        match v {
            1 => ErrorKind::UnknownMethod,
            2 => ErrorKind::InvalidMessageType,
            3 => ErrorKind::WrongMethodName,
            4 => ErrorKind::BadSequenceId,
            5 => ErrorKind::MissingResult,
            6 => ErrorKind::InternalError,
            7 => ErrorKind::ProtocolError,
            8 => ErrorKind::InvalidTransform,
            9 => ErrorKind::InvalidProtocol,
            10 => ErrorKind::UnsupportedClientType,
            11 => ErrorKind::TimedOut,
            100 => ErrorKind::Declared,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<ErrorKind> for i32 {
    fn from(kind: ErrorKind) -> i32 {
        kind.as_i32()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_i32())
    }
}

/// Structured fault sent as the body of an EXCEPTION reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApplicationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ApplicationError {
            kind,
            message: message.into(),
        }
    }

    /// A fault the handler declares as part of its contract.
    pub fn declared(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Declared, message)
    }

    pub fn unknown_method(name: &str) -> Self {
        Self::new(
            ErrorKind::UnknownMethod,
            format!("Invalid method name: '{name}'"),
        )
    }

    pub fn internal(name: &str) -> Self {
        Self::new(
            ErrorKind::InternalError,
            format!("Internal error processing {name}"),
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, message)
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApplicationError {}

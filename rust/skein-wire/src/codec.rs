use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::Envelope;

/// Value encoding used for envelopes and bodies.
///
/// Both peers of a connection must agree on the protocol; it is part of
/// client and server configuration rather than of each message.
#[repr(u16)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Postcard: compact binary format.
    #[default]
    Postcard = 1,
    /// JSON: human-readable format (for debugging/tooling and browser peers).
    Json = 2,
}

impl Protocol {
    pub fn encode<T: Serialize>(self, val: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Protocol::Postcard => PostcardCodec::encode(val).map_err(CodecError::Postcard),
            Protocol::Json => JsonCodec::encode(val).map_err(CodecError::Json),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, buf: &[u8]) -> Result<T, CodecError> {
        match self {
            Protocol::Postcard => PostcardCodec::decode(buf),
            Protocol::Json => JsonCodec::decode(buf).map_err(CodecError::Json),
        }
    }

    /// Encode an envelope followed by a body value into one message.
    pub fn write_message<T: Serialize>(
        self,
        envelope: &Envelope,
        body: &T,
    ) -> Result<Bytes, CodecError> {
        let body = self.encode(body)?;
        self.assemble(envelope, &body)
    }

    /// Encode an envelope followed by an already-encoded body.
    pub fn assemble(self, envelope: &Envelope, body: &[u8]) -> Result<Bytes, CodecError> {
        let header = self.encode(envelope)?;
        let mut buf = BytesMut::with_capacity(header.len() + body.len());
        buf.put_slice(&header);
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    /// Split a message into its envelope and the still-encoded body.
    ///
    /// The body is a zero-copy slice of `message`.
    pub fn read_envelope(self, message: &Bytes) -> Result<(Envelope, Bytes), CodecError> {
        if message.is_empty() {
            return Err(CodecError::EmptyMessage);
        }
        match self {
            Protocol::Postcard => {
                let (envelope, rest) = postcard::take_from_bytes::<Envelope>(message)
                    .map_err(CodecError::Postcard)?;
                let offset = message.len() - rest.len();
                Ok((envelope, message.slice(offset..)))
            }
            Protocol::Json => {
                let mut stream =
                    serde_json::Deserializer::from_slice(message).into_iter::<Envelope>();
                match stream.next() {
                    Some(Ok(envelope)) => {
                        let offset = stream.byte_offset();
                        Ok((envelope, message.slice(offset..)))
                    }
                    Some(Err(e)) => Err(CodecError::Json(e)),
                    None => Err(CodecError::EmptyMessage),
                }
            }
        }
    }
}

impl TryFrom<u16> for Protocol {
    type Error = UnknownProtocol;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Protocol::Postcard),
            2 => Ok(Protocol::Json),
            _ => Err(UnknownProtocol(v.to_string())),
        }
    }
}

impl From<Protocol> for u16 {
    fn from(protocol: Protocol) -> u16 {
        protocol as u16
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postcard" | "compact" | "binary" => Ok(Protocol::Postcard),
            "json" => Ok(Protocol::Json),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Postcard => write!(f, "postcard"),
            Protocol::Json => write!(f, "json"),
        }
    }
}

/// Error when a protocol name or number is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProtocol(pub String);

impl fmt::Display for UnknownProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol: {}", self.0)
    }
}

impl std::error::Error for UnknownProtocol {}

/// Failure to encode or decode a value.
#[derive(Debug)]
pub enum CodecError {
    Postcard(postcard::Error),
    Json(serde_json::Error),
    /// The message had no bytes at all, so not even an envelope.
    EmptyMessage,
    /// A value decoded but this many bytes were left after it.
    TrailingBytes(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Postcard(e) => write!(f, "postcard: {e}"),
            CodecError::Json(e) => write!(f, "json: {e}"),
            CodecError::EmptyMessage => write!(f, "empty message"),
            CodecError::TrailingBytes(n) => write!(f, "{n} trailing bytes after value"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Postcard(e) => Some(e),
            CodecError::Json(e) => Some(e),
            CodecError::EmptyMessage | CodecError::TrailingBytes(_) => None,
        }
    }
}

/// Codec trait for message serialization.
///
/// Implementations provide encoding/decoding for specific serialization formats.
/// Each codec declares its protocol and associated error types.
pub trait Codec {
    /// The protocol this codec implements.
    const PROTOCOL: Protocol;

    /// Error type returned by encode operations.
    type EncodeError: std::error::Error;

    /// Error type returned by decode operations.
    type DecodeError: std::error::Error;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Postcard codec: compact binary format using postcard serialization.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const PROTOCOL: Protocol = Protocol::Postcard;
    type EncodeError = postcard::Error;
    type DecodeError = CodecError;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    /// The whole buffer must be the value; leftover bytes are an error.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        let (val, rest) = postcard::take_from_bytes(buf).map_err(CodecError::Postcard)?;
        if !rest.is_empty() {
            return Err(CodecError::TrailingBytes(rest.len()));
        }
        Ok(val)
    }
}

/// JSON codec: human-readable format using serde_json.
///
/// Larger and slower than postcard, but messages can be read as text and
/// produced by peers that only speak JSON.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const PROTOCOL: Protocol = Protocol::Json;
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}

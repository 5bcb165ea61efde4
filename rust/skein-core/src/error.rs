//! Error types for transports, framing, the call registry and calls.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use skein_wire::{ApplicationError, CodecError, ErrorKind, SequenceId};

/// A length prefix or reassembled message broke the size limit.
///
/// Always connection-fatal: the stream can no longer be trusted to be
/// aligned on message boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    TooLarge { len: usize, max: usize },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::TooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds limit of {max} bytes")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// Transport-level errors. These fail every call on the connection.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Connection was closed.
    Closed,
    /// I/O error, shared so the same cause can be handed to every pending call.
    Io(Arc<io::Error>),
    Framing(FramingError),
    /// Nobody listens on this bus address.
    NoListener(String),
    /// Another listener already owns this bus address.
    AddressInUse(String),
    WebSocket(String),
    Http(String),
    /// HTTP peer answered with a status other than 200.
    HttpStatus(u16),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
            TransportError::Framing(e) => write!(f, "framing error: {e}"),
            TransportError::NoListener(addr) => write!(f, "no listener on address {addr:?}"),
            TransportError::AddressInUse(addr) => write!(f, "address {addr:?} already in use"),
            TransportError::WebSocket(e) => write!(f, "websocket error: {e}"),
            TransportError::Http(e) => write!(f, "http error: {e}"),
            TransportError::HttpStatus(status) => write!(f, "unexpected http status {status}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e.as_ref()),
            TransportError::Framing(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

impl From<FramingError> for TransportError {
    fn from(e: FramingError) -> Self {
        TransportError::Framing(e)
    }
}

/// Lifecycle faults detected by the pending-call registry.
///
/// Any of these means a call was completed twice or the wrong call was
/// about to be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyRegistered(SequenceId),
    NotRegistered(SequenceId),
    /// The id is registered, but to a different call.
    Mismatch(SequenceId),
    Full { max: usize },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(id) => {
                write!(f, "sequence id {id} is already registered")
            }
            RegistryError::NotRegistered(id) => write!(f, "sequence id {id} is not registered"),
            RegistryError::Mismatch(id) => {
                write!(f, "sequence id {id} is registered to a different call")
            }
            RegistryError::Full { max } => {
                write!(f, "too many pending calls (max {max})")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Why a call failed. Every call resolves exactly once, with a value or one of these.
#[derive(Debug)]
pub enum RpcError {
    /// The connection failed while the call was outstanding.
    Transport(TransportError),
    /// The request could not be encoded.
    Encode(CodecError),
    /// The reply (or its envelope) could not be decoded.
    Decode(CodecError),
    /// The reply answered a different method than the one called.
    WrongMethodName { expected: String, actual: String },
    /// The server answered with an EXCEPTION.
    Application(ApplicationError),
    /// No reply arrived within the call timeout.
    TimedOut { seq_id: SequenceId, after: Duration },
    Registry(RegistryError),
    /// The client was closed before the call could be sent.
    Closed,
}

impl RpcError {
    /// The application error kind this failure corresponds to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Transport(_) | RpcError::Closed => ErrorKind::Unknown,
            RpcError::Encode(_) | RpcError::Decode(_) => ErrorKind::ProtocolError,
            RpcError::WrongMethodName { .. } => ErrorKind::WrongMethodName,
            RpcError::Application(e) => e.kind,
            RpcError::TimedOut { .. } => ErrorKind::TimedOut,
            RpcError::Registry(_) => ErrorKind::InternalError,
        }
    }

    /// The EXCEPTION body, if the server sent one.
    pub fn application(&self) -> Option<&ApplicationError> {
        match self {
            RpcError::Application(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(e) => write!(f, "transport error: {e}"),
            RpcError::Encode(e) => write!(f, "failed to encode request: {e}"),
            RpcError::Decode(e) => write!(f, "failed to decode reply: {e}"),
            RpcError::WrongMethodName { expected, actual } => {
                write!(f, "reply for method {actual:?} answered a call to {expected:?}")
            }
            RpcError::Application(e) => write!(f, "{e}"),
            RpcError::TimedOut { seq_id, after } => write!(
                f,
                "No reply after {}ms for method call of seqid: {seq_id}",
                after.as_millis()
            ),
            RpcError::Registry(e) => write!(f, "registry error: {e}"),
            RpcError::Closed => write!(f, "client closed"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Transport(e) => Some(e),
            RpcError::Encode(e) | RpcError::Decode(e) => Some(e),
            RpcError::Application(e) => Some(e),
            RpcError::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        RpcError::Transport(e)
    }
}

impl From<RegistryError> for RpcError {
    fn from(e: RegistryError) -> Self {
        RpcError::Registry(e)
    }
}

impl From<ApplicationError> for RpcError {
    fn from(e: ApplicationError) -> Self {
        RpcError::Application(e)
    }
}

/// Invalid configuration, reported before anything is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment override could not be parsed.
    InvalidEnv {
        var: &'static str,
        value: String,
    },
    /// A blocking handler was registered on a server that has no worker threads.
    BlockingHandlerOnReactor { method: String },
    /// A path must start with `/`.
    InvalidPath(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidEnv { var, value } => {
                write!(f, "invalid value {value:?} for {var}")
            }
            ConfigError::BlockingHandlerOnReactor { method } => write!(
                f,
                "blocking handler {method:?} must run on a server with worker threads"
            ),
            ConfigError::InvalidPath(path) => write!(f, "path {path:?} must start with '/'"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Why a server stopped (or never started).
#[derive(Debug)]
pub enum ServeError {
    Config(ConfigError),
    Transport(TransportError),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeError::Config(e) => write!(f, "configuration error: {e}"),
            ServeError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServeError::Config(e) => Some(e),
            ServeError::Transport(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServeError {
    fn from(e: ConfigError) -> Self {
        ServeError::Config(e)
    }
}

impl From<TransportError> for ServeError {
    fn from(e: TransportError) -> Self {
        ServeError::Transport(e)
    }
}

impl From<io::Error> for ServeError {
    fn from(e: io::Error) -> Self {
        ServeError::Transport(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_message_names_seq_id() {
        let err = RpcError::TimedOut {
            seq_id: SequenceId(12),
            after: Duration::from_millis(50),
        };
        assert_eq!(
            err.to_string(),
            "No reply after 50ms for method call of seqid: 12"
        );
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn application_kind_passes_through() {
        let err = RpcError::from(ApplicationError::unknown_method("fooBar"));
        assert_eq!(err.kind(), ErrorKind::UnknownMethod);
        assert!(err.application().is_some());
    }

    #[test]
    fn transport_error_is_shared_between_calls() {
        let err = TransportError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let a = RpcError::from(err.clone());
        let b = RpcError::from(err);
        assert!(a.to_string().contains("reset"));
        assert!(b.to_string().contains("reset"));
        assert_eq!(a.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn framing_error_display() {
        let err = FramingError::TooLarge { len: 100, max: 10 };
        let s = TransportError::from(err).to_string();
        assert!(s.contains("100"));
        assert!(s.contains("10"));
    }
}

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub use skein_core::{
    ApplicationError,
    // Client
    ClientConfig,
    ConfigError,
    // Server
    DispatchError,
    Envelope,
    ErrorKind,
    ExecutionMode,
    HandlerError,
    MessageKind,
    MessageProcessor,
    MethodHandler,
    MultiplexedProcessor,
    Processor,
    ProcessorBuilder,
    Protocol,
    RpcClient,
    RpcError,
    SequenceId,
    ServeError,
    ServerConfig,
    ThreadingModel,
    // Transport types (for advanced use)
    Transport,
    TransportError,
    serve_connection,
};

#[cfg(feature = "mem")]
pub use skein_core::serve_bus;
#[cfg(feature = "http")]
pub use skein_core::serve_http;
#[cfg(feature = "stream")]
pub use skein_core::serve_tcp;
#[cfg(feature = "websocket")]
pub use skein_core::serve_websocket;

// Wire-level building blocks for custom transports and peers.
pub use skein_core as core;
pub use skein_wire as wire;

pub use serde;

#[cfg(feature = "tracing-setup")]
mod tracing_setup;
#[cfg(feature = "tracing-setup")]
pub use tracing_setup::init_tracing;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use skein::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ClientConfig, HandlerError, Processor, Protocol, RpcClient, RpcError, ServerConfig,
        ThreadingModel, Transport,
    };
    pub use serde::{Deserialize, Serialize};
}

/// Transport implementations, each behind its feature flag.
///
/// ```toml
/// [dependencies]
/// skein = { version = "0.1", features = ["websocket", "http"] }
/// ```
pub mod transport {
    #[cfg(feature = "mem")]
    pub use skein_core::transport::mem::{BusListener, EventBus, MemTransport};

    #[cfg(feature = "stream")]
    pub use skein_core::transport::stream::StreamTransport;

    #[cfg(feature = "websocket")]
    pub use skein_core::transport::websocket::WebSocketTransport;

    #[cfg(feature = "http")]
    pub use skein_core::transport::http::{HttpClientTransport, HttpRoutes};
}

#[cfg(feature = "mem")]
pub use transport::EventBus;

#[cfg(feature = "http")]
pub use transport::HttpRoutes;

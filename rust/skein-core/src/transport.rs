//! Transport enum and internal backend trait.
//!
//! The public API is the [`Transport`] enum. Each duplex backend lives in its
//! own module under `transport/` and implements the internal
//! [`TransportBackend`] trait. A transport moves whole messages: byte-stream
//! backends frame them, message-oriented backends map them onto their own
//! message boundaries. HTTP is request/response rather than duplex and lives
//! beside the enum in [`http`].

use bytes::Bytes;
use tokio::sync::watch;

use crate::TransportError;

pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    async fn send(&self, message: Bytes) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Bytes, TransportError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "stream")]
    Stream(stream::StreamTransport),
    #[cfg(feature = "websocket")]
    WebSocket(websocket::WebSocketTransport),
}

impl Transport {
    /// Send one whole message.
    pub async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.send(message).await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.send(message).await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.send(message).await,
        }
    }

    /// Receive the next whole message. `Err(Closed)` once the peer is gone
    /// or [`close`](Self::close) was called.
    pub async fn recv(&self) -> Result<Bytes, TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.recv().await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.recv().await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.recv().await,
        }
    }

    /// Close the transport. A pending `recv` on any clone returns `Closed`.
    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.close(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.close(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.is_closed(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.is_closed(),
        }
    }

    #[cfg(feature = "mem")]
    pub fn inproc_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    /// Two stream transports joined by an in-memory pipe.
    #[cfg(feature = "stream")]
    pub fn stream_pair(max_frame_size: usize) -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair(max_frame_size);
        (Transport::Stream(a), Transport::Stream(b))
    }
}

#[cfg(feature = "mem")]
impl From<mem::MemTransport> for Transport {
    fn from(t: mem::MemTransport) -> Self {
        Transport::Mem(t)
    }
}

#[cfg(feature = "stream")]
impl From<stream::StreamTransport> for Transport {
    fn from(t: stream::StreamTransport) -> Self {
        Transport::Stream(t)
    }
}

#[cfg(feature = "websocket")]
impl From<websocket::WebSocketTransport> for Transport {
    fn from(t: websocket::WebSocketTransport) -> Self {
        Transport::WebSocket(t)
    }
}

/// Close signal shared by every clone of a transport.
#[derive(Debug)]
pub(crate) struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Shutdown {
            tx: watch::Sender::new(false),
        }
    }

    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called, including
    /// when that happened before this was polled.
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
#[cfg(feature = "websocket")]
pub mod websocket;

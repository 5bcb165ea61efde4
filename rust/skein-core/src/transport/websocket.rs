use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::{Shutdown, TransportBackend};
use crate::TransportError;
use crate::reassembly::FragmentAssembler;

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// One skein message per WebSocket data message.
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WebSocketInner>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport").finish_non_exhaustive()
    }
}

struct WebSocketInner {
    sink: AsyncMutex<WsSink>,
    source: AsyncMutex<(WsSource, FragmentAssembler)>,
    shutdown: Shutdown,
}

impl WebSocketTransport {
    pub fn new<S>(ws: WebSocketStream<S>, max_message_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let sink: WsSink = Box::pin(sink);
        let source: WsSource = Box::pin(source);
        Self {
            inner: Arc::new(WebSocketInner {
                sink: AsyncMutex::new(sink),
                source: AsyncMutex::new((source, FragmentAssembler::new(max_message_size))),
                shutdown: Shutdown::new(),
            }),
        }
    }

    /// Open a client connection to a `ws://` URL.
    pub async fn connect(url: &str, max_message_size: usize) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(ws_error)?;
        Ok(Self::new(ws, max_message_size))
    }

    /// Complete the server side of the handshake, refusing any request whose
    /// path is not `path`.
    pub async fn accept(
        stream: TcpStream,
        path: &str,
        max_message_size: usize,
    ) -> Result<Self, TransportError> {
        let expected = path.to_string();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == expected {
                Ok(response)
            } else {
                tracing::debug!(path = %request.uri().path(), "refusing websocket upgrade");
                let mut refusal = ErrorResponse::new(Some(format!(
                    "no websocket endpoint at {}",
                    request.uri().path()
                )));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, check_path)
            .await
            .map_err(ws_error)?;
        Ok(Self::new(ws, max_message_size))
    }
}

fn ws_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(e) => TransportError::from(e),
        other => TransportError::WebSocket(other.to_string()),
    }
}

impl TransportBackend for WebSocketTransport {
    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(Message::binary(message)).await.map_err(ws_error)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        let mut guard = self.inner.source.lock().await;
        let (source, assembler) = &mut *guard;
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.wait() => return Err(TransportError::Closed),
                next = source.next() => next,
            };
            let message = match next {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(ws_error(e)),
                Some(Ok(message)) => message,
            };
            match message {
                Message::Binary(data) => return Ok(assembler.push_final(data)?),
                Message::Text(text) => {
                    return Ok(assembler.push_final(Bytes::copy_from_slice(text.as_bytes()))?);
                }
                Message::Frame(frame) => {
                    let is_final = frame.header().is_final;
                    if let Some(message) = assembler.push(&frame.payload()[..], is_final)? {
                        return Ok(message);
                    }
                }
                Message::Close(_) => return Err(TransportError::Closed),
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    fn close(&self) {
        self.inner.shutdown.trigger();
    }

    fn is_closed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }
}

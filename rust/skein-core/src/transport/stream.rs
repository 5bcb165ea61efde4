use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex as AsyncMutex;

use super::{Shutdown, TransportBackend};
use crate::TransportError;
use crate::frame::frame;
use crate::reassembly::FrameDecoder;

/// Capacity of the in-memory pipe behind [`StreamTransport::pair`].
const PIPE_CAPACITY: usize = 65536;

/// Length-prefixed messages over any byte stream (TCP in practice).
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("max_frame_size", &self.inner.max_frame_size)
            .finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<StreamReader>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    shutdown: Shutdown,
    max_frame_size: usize,
}

/// The read half and its connection buffer. Owned by exactly one connection;
/// dropped (with any partial frame) when the connection goes away.
struct StreamReader {
    io: Box<dyn AsyncRead + Unpin + Send + Sync>,
    decoder: FrameDecoder,
    scratch: Vec<u8>,
}

impl StreamTransport {
    pub fn new<S>(stream: S, max_frame_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(StreamReader {
                    io: Box::new(reader),
                    decoder: FrameDecoder::new(max_frame_size),
                    scratch: Vec::new(),
                }),
                writer: AsyncMutex::new(Box::new(writer)),
                shutdown: Shutdown::new(),
                max_frame_size,
            }),
        }
    }

    pub async fn connect(
        addr: impl ToSocketAddrs,
        max_frame_size: usize,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, max_frame_size))
    }

    pub fn pair(max_frame_size: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        (Self::new(a, max_frame_size), Self::new(b, max_frame_size))
    }

    pub fn max_frame_size(&self) -> usize {
        self.inner.max_frame_size
    }
}

impl TransportBackend for StreamTransport {
    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        let framed = frame(&message, self.inner.max_frame_size)?;
        let mut writer = self.inner.writer.lock().await;
        let mut torn = TornWrite {
            shutdown: &self.inner.shutdown,
            armed: true,
        };
        writer.write_all(&framed).await?;
        writer.flush().await?;
        torn.armed = false;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.inner.reader.lock().await;
        let StreamReader {
            io,
            decoder,
            scratch,
        } = &mut *reader;

        loop {
            if let Some(frame) = decoder.next_frame()? {
                return Ok(frame);
            }

            let want = decoder.spare_hint();
            if scratch.len() < want {
                scratch.resize(want, 0);
            }
            let n = tokio::select! {
                _ = self.inner.shutdown.wait() => return Err(TransportError::Closed),
                n = io.read(&mut scratch[..want]) => n?,
            };
            if n == 0 {
                if decoder.buffered_len() > 0 {
                    tracing::debug!(
                        buffered = decoder.buffered_len(),
                        "stream closed mid-frame, discarding partial frame"
                    );
                    decoder.clear();
                }
                return Err(TransportError::Closed);
            }
            decoder.push(&scratch[..n]);
        }
    }

    fn close(&self) {
        self.inner.shutdown.trigger();
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            let _ = futures_util::FutureExt::now_or_never(writer.shutdown());
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }
}

/// Closes the transport if a send is dropped partway through a frame; the
/// peer could not find the next frame boundary after it.
struct TornWrite<'a> {
    shutdown: &'a Shutdown,
    armed: bool,
}

impl Drop for TornWrite<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("send interrupted mid-frame, closing stream");
            self.shutdown.trigger();
        }
    }
}

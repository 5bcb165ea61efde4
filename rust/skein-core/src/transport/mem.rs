//! In-process transport and a tiny address-based bus to connect through.
//!
//! Messages move as whole `Bytes` over bounded channels, so there is no
//! framing. [`EventBus`] lets a server listen on a named address and clients
//! connect to it, the way a process-local message bus would.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Shutdown, TransportBackend};
use crate::TransportError;

const CHANNEL_CAPACITY: usize = 64;
const ACCEPT_BACKLOG: usize = 16;

#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<InProcInner>,
}

#[derive(Debug)]
struct InProcInner {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    shutdown: Shutdown,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let inner_a = Arc::new(InProcInner {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
            shutdown: Shutdown::new(),
        });

        let inner_b = Arc::new(InProcInner {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
            shutdown: Shutdown::new(),
        });

        (Self { inner: inner_a }, Self { inner: inner_b })
    }
}

impl TransportBackend for MemTransport {
    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        let tx = self.inner.tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            _ = self.inner.shutdown.wait() => Err(TransportError::Closed),
            message = rx.recv() => message.ok_or(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.inner.shutdown.trigger();
        // dropping our sender is what the peer's recv observes
        self.inner.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }
}

/// Process-local bus of named addresses.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<MemTransport>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections on `address`.
    pub fn listen(&self, address: &str) -> Result<BusListener, TransportError> {
        let mut listeners = self.listeners.lock();
        if let Some(existing) = listeners.get(address)
            && !existing.is_closed()
        {
            return Err(TransportError::AddressInUse(address.to_string()));
        }
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(address.to_string(), tx);
        tracing::debug!(address, "bus listener registered");
        Ok(BusListener {
            bus: self.clone(),
            address: address.to_string(),
            incoming: rx,
        })
    }

    /// Connect to the listener on `address`.
    pub async fn connect(&self, address: &str) -> Result<MemTransport, TransportError> {
        let accept_tx = self
            .listeners
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::NoListener(address.to_string()))?;
        let (client, server) = MemTransport::pair();
        accept_tx
            .send(server)
            .await
            .map_err(|_| TransportError::NoListener(address.to_string()))?;
        Ok(client)
    }

    pub fn is_listening(&self, address: &str) -> bool {
        self.listeners.lock().contains_key(address)
    }
}

/// Accepts connections made to one bus address. Unregisters on drop.
#[derive(Debug)]
pub struct BusListener {
    bus: EventBus,
    address: String,
    incoming: mpsc::Receiver<MemTransport>,
}

impl BusListener {
    /// Wait for the next connection. `None` once the bus is gone.
    pub async fn accept(&mut self) -> Option<MemTransport> {
        self.incoming.recv().await
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        self.bus.listeners.lock().remove(&self.address);
        tracing::debug!(address = %self.address, "bus listener removed");
    }
}

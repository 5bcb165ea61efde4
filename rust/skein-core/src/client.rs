//! Client side: issue calls and match replies to them.
//!
//! Every call takes a sequence id from the [`PendingCalls`] registry, is
//! registered, and is written (or queued while the connection is still being
//! set up). A reader task hands each inbound message to the registry by
//! sequence id, so replies may arrive in any order. A call resolves exactly
//! once: with its reply, an EXCEPTION, a timeout, or the transport failure
//! that took the connection down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use skein_wire::{ApplicationError, Envelope, MessageKind, SequenceId};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::outbound::OutboundQueue;
use crate::pending::{CallOutcome, PendingCall, PendingCalls};
use crate::transport::Transport;
use crate::{RegistryError, RpcError, TransportError};

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Connection state of a duplex link. The lock around it is never held
/// across network I/O.
enum LinkState {
    /// Still connecting; writes wait here in order.
    Connecting(OutboundQueue),
    Open(Transport),
    Closed(TransportError),
}

enum Link {
    Duplex(AsyncMutex<LinkState>),
    #[cfg(feature = "http")]
    Http(crate::transport::http::HttpClientTransport),
}

struct ClientCore {
    pending: PendingCalls,
    config: ClientConfig,
    orphans: AtomicU64,
    link: Link,
}

/// Handle for making calls. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RpcClient {
    core: Arc<ClientCore>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("protocol", &self.core.config.protocol)
            .field("pending", &self.core.pending.len())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Client over an already-open transport.
    ///
    /// Must be called within a tokio runtime; spawns the reader task.
    pub fn new(transport: Transport, config: ClientConfig) -> Self {
        let core = Arc::new(ClientCore::new(
            config,
            Link::Duplex(AsyncMutex::new(LinkState::Open(transport.clone()))),
        ));
        tokio::spawn(read_loop(Arc::downgrade(&core), transport));
        RpcClient { core }
    }

    /// Client whose connection is still being established.
    ///
    /// Calls made before `connect` resolves are queued and written in order
    /// once it does. If it fails, every queued call fails with its error.
    pub fn connecting<F>(connect: F, config: ClientConfig) -> Self
    where
        F: Future<Output = Result<Transport, TransportError>> + Send + 'static,
    {
        let core = Arc::new(ClientCore::new(
            config,
            Link::Duplex(AsyncMutex::new(LinkState::Connecting(OutboundQueue::new()))),
        ));
        let weak = Arc::downgrade(&core);
        tokio::spawn(async move {
            let result = connect.await;
            match weak.upgrade() {
                Some(core) => core.finish_connect(result).await,
                None => {
                    if let Ok(transport) = result {
                        transport.close();
                    }
                }
            }
        });
        RpcClient { core }
    }

    /// Connect over TCP. Returns immediately; see [`connecting`](Self::connecting).
    #[cfg(feature = "stream")]
    pub fn connect_tcp<A>(addr: A, config: ClientConfig) -> Self
    where
        A: tokio::net::ToSocketAddrs + Send + 'static,
    {
        let max_frame_size = config.max_frame_size;
        Self::connecting(
            async move {
                crate::transport::stream::StreamTransport::connect(addr, max_frame_size)
                    .await
                    .map(Transport::from)
            },
            config,
        )
    }

    /// Connect to a listener on the in-process bus.
    #[cfg(feature = "mem")]
    pub fn connect_bus(
        bus: &crate::transport::mem::EventBus,
        address: &str,
        config: ClientConfig,
    ) -> Self {
        let bus = bus.clone();
        let address = address.to_string();
        Self::connecting(
            async move { bus.connect(&address).await.map(Transport::from) },
            config,
        )
    }

    /// Connect to a `ws://` URL.
    #[cfg(feature = "websocket")]
    pub fn connect_websocket(url: &str, config: ClientConfig) -> Self {
        let url = url.to_string();
        let max_message_size = config.max_frame_size;
        Self::connecting(
            async move {
                crate::transport::websocket::WebSocketTransport::connect(&url, max_message_size)
                    .await
                    .map(Transport::from)
            },
            config,
        )
    }

    /// Client that POSTs every call to `url`.
    #[cfg(feature = "http")]
    pub fn http(url: &str, config: ClientConfig) -> Result<Self, TransportError> {
        let transport =
            crate::transport::http::HttpClientTransport::new(url, config.max_frame_size)?;
        Ok(RpcClient {
            core: Arc::new(ClientCore::new(config, Link::Http(transport))),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    /// Call `method` and wait for its reply, up to the configured timeout.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(method, args, self.core.config.call_timeout)
            .await
    }

    /// Call `method` and wait for its reply.
    ///
    /// `timeout` runs from submission: it covers a write stuck behind a
    /// peer that stopped reading as well as the wait for the reply.
    pub async fn call_with_timeout<A, R>(
        &self,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        let core = &self.core;
        let protocol = core.config.protocol;
        let seq_id = core.pending.next_id();
        let message = protocol
            .write_message(&Envelope::call(method, seq_id), args)
            .map_err(RpcError::Encode)?;

        let (call, mut rx) = PendingCall::new(seq_id, method);
        core.pending.register(seq_id, call.clone())?;
        let mut guard = CallGuard {
            core,
            call: &call,
            armed: true,
        };

        tracing::debug!(seq_id = %seq_id, method, "call");
        let written =
            tokio::time::timeout_at(deadline, core.write(seq_id, message, Some(deadline))).await;
        let outcome = match written {
            Ok(written) => {
                written?;
                match tokio::time::timeout_at(deadline, &mut rx).await {
                    Ok(received) => received.unwrap_or(Err(RpcError::Closed)),
                    Err(_elapsed) => core.time_out(&call, rx, timeout).await,
                }
            }
            Err(_elapsed) => core.time_out(&call, rx, timeout).await,
        };
        guard.armed = false;

        let body = outcome?;
        protocol.decode(&body).map_err(RpcError::Decode)
    }

    /// Send a one-way call. Completes once the request is written (or
    /// queued); nothing comes back.
    pub async fn oneway<A: Serialize>(&self, method: &str, args: &A) -> Result<(), RpcError> {
        let seq_id = self.core.pending.next_id();
        let message = self
            .core
            .config
            .protocol
            .write_message(&Envelope::oneway(method, seq_id), args)
            .map_err(RpcError::Encode)?;
        tracing::debug!(seq_id = %seq_id, method, "oneway");
        self.core.write(seq_id, message, None).await?;
        Ok(())
    }

    /// Replies that matched no pending call (late, duplicate or unknown).
    pub fn orphan_replies(&self) -> u64 {
        self.core.orphans.load(Ordering::Relaxed)
    }

    pub fn pending_len(&self) -> usize {
        self.core.pending.len()
    }

    /// Whether the connection has gone away (or was closed). A client that is
    /// still connecting is not closed; HTTP clients never are.
    pub async fn is_closed(&self) -> bool {
        match &self.core.link {
            Link::Duplex(state) => matches!(*state.lock().await, LinkState::Closed(_)),
            #[cfg(feature = "http")]
            Link::Http(_) => false,
        }
    }

    /// Close the connection and fail every outstanding call.
    pub async fn close(&self) {
        self.core.shut_down(TransportError::Closed).await;
    }
}

impl ClientCore {
    fn new(config: ClientConfig, link: Link) -> Self {
        ClientCore {
            pending: PendingCalls::new(config.max_pending),
            config,
            orphans: AtomicU64::new(0),
            link,
        }
    }

    fn duplex(&self) -> Option<&AsyncMutex<LinkState>> {
        match &self.link {
            Link::Duplex(state) => Some(state),
            #[cfg(feature = "http")]
            Link::Http(_) => None,
        }
    }

    /// Flush what was queued while connecting, then open the link.
    ///
    /// Calls made during a flush join the queue and go out in the next
    /// round, so the link only opens once the queue is empty.
    async fn finish_connect(self: Arc<Self>, result: Result<Transport, TransportError>) {
        let Some(link) = self.duplex() else {
            return;
        };
        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(error = %e, pending = self.pending.len(), "connect failed");
                self.shut_down(e).await;
                return;
            }
        };

        let mut flushed = 0;
        loop {
            let mut queue = {
                let mut state = link.lock().await;
                let queue = match &mut *state {
                    LinkState::Connecting(queue) => std::mem::take(queue),
                    // closed while connecting
                    _ => {
                        transport.close();
                        return;
                    }
                };
                if queue.is_empty() {
                    *state = LinkState::Open(transport.clone());
                    break;
                }
                queue
            };
            match queue.flush_all(|message| transport.send(message)).await {
                Ok(n) => flushed += n,
                Err((e, unsent)) => {
                    tracing::warn!(error = %e, unsent = unsent.len(), "failed to flush queued calls");
                    transport.close();
                    self.shut_down(e).await;
                    return;
                }
            }
        }
        tracing::debug!(flushed, "connected");
        tokio::spawn(read_loop(Arc::downgrade(&self), transport));
    }

    /// Write one request, or queue it while connecting.
    ///
    /// Over HTTP the POST for a call runs in its own task, bounded by the
    /// call's deadline; a one-way POST is awaited here.
    #[cfg_attr(not(feature = "http"), allow(unused_variables))]
    async fn write(
        self: &Arc<Self>,
        seq_id: SequenceId,
        message: Bytes,
        reply_deadline: Option<Instant>,
    ) -> Result<(), TransportError> {
        match &self.link {
            Link::Duplex(state) => {
                let transport = match &mut *state.lock().await {
                    LinkState::Connecting(queue) => {
                        queue.enqueue(seq_id, message);
                        return Ok(());
                    }
                    LinkState::Open(transport) => transport.clone(),
                    LinkState::Closed(e) => return Err(e.clone()),
                };
                transport.send(message).await
            }
            #[cfg(feature = "http")]
            Link::Http(http) => {
                let Some(deadline) = reply_deadline else {
                    return http.post(message).await.map(|_| ());
                };
                let core = Arc::clone(self);
                let http = http.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout_at(deadline, http.post(message)).await {
                        Ok(Ok(reply)) => core.handle_response(reply),
                        Ok(Err(e)) => core.fail_call(seq_id, e),
                        Err(_elapsed) => {
                            tracing::debug!(seq_id = %seq_id, "abandoning http request past its deadline")
                        }
                    }
                });
                Ok(())
            }
        }
    }

    /// Resolve `call` as timed out, unless something else got there first.
    async fn time_out(
        &self,
        call: &Arc<PendingCall>,
        rx: oneshot::Receiver<CallOutcome>,
        after: Duration,
    ) -> CallOutcome {
        let seq_id = call.seq_id();
        if self.pending.unregister(seq_id, call).is_ok() {
            tracing::warn!(seq_id = %seq_id, method = call.method(), ?after, "call timed out");
            self.cancel_queued(seq_id).await;
            call.complete(Err(RpcError::TimedOut { seq_id, after }));
        }
        // whichever completion won is waiting in rx
        rx.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Drop queued bytes for a call that will never be sent.
    async fn cancel_queued(&self, seq_id: SequenceId) {
        if let Some(state) = self.duplex()
            && let LinkState::Connecting(queue) = &mut *state.lock().await
            && queue.cancel(seq_id)
        {
            tracing::debug!(seq_id = %seq_id, "removed queued request");
        }
    }

    fn try_cancel_queued(&self, seq_id: SequenceId) {
        if let Some(state) = self.duplex()
            && let Ok(mut state) = state.try_lock()
            && let LinkState::Connecting(queue) = &mut *state
        {
            queue.cancel(seq_id);
        }
    }

    /// Route one inbound message to the call waiting for it.
    fn handle_response(&self, message: Bytes) {
        let protocol = self.config.protocol;
        let (envelope, body) = match protocol.read_envelope(&message) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(error = %e, "dropping reply with malformed envelope");
                return;
            }
        };
        if !envelope.kind.is_response() {
            tracing::warn!(
                seq_id = %envelope.seq_id,
                kind = %envelope.kind,
                "dropping non-reply message sent to client"
            );
            return;
        }

        let Some(call) = self.pending.lookup(envelope.seq_id) else {
            self.record_orphan(&envelope);
            return;
        };
        match self.pending.unregister(envelope.seq_id, &call) {
            Ok(()) => {}
            Err(RegistryError::NotRegistered(_)) => {
                // finished by a timeout between lookup and here
                self.record_orphan(&envelope);
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "pending-call registry out of sync");
                return;
            }
        }

        let outcome = if envelope.name != call.method() {
            Err(RpcError::WrongMethodName {
                expected: call.method().to_string(),
                actual: envelope.name,
            })
        } else if envelope.kind == MessageKind::Exception {
            match protocol.decode::<ApplicationError>(&body) {
                Ok(e) => Err(RpcError::Application(e)),
                Err(e) => Err(RpcError::Decode(e)),
            }
        } else {
            Ok(body)
        };
        tracing::debug!(seq_id = %envelope.seq_id, kind = %envelope.kind, "reply");
        call.complete(outcome);
    }

    fn record_orphan(&self, envelope: &Envelope) {
        self.orphans.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            seq_id = %envelope.seq_id,
            method = %envelope.name,
            "dropping reply with no pending call"
        );
    }

    #[cfg_attr(not(feature = "http"), allow(dead_code))]
    fn fail_call(&self, seq_id: SequenceId, error: TransportError) {
        let Some(call) = self.pending.lookup(seq_id) else {
            return;
        };
        if self.pending.unregister(seq_id, &call).is_ok() {
            call.complete(Err(RpcError::Transport(error)));
        }
    }

    async fn shut_down(&self, error: TransportError) {
        if let Some(state) = self.duplex() {
            let mut state = state.lock().await;
            if let LinkState::Open(transport) = &*state {
                transport.close();
            }
            if !matches!(*state, LinkState::Closed(_)) {
                *state = LinkState::Closed(error.clone());
            }
        }
        self.pending.fail_all(&error);
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        if let Some(state) = self.duplex()
            && let Ok(state) = state.try_lock()
            && let LinkState::Open(transport) = &*state
        {
            transport.close();
        }
    }
}

/// Deregisters a call whose future is dropped before it resolves.
struct CallGuard<'a> {
    core: &'a ClientCore,
    call: &'a Arc<PendingCall>,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let seq_id = self.call.seq_id();
        if self.core.pending.unregister(seq_id, self.call).is_ok() {
            self.core.try_cancel_queued(seq_id);
            tracing::debug!(seq_id = %seq_id, "call abandoned");
        }
    }
}

/// Hand every inbound message to the registry until the transport fails,
/// then fail whatever is still pending.
async fn read_loop(core: Weak<ClientCore>, transport: Transport) {
    loop {
        let result = transport.recv().await;
        let Some(core) = core.upgrade() else {
            transport.close();
            return;
        };
        match result {
            Ok(message) => core.handle_response(message),
            Err(e) => {
                match &e {
                    TransportError::Closed => tracing::debug!("connection closed"),
                    other => tracing::warn!(error = %other, "connection failed"),
                }
                core.shut_down(e).await;
                return;
            }
        }
    }
}

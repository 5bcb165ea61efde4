//! Pending-call registry: sequence id → in-flight call.
//!
//! Shared between the send path (register, timeout, cancellation) and the
//! receive path (reply lookup, transport failure). The map lives behind a
//! `parking_lot::Mutex` that is never held across an await point.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use skein_wire::SequenceId;
use tokio::sync::oneshot;

use crate::{RegistryError, RpcError, TransportError};

/// How a call ended: the still-encoded REPLY body, or the failure.
pub type CallOutcome = Result<Bytes, RpcError>;

/// One in-flight call.
///
/// The waiter can be taken exactly once, so a call resolves at most once no
/// matter how many paths (reply, timeout, transport failure) race to finish it.
#[derive(Debug)]
pub struct PendingCall {
    seq_id: SequenceId,
    method: String,
    waiter: Mutex<Option<oneshot::Sender<CallOutcome>>>,
}

impl PendingCall {
    pub fn new(
        seq_id: SequenceId,
        method: impl Into<String>,
    ) -> (Arc<Self>, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(PendingCall {
            seq_id,
            method: method.into(),
            waiter: Mutex::new(Some(tx)),
        });
        (call, rx)
    }

    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Resolve the call. Returns `false` (and does nothing) if it was
    /// already resolved.
    pub fn complete(&self, outcome: CallOutcome) -> bool {
        let Some(tx) = self.waiter.lock().take() else {
            tracing::debug!(seq_id = %self.seq_id, method = %self.method, "call already completed");
            return false;
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(seq_id = %self.seq_id, "caller went away before completion");
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        self.waiter.lock().is_none()
    }
}

/// Default cap on concurrently registered calls.
pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Registry of in-flight calls for one client.
#[derive(Debug)]
pub struct PendingCalls {
    calls: Mutex<HashMap<SequenceId, Arc<PendingCall>>>,
    next: AtomicI32,
    max_pending: usize,
}

impl PendingCalls {
    pub fn new(max_pending: usize) -> Self {
        PendingCalls {
            calls: Mutex::new(HashMap::new()),
            next: AtomicI32::new(1),
            max_pending,
        }
    }

    /// Hand out the next sequence id.
    ///
    /// Ids start at 1 and wrap from `i32::MAX` back to 1. Ids that are still
    /// registered after a wrap are skipped.
    pub fn next_id(&self) -> SequenceId {
        loop {
            let id = self
                .next
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(if n == i32::MAX { 1 } else { n + 1 })
                })
                .unwrap_or(1);
            let id = SequenceId(id);
            if !self.calls.lock().contains_key(&id) {
                return id;
            }
            tracing::debug!(seq_id = %id, "sequence id still in flight after wraparound, skipping");
        }
    }

    pub fn register(&self, id: SequenceId, call: Arc<PendingCall>) -> Result<(), RegistryError> {
        let mut calls = self.calls.lock();
        if calls.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        if calls.len() >= self.max_pending {
            return Err(RegistryError::Full {
                max: self.max_pending,
            });
        }
        calls.insert(id, call);
        Ok(())
    }

    /// Remove `call` from the registry.
    ///
    /// Only removes the entry if it is this very call. A different entry
    /// under the same id is left untouched.
    pub fn unregister(&self, id: SequenceId, call: &Arc<PendingCall>) -> Result<(), RegistryError> {
        let mut calls = self.calls.lock();
        match calls.get(&id) {
            Some(existing) if Arc::ptr_eq(existing, call) => {
                calls.remove(&id);
                Ok(())
            }
            Some(_) => Err(RegistryError::Mismatch(id)),
            None => Err(RegistryError::NotRegistered(id)),
        }
    }

    pub fn lookup(&self, id: SequenceId) -> Option<Arc<PendingCall>> {
        self.calls.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    pub fn pending_ids(&self) -> Vec<SequenceId> {
        let mut ids: Vec<_> = self.calls.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Remove every call and return them.
    pub fn drain(&self) -> Vec<Arc<PendingCall>> {
        self.calls.lock().drain().map(|(_, call)| call).collect()
    }

    /// Fail every registered call with the same transport error.
    ///
    /// Returns how many calls were failed.
    pub fn fail_all(&self, error: &TransportError) -> usize {
        let calls = self.drain();
        let mut failed = 0;
        for call in calls {
            if call.complete(Err(RpcError::Transport(error.clone()))) {
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!(failed, %error, "failed pending calls");
        }
        failed
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

//! Writes issued before the connection is ready.

use std::collections::VecDeque;

use bytes::Bytes;
use skein_wire::SequenceId;

/// FIFO of `(sequence id, message)` waiting for the connection to open.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<(SequenceId, Bytes)>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, id: SequenceId, message: Bytes) {
        self.entries.push_back((id, message));
    }

    /// Drop the entry for `id`. Returns whether there was one; an id whose
    /// bytes were already flushed is not an error.
    pub fn cancel(&mut self, id: SequenceId) -> bool {
        match self.entries.iter().position(|(queued, _)| *queued == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take every entry in enqueue order, leaving the queue empty.
    pub fn take_all(&mut self) -> VecDeque<(SequenceId, Bytes)> {
        std::mem::take(&mut self.entries)
    }

    /// Hand every entry to `write` in enqueue order, then clear.
    ///
    /// Stops at the first failed write and returns it together with the ids
    /// that were not written.
    pub async fn flush_all<F, Fut, E>(&mut self, mut write: F) -> Result<usize, (E, Vec<SequenceId>)>
    where
        F: FnMut(Bytes) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut written = 0;
        let mut entries = self.take_all();
        while let Some((id, message)) = entries.pop_front() {
            if let Err(e) = write(message).await {
                let mut unsent = vec![id];
                unsent.extend(entries.into_iter().map(|(id, _)| id));
                return Err((e, unsent));
            }
            written += 1;
        }
        Ok(written)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<SequenceId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

//! Bounded per-channel write queue.
//!
//! Producers (`append`) run on worker or application threads and block, up
//! to the admission timeout, while the queue is full. The single consumer is
//! the channel's drain loop, which parks on a doorbell until the next append.
//!
//! ```text
//! append ──► [entry][entry][entry] ──► WriteDrain::next ──► socket write
//!   ▲ blocks while full                      │
//!   └──────────── not_full ◄─────────────────┘
//! ```
//!
//! Entries leave in FIFO order. Closing the queue cancels every pending entry
//! with `ChannelError::Closed` and wakes blocked producers immediately.

use crate::buffer::PooledBuf;
use crate::error::{ChannelError, WriteError};

use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Continuation invoked once an entry is written, cancelled or refused.
pub type Completion = Box<dyn FnOnce(Result<(), ChannelError>) + Send>;

/// Encoded bytes ready for the socket.
pub enum Payload {
    /// Arena-backed bytes; the page is reclaimed after the write.
    Pooled(PooledBuf),
    /// Shared bytes produced outside the arena.
    Shared(Bytes),
}

impl Payload {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Pooled(buf) => buf.readable_bytes(),
            Self::Shared(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Readable bytes of the payload.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Pooled(buf) => buf.as_slice(),
            Self::Shared(bytes) => bytes,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pooled(buf) => f.debug_tuple("Pooled").field(&buf.readable_bytes()).finish(),
            Self::Shared(bytes) => f.debug_tuple("Shared").field(&bytes.len()).finish(),
        }
    }
}

/// One queued write.
pub struct WriteEntry {
    pub payload: Payload,
    pub on_complete: Option<Completion>,
}

impl WriteEntry {
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            on_complete: None,
        }
    }

    #[must_use]
    pub fn with_completion(payload: Payload, on_complete: Completion) -> Self {
        Self {
            payload,
            on_complete: Some(on_complete),
        }
    }

    /// Run the continuation, if any.
    pub fn complete(self, result: Result<(), ChannelError>) {
        if let Some(on_complete) = self.on_complete {
            on_complete(result);
        }
    }
}

impl fmt::Debug for WriteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteEntry")
            .field("payload", &self.payload)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

struct QueueState {
    entries: VecDeque<WriteEntry>,
    closed: bool,
    drain_taken: bool,
}

pub struct WriteQueue {
    capacity: usize,
    timeout: Duration,
    state: Mutex<QueueState>,
    not_full: Condvar,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
}

impl WriteQueue {
    #[must_use]
    pub fn new(capacity: usize, timeout: Duration) -> Arc<Self> {
        let (doorbell_tx, doorbell_rx) = flume::bounded(1);
        Arc::new(Self {
            capacity: capacity.max(1),
            timeout,
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
                drain_taken: false,
            }),
            not_full: Condvar::new(),
            doorbell_tx,
            doorbell_rx,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Enqueue an entry, blocking while the queue is full.
    ///
    /// On failure the entry's continuation has already been invoked with the
    /// matching `ChannelError`.
    ///
    /// # Errors
    ///
    /// `WriteError::Timeout` if the queue stayed full for the admission
    /// timeout (backpressure), `WriteError::Closed` if the queue was closed
    /// before or while waiting.
    pub fn append(&self, entry: WriteEntry) -> Result<(), WriteError> {
        let mut batch = SmallVec::new();
        batch.push(entry);
        self.append_all(batch)
    }

    /// Enqueue the entries of one message together or not at all.
    ///
    /// Waits until every entry fits. A batch larger than the whole queue is
    /// admitted once the queue is empty. On failure nothing was queued and
    /// every continuation has run with the matching `ChannelError`.
    ///
    /// # Errors
    ///
    /// Same as [`append`](Self::append).
    pub fn append_all(&self, entries: SmallVec<[WriteEntry; 2]>) -> Result<(), WriteError> {
        if entries.is_empty() {
            return Ok(());
        }
        let needed = entries.len().min(self.capacity);
        let deadline = Instant::now().checked_add(self.timeout);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                drop(state);
                refuse(entries, &ChannelError::Closed);
                return Err(WriteError::Closed);
            }
            if state.entries.len() + needed <= self.capacity {
                state.entries.extend(entries);
                drop(state);
                // A full doorbell already guarantees a wake-up.
                let _ = self.doorbell_tx.try_send(());
                return Ok(());
            }

            let expired = self.timeout.is_zero()
                || deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if expired {
                drop(state);
                let err = WriteError::Timeout(self.timeout);
                debug!(
                    capacity = self.capacity,
                    entries = entries.len(),
                    "write queue full, refusing write"
                );
                refuse(entries, &ChannelError::from(err.clone()));
                return Err(err);
            }

            match deadline {
                Some(deadline) => {
                    self.not_full.wait_until(&mut state, deadline);
                }
                None => self.not_full.wait(&mut state),
            }
        }
    }

    /// Claim the consumer side. Only one drain may exist at a time.
    pub fn take_drain(self: &Arc<Self>) -> Option<WriteDrain> {
        let mut state = self.state.lock();
        if state.drain_taken {
            return None;
        }
        state.drain_taken = true;
        Some(WriteDrain {
            queue: Arc::clone(self),
        })
    }

    /// Refuse new entries, cancel pending ones and wake everyone.
    pub fn close(&self) {
        let cancelled: Vec<WriteEntry> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.not_full.notify_all();
            state.entries.drain(..).collect()
        };
        let _ = self.doorbell_tx.try_send(());
        if !cancelled.is_empty() {
            debug!(pending = cancelled.len(), "cancelling queued writes");
        }
        for entry in cancelled {
            entry.complete(Err(ChannelError::Closed));
        }
    }

    fn pop(&self) -> Option<WriteEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.pop_front();
        if entry.is_some() {
            // Batched producers wait for several slots.
            self.not_full.notify_all();
        }
        entry
    }
}

fn refuse(entries: SmallVec<[WriteEntry; 2]>, err: &ChannelError) {
    for entry in entries {
        entry.complete(Err(err.replicate()));
    }
}

impl fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WriteQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Consumer side of a [`WriteQueue`].
pub struct WriteDrain {
    queue: Arc<WriteQueue>,
}

impl WriteDrain {
    /// Pop the next entry without waiting.
    #[must_use]
    pub fn try_next(&self) -> Option<WriteEntry> {
        self.queue.pop()
    }

    /// Wait for the next entry. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<WriteEntry> {
        loop {
            if let Some(entry) = self.queue.pop() {
                return Some(entry);
            }
            if self.queue.is_closed() {
                return None;
            }
            if self.queue.doorbell_rx.recv_async().await.is_err() {
                return None;
            }
        }
    }
}

impl Drop for WriteDrain {
    fn drop(&mut self) {
        self.queue.state.lock().drain_taken = false;
    }
}

//! One live connection: pipeline, write queue and arena access.
//!
//! A [`Channel`] is a cheap `Arc` handle. Everything that touches its
//! pipeline goes through a per-channel mailbox:
//!
//! - `submit` pushes an action and then tries to become the dispatcher with
//!   `try_lock`. Nobody ever blocks on the pipeline lock.
//! - The dispatcher runs actions in mailbox order until it is empty,
//!   releases the lock, and re-checks the mailbox so an action pushed during
//!   the release is not stranded.
//! - A handler that writes or closes during dispatch only pushes to the
//!   mailbox; its action runs after the current one.
//!
//! On I/O threads the dispatch itself is handed to the worker pool, so
//! handler code never runs on the thread that owns socket completions.
//!
//! Lifecycle: `New -> (Handshaking) -> Open -> Closing -> Closed`. `close`
//! may be called from any thread, any number of times; exactly one
//! `ChannelClosed` event is dispatched and each close listener runs once.

use crate::alloc::Arena;
use crate::buffer::PooledBuf;
use crate::error::{ArenaError, ChannelError, PipelineError};
use crate::executor::Executor;
use crate::options::ChannelConfig;
use crate::pipeline::dispatch::{self, Action, DispatchState};
use crate::pipeline::{Event, IdleState, Message, Pipeline};
use crate::write_queue::{Completion, Payload, WriteDrain, WriteEntry, WriteQueue};

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Set while this thread dispatches a pipeline.
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
    /// Set on threads that own socket completions.
    static IO_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the calling thread as an I/O thread.
///
/// Dispatch submitted from it is moved onto the channel's executor.
pub fn set_io_thread(enabled: bool) {
    IO_THREAD.with(|flag| flag.set(enabled));
}

fn must_not_wait() -> bool {
    DISPATCHING.with(Cell::get) || IO_THREAD.with(Cell::get)
}

struct DispatchGuard {
    previous: bool,
}

impl DispatchGuard {
    fn enter() -> Self {
        Self {
            previous: DISPATCHING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|flag| flag.set(self.previous));
    }
}

/// Opaque channel identity, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    New = 0,
    Handshaking = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ChannelState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Handshaking,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

type CloseListener = Box<dyn FnOnce(&Channel) + Send>;

struct Listeners {
    pending: Vec<CloseListener>,
    fired: bool,
}

const READER_IDLE: u8 = 0b001;
const WRITER_IDLE: u8 = 0b010;
const ALL_IDLE: u8 = 0b100;

struct PipelineSlot {
    pipeline: Pipeline,
    state: DispatchState,
}

struct ChannelInner {
    id: ChannelId,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    state: AtomicU8,
    pipeline: Mutex<PipelineSlot>,
    mailbox: Mutex<VecDeque<Action>>,
    write_queue: Arc<WriteQueue>,
    arena: Arena,
    config: ChannelConfig,
    executor: Option<Executor>,
    listeners: Mutex<Listeners>,
    cancelled: AtomicBool,
    close_tx: Sender<()>,
    close_rx: Receiver<()>,
    created: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    idle_fired: AtomicU8,
}

/// Builder for [`Channel`].
pub struct ChannelBuilder {
    arena: Arena,
    config: ChannelConfig,
    executor: Option<Executor>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl ChannelBuilder {
    #[must_use]
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Executor that runs dispatch submitted from I/O threads.
    #[must_use]
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }

    #[must_use]
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn build(self, pipeline: Pipeline) -> Channel {
        let (close_tx, close_rx) = flume::bounded(1);
        let write_queue =
            WriteQueue::new(self.config.write_queue_capacity, self.config.write_timeout);
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id: ChannelId::next(),
                local_addr: self.local_addr,
                remote_addr: self.remote_addr,
                state: AtomicU8::new(ChannelState::New as u8),
                pipeline: Mutex::new(PipelineSlot {
                    pipeline,
                    state: DispatchState::default(),
                }),
                mailbox: Mutex::new(VecDeque::new()),
                write_queue,
                arena: self.arena,
                config: self.config,
                executor: self.executor,
                listeners: Mutex::new(Listeners {
                    pending: Vec::new(),
                    fired: false,
                }),
                cancelled: AtomicBool::new(false),
                close_tx,
                close_rx,
                created: Instant::now(),
                last_read_ms: AtomicU64::new(0),
                last_write_ms: AtomicU64::new(0),
                idle_fired: AtomicU8::new(0),
            }),
        };
        trace!(channel = %channel.id(), remote = ?channel.remote_addr(), "channel created");
        channel
    }
}

/// Handle to one connection. Clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    #[must_use]
    pub fn builder(arena: Arena) -> ChannelBuilder {
        ChannelBuilder {
            arena,
            config: ChannelConfig::default(),
            executor: None,
            local_addr: None,
            remote_addr: None,
        }
    }

    /// Channel without a socket; writes stay in the queue until drained.
    #[must_use]
    pub fn new(pipeline: Pipeline, arena: Arena, config: ChannelConfig) -> Self {
        Self::builder(arena).config(config).build(pipeline)
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Open or handshaking.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state(), ChannelState::Open | ChannelState::Handshaking)
    }

    /// Closing or closed.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        matches!(self.state(), ChannelState::Closing | ChannelState::Closed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.inner.arena
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Entries waiting in the write queue.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.inner.write_queue.len()
    }

    /// Claim the consumer side of the write queue.
    ///
    /// The socket task holds it for the channel's lifetime; tests use it to
    /// observe what would hit the wire.
    #[must_use]
    pub fn take_write_drain(&self) -> Option<WriteDrain> {
        self.inner.write_queue.take_drain()
    }

    /// Fires once when the channel starts closing.
    pub(crate) fn close_signal(&self) -> Receiver<()> {
        self.inner.close_rx.clone()
    }

    /// Go live and fire `NewChannel`.
    pub fn activate(&self) {
        let _ = self.inner.state.compare_exchange(
            ChannelState::New as u8,
            ChannelState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.is_closing() {
            return;
        }
        debug!(channel = %self.id(), remote = ?self.remote_addr(), "channel active");
        self.touch_read();
        self.touch_write();
        self.submit_inbound(Event::NewChannel, None);
    }

    /// Enter the handshaking state (TLS-style duplex handlers).
    pub fn begin_handshake(&self) -> bool {
        [ChannelState::New, ChannelState::Open].into_iter().any(|from| {
            self.inner
                .state
                .compare_exchange(
                    from as u8,
                    ChannelState::Handshaking as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }

    /// Leave the handshaking state.
    pub fn handshake_complete(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                ChannelState::Handshaking as u8,
                ChannelState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Push a message in through the head of the pipeline.
    ///
    /// Dropped once the channel is closing; pooled buffers go back to the
    /// arena.
    pub fn fire_channel_read(&self, msg: Message) {
        self.touch_read();
        self.submit_inbound(Event::ChannelRead(msg), None);
    }

    /// Dispatch a socket read; `done` disconnects once it is consumed.
    pub(crate) fn dispatch_read(&self, buf: PooledBuf, done: Sender<()>) {
        self.touch_read();
        self.submit_inbound(Event::ChannelRead(Box::new(buf)), Some(done));
    }

    pub fn fire_idle(&self, state: IdleState) {
        self.submit_inbound(Event::Idle(state), None);
    }

    fn submit_inbound(&self, event: Event, done: Option<Sender<()>>) {
        if self.is_closing() {
            trace!(channel = %self.id(), "dropping inbound event after close");
            return;
        }
        self.submit(Action::Inbound { event, done });
    }

    /// Fire each idle state whose period elapsed and has not fired yet.
    ///
    /// Returns the states that fired.
    pub fn check_idle(&self, timeout: Duration) -> SmallVec<[IdleState; 3]> {
        let mut fired = SmallVec::new();
        if !self.is_active() {
            return fired;
        }
        let now = self.elapsed_ms();
        let timeout = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let read_idle =
            now.saturating_sub(self.inner.last_read_ms.load(Ordering::Acquire)) >= timeout;
        let write_idle =
            now.saturating_sub(self.inner.last_write_ms.load(Ordering::Acquire)) >= timeout;

        for (idle, bit, state) in [
            (read_idle, READER_IDLE, IdleState::ReaderIdle),
            (write_idle, WRITER_IDLE, IdleState::WriterIdle),
            (read_idle && write_idle, ALL_IDLE, IdleState::AllIdle),
        ] {
            if idle && self.inner.idle_fired.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
                fired.push(state);
            }
        }
        for state in &fired {
            trace!(channel = %self.id(), state = ?state, "idle");
            self.fire_idle(*state);
        }
        fired
    }

    /// Send `msg` out through the whole pipeline and queue the bytes.
    ///
    /// Returns the admission outcome when the write is dispatched before
    /// returning. Called from a handler or an I/O thread, the write is queued
    /// behind the current dispatch and `Ok(())` means accepted.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Closed` once closing started.
    /// - `ChannelError::Backpressure` if the write queue or arena stayed
    ///   full past its timeout.
    /// - `ChannelError::UnsupportedMessage` / `Handler` if the outbound
    ///   chain did not produce bytes.
    pub fn write_and_flush(&self, msg: Message) -> Result<(), ChannelError> {
        self.write_inner(msg, None)
    }

    /// [`write_and_flush`](Self::write_and_flush) with a continuation run
    /// once the bytes reached the socket, or the write failed.
    ///
    /// The continuation may run on an I/O thread and must not block.
    pub fn write_and_flush_with<F>(&self, msg: Message, on_complete: F) -> Result<(), ChannelError>
    where
        F: FnOnce(Result<(), ChannelError>) + Send + 'static,
    {
        self.write_inner(msg, Some(Box::new(on_complete)))
    }

    fn write_inner(&self, msg: Message, completion: Option<Completion>) -> Result<(), ChannelError> {
        if self.is_closing() {
            debug!(channel = %self.id(), "write after close");
            if let Some(completion) = completion {
                completion(Err(ChannelError::Closed));
            }
            return Err(ChannelError::Closed);
        }

        if must_not_wait() {
            self.submit(Action::Write {
                msg,
                completion,
                admission: None,
            });
            return Ok(());
        }

        let (tx, rx) = flume::bounded(1);
        self.submit(Action::Write {
            msg,
            completion,
            admission: Some(tx),
        });
        rx.recv().unwrap_or(Err(ChannelError::Closed))
    }

    /// Queue the payloads of one message; the completion rides on the last.
    ///
    /// The payloads are admitted together, so a refused write leaves nothing
    /// of the message in the queue.
    pub(crate) fn enqueue(
        &self,
        payloads: SmallVec<[Payload; 2]>,
        completion: Option<Completion>,
    ) -> Result<(), ChannelError> {
        let count = payloads.len();
        if count == 0 {
            if let Some(completion) = completion {
                completion(Ok(()));
            }
            return Ok(());
        }

        let mut completion = completion;
        let entries = payloads
            .into_iter()
            .enumerate()
            .map(|(idx, payload)| match completion.take() {
                Some(on_complete) if idx + 1 == count => {
                    WriteEntry::with_completion(payload, on_complete)
                }
                pending => {
                    completion = pending;
                    WriteEntry::new(payload)
                }
            })
            .collect();
        self.inner
            .write_queue
            .append_all(entries)
            .map_err(ChannelError::from)
    }

    /// Lease a buffer from the shared arena.
    ///
    /// Blocks up to the allocation timeout; fails fast once the channel is
    /// closing.
    pub fn alloc_buffer(&self, size: usize) -> Result<PooledBuf, ArenaError> {
        self.inner
            .arena
            .allocate_cancellable(size, self.inner.config.alloc_timeout, &self.inner.cancelled)
            .map(PooledBuf::new)
    }

    /// Register a listener run once after the channel closed.
    ///
    /// Registered after close, it runs immediately on the calling thread.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce(&Channel) + Send + 'static,
    {
        {
            let mut listeners = self.inner.listeners.lock();
            if !listeners.fired {
                listeners.pending.push(Box::new(listener));
                return;
            }
        }
        listener(self);
    }

    /// Close the channel. Safe from any thread; later calls are no-ops.
    ///
    /// Pending writes are cancelled, blocked writers and allocations fail
    /// fast, the socket task is told to stop, and `ChannelClosed` is
    /// dispatched.
    pub fn close(&self) {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if current >= ChannelState::Closing as u8 {
                return;
            }
            match self.inner.state.compare_exchange(
                current,
                ChannelState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        debug!(channel = %self.id(), "closing channel");
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.write_queue.close();
        self.inner.arena.interrupt_waiters();
        let _ = self.inner.close_tx.try_send(());
        self.submit(Action::Closed);
    }

    /// Edit the pipeline under its lock.
    ///
    /// # Errors
    ///
    /// `PipelineError::Reentrant` when called from a handler of this thread's
    /// current dispatch.
    pub fn with_pipeline<R>(&self, f: impl FnOnce(&mut Pipeline) -> R) -> Result<R, PipelineError> {
        if DISPATCHING.with(Cell::get) {
            return Err(PipelineError::Reentrant);
        }
        let result = {
            let mut slot = self.inner.pipeline.lock();
            f(&mut slot.pipeline)
        };
        self.drain_mailbox();
        Ok(result)
    }

    pub(crate) fn touch_read(&self) {
        self.inner
            .last_read_ms
            .store(self.elapsed_ms(), Ordering::Release);
        self.inner
            .idle_fired
            .fetch_and(!(READER_IDLE | ALL_IDLE), Ordering::AcqRel);
    }

    pub(crate) fn touch_write(&self) {
        self.inner
            .last_write_ms
            .store(self.elapsed_ms(), Ordering::Release);
        self.inner
            .idle_fired
            .fetch_and(!(WRITER_IDLE | ALL_IDLE), Ordering::AcqRel);
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.inner.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn submit(&self, action: Action) {
        self.inner.mailbox.lock().push_back(action);

        if IO_THREAD.with(Cell::get) && !DISPATCHING.with(Cell::get) {
            if let Some(executor) = &self.inner.executor {
                let channel = self.clone();
                if executor.execute(move || channel.drain_mailbox()).is_ok() {
                    return;
                }
            }
        }
        self.drain_mailbox();
    }

    fn drain_mailbox(&self) {
        loop {
            let Some(mut slot) = self.inner.pipeline.try_lock() else {
                // The holder re-checks the mailbox after unlocking.
                return;
            };
            let mut closed = false;
            {
                let _guard = DispatchGuard::enter();
                let PipelineSlot { pipeline, state } = &mut *slot;
                loop {
                    let next = self.inner.mailbox.lock().pop_front();
                    let Some(action) = next else {
                        break;
                    };
                    // Raced with close: ChannelClosed is the last inbound event.
                    if matches!(action, Action::Inbound { .. }) && self.is_closed() {
                        trace!(channel = %self.id(), "dropping inbound event after close");
                        continue;
                    }
                    let is_close = matches!(action, Action::Closed);
                    dispatch::run(self, pipeline.handlers_mut(), action, state);
                    if is_close {
                        self.inner
                            .state
                            .store(ChannelState::Closed as u8, Ordering::Release);
                        closed = true;
                    }
                }
            }
            drop(slot);

            if closed {
                self.notify_close_listeners();
            }
            if self.inner.mailbox.lock().is_empty() {
                return;
            }
        }
    }

    fn notify_close_listeners(&self) {
        let pending = {
            let mut listeners = self.inner.listeners.lock();
            if listeners.fired {
                error!(channel = %self.id(), "close listeners already notified");
                return;
            }
            listeners.fired = true;
            std::mem::take(&mut listeners.pending)
        };
        debug!(channel = %self.id(), listeners = pending.len(), "channel closed");
        for listener in pending {
            listener(self);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("remote", &self.inner.remote_addr)
            .finish()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ArenaConfig;
    use crate::pipeline::{HandlerContext, InboundHandler};
    use crate::error::HandlerError;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn arena() -> Arena {
        Arena::new(ArenaConfig::new(64 * 1024, 16 * 1024))
    }

    struct Echo;
    impl InboundHandler for Echo {
        fn channel_read(
            &mut self,
            ctx: &mut HandlerContext<'_>,
            msg: Message,
        ) -> Result<(), HandlerError> {
            ctx.write(msg);
            Ok(())
        }
    }

    #[test]
    fn state_machine() {
        let channel = Channel::new(Pipeline::new(), arena(), ChannelConfig::default());
        assert_eq!(channel.state(), ChannelState::New);
        assert!(channel.begin_handshake());
        assert!(channel.is_active());
        assert!(channel.handshake_complete());
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(!channel.handshake_complete());
        channel.close();
        assert!(channel.is_closed());
        assert!(!channel.begin_handshake());
    }

    #[test]
    fn handler_write_lands_in_queue() {
        let mut pipeline = Pipeline::new();
        pipeline.add_inbound("echo", Echo).unwrap();
        let channel = Channel::new(pipeline, arena(), ChannelConfig::default());
        let drain = channel.take_write_drain().unwrap();
        channel.activate();

        channel.fire_channel_read(Box::new(Bytes::from_static(b"ping")));
        let entry = drain.try_next().unwrap();
        assert_eq!(entry.payload.as_slice(), b"ping");
    }

    #[test]
    fn write_after_close_is_refused() {
        let channel = Channel::new(Pipeline::new(), arena(), ChannelConfig::default());
        channel.close();
        let called = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&called);
        let err = channel
            .write_and_flush_with(Box::new(Bytes::from_static(b"late")), move |res| {
                assert!(matches!(res, Err(ChannelError::Closed)));
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsupported_message_is_reported() {
        let channel = Channel::new(Pipeline::new(), arena(), ChannelConfig::default());
        let err = channel.write_and_flush(Box::new(42u32)).unwrap_err();
        assert!(matches!(err, ChannelError::UnsupportedMessage));
        assert_eq!(channel.pending_writes(), 0);
    }

    #[test]
    fn listener_after_close_runs_immediately() {
        let channel = Channel::new(Pipeline::new(), arena(), ChannelConfig::default());
        channel.close();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        channel.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_fires_once_per_period() {
        let channel = Channel::new(Pipeline::new(), arena(), ChannelConfig::default());
        channel.activate();
        std::thread::sleep(Duration::from_millis(30));
        let fired = channel.check_idle(Duration::from_millis(10));
        assert_eq!(
            fired.as_slice(),
            &[IdleState::ReaderIdle, IdleState::WriterIdle, IdleState::AllIdle]
        );
        assert!(channel.check_idle(Duration::from_millis(10)).is_empty());

        channel.fire_channel_read(Box::new(Bytes::from_static(b"x")));
        std::thread::sleep(Duration::from_millis(30));
        let fired = channel.check_idle(Duration::from_millis(10));
        assert_eq!(fired.as_slice(), &[IdleState::ReaderIdle, IdleState::AllIdle]);
    }

    #[test]
    fn read_queued_behind_close_is_dropped() {
        struct CloseThenRead(Arc<Mutex<Vec<&'static str>>>);
        impl InboundHandler for CloseThenRead {
            fn channel_read(
                &mut self,
                ctx: &mut HandlerContext<'_>,
                _msg: Message,
            ) -> Result<(), HandlerError> {
                self.0.lock().push("read");
                ctx.close();
                // Lands in the mailbox behind the close, as a racing socket read would.
                let late =
                    PooledBuf::copy_from_slice(ctx.channel().arena(), b"late", Duration::ZERO)
                        .unwrap();
                ctx.channel().submit(Action::Inbound {
                    event: Event::ChannelRead(Box::new(late)),
                    done: None,
                });
                Ok(())
            }

            fn channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
                self.0.lock().push("closed");
                ctx.fire_channel_inactive();
                Ok(())
            }
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .add_inbound("recorder", CloseThenRead(Arc::clone(&events)))
            .unwrap();
        let arena = arena();
        let channel = Channel::new(pipeline, arena.clone(), ChannelConfig::default());
        channel.activate();

        channel.fire_channel_read(Box::new(Bytes::from_static(b"first")));

        assert_eq!(*events.lock(), vec!["read", "closed"]);
        assert_eq!(arena.stats().outstanding, 0);
    }

    #[test]
    fn with_pipeline_is_rejected_inside_dispatch() {
        struct Editor(Arc<Mutex<Option<Result<(), PipelineError>>>>);
        impl InboundHandler for Editor {
            fn channel_active(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
                let result = ctx.channel().with_pipeline(|_| ());
                *self.0.lock() = Some(result);
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let mut pipeline = Pipeline::new();
        pipeline.add_inbound("editor", Editor(Arc::clone(&seen))).unwrap();
        let channel = Channel::new(pipeline, arena(), ChannelConfig::default());
        channel.activate();
        assert_eq!(*seen.lock(), Some(Err(PipelineError::Reentrant)));

        let names = channel
            .with_pipeline(|p| p.names().iter().map(ToString::to_string).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(names, vec!["editor".to_string()]);
    }
}

//! Per-thread recycling of buffer wrapper shells.
//!
//! A shell is the heap object behind a [`PooledBuf`](crate::buffer::PooledBuf):
//! cursors, reference count and the bound page. Shells are cheap but are
//! created on every read and write, so they are kept on a thread-local stack
//! instead of going back to the global allocator.
//!
//! Each thread owns one shard. A shell remembers the shard of the thread that
//! obtained it. Released on that thread, it goes straight onto the local
//! stack; released anywhere else, it is sent home through the shard's bounded
//! hand-off queue, which the owner drains on its next `get`. The local stack
//! is never touched by another thread.

use crate::alloc::Page;

use flume::{Receiver, Sender};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Default number of idle shells kept per thread.
pub const DEFAULT_CAPACITY: usize = 256;

static CAPACITY: AtomicUsize = AtomicUsize::new(DEFAULT_CAPACITY);

static CREATED: AtomicU64 = AtomicU64::new(0);
static REUSED: AtomicU64 = AtomicU64::new(0);
static HANDED_OFF: AtomicU64 = AtomicU64::new(0);
static DROPPED: AtomicU64 = AtomicU64::new(0);

/// Process-wide recycler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecyclerStats {
    /// Shells constructed because no pooled one was available.
    pub created: u64,
    /// Shells served from a local stack or hand-off queue.
    pub reused: u64,
    /// Shells released on a foreign thread and sent home.
    pub handed_off: u64,
    /// Shells discarded because a pool was full or its thread had exited.
    pub dropped: u64,
}

#[must_use]
pub fn stats() -> RecyclerStats {
    RecyclerStats {
        created: CREATED.load(Ordering::Relaxed),
        reused: REUSED.load(Ordering::Relaxed),
        handed_off: HANDED_OFF.load(Ordering::Relaxed),
        dropped: DROPPED.load(Ordering::Relaxed),
    }
}

/// Set how many idle shells each thread keeps. Applies to later releases.
pub fn set_capacity(capacity: usize) {
    CAPACITY.store(capacity, Ordering::Relaxed);
}

#[must_use]
pub fn capacity() -> usize {
    CAPACITY.load(Ordering::Relaxed)
}

/// Number of idle shells on the calling thread's stack.
#[must_use]
pub fn local_len() -> usize {
    LOCAL
        .try_with(|local| local.borrow().as_ref().map_or(0, |pool| pool.stack.len()))
        .unwrap_or(0)
}

/// Wrapper state recycled between buffers.
pub(crate) struct BufShell {
    pub(crate) page: Option<Page>,
    pub(crate) reader: usize,
    pub(crate) writer: usize,
    pub(crate) refs: usize,
    home: Weak<Shard>,
}

impl BufShell {
    fn new() -> Self {
        Self {
            page: None,
            reader: 0,
            writer: 0,
            refs: 0,
            home: Weak::new(),
        }
    }

    /// Bind a fresh page with one reference.
    pub(crate) fn bind(&mut self, page: Page) {
        self.page = Some(page);
        self.reader = 0;
        self.writer = 0;
        self.refs = 1;
    }

    fn reset(&mut self) {
        self.page = None;
        self.reader = 0;
        self.writer = 0;
        self.refs = 0;
    }
}

struct Shard {
    handoff_tx: Sender<Box<BufShell>>,
    handoff_rx: Receiver<Box<BufShell>>,
}

struct LocalPool {
    shard: Arc<Shard>,
    stack: Vec<Box<BufShell>>,
}

impl LocalPool {
    fn new() -> Self {
        let (handoff_tx, handoff_rx) = flume::bounded(capacity().max(1));
        Self {
            shard: Arc::new(Shard {
                handoff_tx,
                handoff_rx,
            }),
            stack: Vec::new(),
        }
    }
}

thread_local! {
    static LOCAL: RefCell<Option<LocalPool>> = const { RefCell::new(None) };
}

/// Take a shell from this thread's pool, or construct one.
pub(crate) fn get() -> Box<BufShell> {
    let pooled = LOCAL.try_with(|local| {
        let mut local = local.borrow_mut();
        let pool = local.get_or_insert_with(LocalPool::new);
        let home = Arc::downgrade(&pool.shard);
        let recycled = pool
            .stack
            .pop()
            .or_else(|| pool.shard.handoff_rx.try_recv().ok());
        let mut shell = match recycled {
            Some(shell) => {
                REUSED.fetch_add(1, Ordering::Relaxed);
                shell
            }
            None => {
                CREATED.fetch_add(1, Ordering::Relaxed);
                Box::new(BufShell::new())
            }
        };
        shell.home = home;
        shell
    });

    // Thread-local storage already torn down: plain allocation.
    pooled.unwrap_or_else(|_| {
        CREATED.fetch_add(1, Ordering::Relaxed);
        Box::new(BufShell::new())
    })
}

/// Return a shell whose page has already been given back.
pub(crate) fn recycle(mut shell: Box<BufShell>) {
    shell.reset();
    let Some(home) = shell.home.upgrade() else {
        DROPPED.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let shell = match LOCAL.try_with(|local| {
        let mut local = local.borrow_mut();
        match local.as_mut() {
            Some(pool) if Arc::ptr_eq(&pool.shard, &home) => {
                if pool.stack.len() < capacity() {
                    pool.stack.push(shell);
                } else {
                    DROPPED.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
            _ => Some(shell),
        }
    }) {
        Ok(None) => return,
        Ok(Some(shell)) => shell,
        Err(_) => {
            DROPPED.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // Released on a foreign thread: send it home.
    if home.handoff_tx.try_send(shell).is_ok() {
        HANDED_OFF.fetch_add(1, Ordering::Relaxed);
    } else {
        DROPPED.fetch_add(1, Ordering::Relaxed);
    }
}

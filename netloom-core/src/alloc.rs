//! Allocation primitives for Netloom
//!
//! This module is the ONLY place where unsafe memory manipulation is allowed.
//! All invariants are enforced here so the rest of the system can remain 100% safe.
//!
//! The [`Arena`] owns a bounded set of regions. Each region is one pinned,
//! zero-initialized allocation that is never resized or moved. A [`Page`] is
//! an exclusive lease on a sub-range of exactly one region:
//!
//! - No two live pages of a region overlap (free-list invariant).
//! - Region bytes never exceed the configured capacity, so outstanding bytes
//!   never do either.
//! - A page is returned exactly once: `deallocate` consumes it, and dropping
//!   a page that was never deallocated returns it as well.

#![allow(unsafe_code)]

use crate::buffer::PooledBuf;
use crate::error::ArenaError;
use crate::options::ArenaConfig;

use bytes::Bytes;
use compio::buf::{IoBuf, IoBufMut, SetBufInit};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Region alignment; also avoids false sharing between regions.
pub const PAGE_ALIGN: usize = 128;

/// Page spans are rounded up to a multiple of this many bytes.
pub const GRANULE: usize = 64;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Round a request up to the span it occupies in a region.
#[inline]
const fn span_for(size: usize) -> usize {
    if size == 0 {
        GRANULE
    } else {
        (size + GRANULE - 1) / GRANULE * GRANULE
    }
}

/// One pinned chunk of memory.
///
/// Invariant:
/// - Memory is allocated once and never moved.
/// - Freed only when the owning arena is dropped, which cannot happen while
///   any page still holds the arena alive.
struct RegionMemory {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for RegionMemory {}
unsafe impl Sync for RegionMemory {}

impl RegionMemory {
    fn new(len: usize) -> Self {
        // SAFETY: len is non-zero (spans are at least GRANULE) and PAGE_ALIGN
        // is a power of two, so the layout is valid.
        unsafe {
            let layout = Layout::from_size_align_unchecked(len, PAGE_ALIGN);
            let ptr = alloc_zeroed(layout);
            let Some(ptr) = NonNull::new(ptr) else {
                std::alloc::handle_alloc_error(layout);
            };
            Self { ptr, len }
        }
    }
}

impl Drop for RegionMemory {
    fn drop(&mut self) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, PAGE_ALIGN);
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

struct Region {
    memory: RegionMemory,
    /// Free spans keyed by offset. Adjacent spans are always coalesced.
    free: BTreeMap<usize, usize>,
    /// Live leases: offset -> (span, generation).
    leases: HashMap<usize, (usize, u64)>,
}

impl Region {
    fn new(len: usize) -> Self {
        let mut free = BTreeMap::new();
        free.insert(0, len);
        Self {
            memory: RegionMemory::new(len),
            free,
            leases: HashMap::new(),
        }
    }

    /// First fit by lowest offset.
    fn carve(&mut self, span: usize) -> Option<usize> {
        let (&offset, &len) = self.free.iter().find(|(_, &len)| len >= span)?;
        self.free.remove(&offset);
        if len > span {
            self.free.insert(offset + span, len - span);
        }
        Some(offset)
    }

    fn give_back(&mut self, mut offset: usize, mut span: usize) {
        if let Some(next_len) = self.free.remove(&(offset + span)) {
            span += next_len;
        }
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                span += prev_len;
            }
        }
        self.free.insert(offset, span);
    }
}

struct Lease {
    region: usize,
    offset: usize,
    span: usize,
    generation: u64,
    ptr: NonNull<u8>,
}

struct ArenaState {
    regions: Vec<Region>,
    reserved: usize,
    outstanding: usize,
    live: usize,
    waiters: usize,
    next_generation: u64,
    shutdown: bool,
}

impl ArenaState {
    fn carve(&mut self, span: usize, config: &ArenaConfig) -> Option<Lease> {
        let found = self
            .regions
            .iter_mut()
            .enumerate()
            .find_map(|(idx, region)| region.carve(span).map(|offset| (idx, offset)));

        let (region, offset) = match found {
            Some(hit) => hit,
            None => {
                let remaining = config.capacity - self.reserved;
                let len = config.region_size.max(span).min(remaining);
                if len < span {
                    return None;
                }
                let mut fresh = Region::new(len);
                let offset = fresh.carve(span)?;
                self.reserved += len;
                self.regions.push(fresh);
                trace!(region = self.regions.len() - 1, bytes = len, "opened arena region");
                (self.regions.len() - 1, offset)
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        self.outstanding += span;
        self.live += 1;

        let slot = &mut self.regions[region];
        slot.leases.insert(offset, (span, generation));
        // SAFETY: offset + span <= region length by construction of the free list.
        let ptr = unsafe { NonNull::new_unchecked(slot.memory.ptr.as_ptr().add(offset)) };

        Some(Lease {
            region,
            offset,
            span,
            generation,
            ptr,
        })
    }
}

struct ArenaInner {
    id: u64,
    config: ArenaConfig,
    state: Mutex<ArenaState>,
    space: Condvar,
}

impl ArenaInner {
    fn give_back(
        &self,
        region: usize,
        offset: usize,
        span: usize,
        generation: u64,
    ) -> Result<(), ArenaError> {
        let mut state = self.state.lock();
        let Some(slot) = state.regions.get_mut(region) else {
            return Err(ArenaError::DoubleFree { region, offset });
        };
        // A stale page must match the live lease exactly before it frees anything.
        match slot.leases.get(&offset) {
            Some(&(live_span, live_gen)) if live_gen == generation && live_span == span => {
                slot.leases.remove(&offset);
                slot.give_back(offset, span);
                state.outstanding -= span;
                state.live -= 1;
                if state.waiters > 0 {
                    self.space.notify_all();
                }
                Ok(())
            }
            _ => Err(ArenaError::DoubleFree { region, offset }),
        }
    }
}

/// Point-in-time arena statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Configured ceiling.
    pub capacity: usize,
    /// Bytes held by opened regions.
    pub reserved: usize,
    /// Bytes currently leased (rounded to the granule).
    pub outstanding: usize,
    /// Number of opened regions.
    pub regions: usize,
    /// Number of live pages.
    pub live_pages: usize,
    /// Threads currently blocked in `allocate`.
    pub waiters: usize,
}

/// Fixed-capacity pool of reusable byte regions.
///
/// Shared by every channel of an engine. `allocate`/`deallocate` are safe to
/// call concurrently; the free lists are serialized by one mutex and blocked
/// callers park on a condition variable with an explicit deadline.
///
/// # Examples
///
/// ```
/// use netloom_core::alloc::Arena;
/// use netloom_core::options::ArenaConfig;
/// use std::time::Duration;
///
/// let arena = Arena::new(ArenaConfig::new(4096, 1024));
/// let page = arena.allocate(100, Duration::ZERO).unwrap();
/// assert_eq!(page.len(), 100);
/// arena.deallocate(page).unwrap();
/// assert_eq!(arena.stats().outstanding, 0);
/// ```
///
/// Releasing the same page twice does not compile, because `deallocate`
/// consumes the page:
///
/// ```compile_fail
/// use netloom_core::alloc::Arena;
/// use netloom_core::options::ArenaConfig;
/// use std::time::Duration;
///
/// let arena = Arena::new(ArenaConfig::new(4096, 1024));
/// let page = arena.allocate(100, Duration::ZERO).unwrap();
/// arena.deallocate(page).unwrap();
/// arena.deallocate(page).unwrap();
/// ```
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.inner.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Arena {
    #[must_use]
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: Mutex::new(ArenaState {
                    regions: Vec::new(),
                    reserved: 0,
                    outstanding: 0,
                    live: 0,
                    waiters: 0,
                    next_generation: 1,
                    shutdown: false,
                }),
                space: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> ArenaConfig {
        self.inner.config
    }

    /// Lease `size` bytes, waiting up to `max_wait` for space.
    ///
    /// # Errors
    ///
    /// - `ArenaError::Timeout` when no space was released in time. This is a
    ///   backpressure signal, not a failure.
    /// - `ArenaError::TooLarge` when `size` can never fit.
    /// - `ArenaError::Shutdown` after [`Arena::shutdown`].
    pub fn allocate(&self, size: usize, max_wait: Duration) -> Result<Page, ArenaError> {
        self.allocate_inner(size, max_wait, None)
    }

    /// Like [`Arena::allocate`] but never blocks.
    pub fn try_allocate(&self, size: usize) -> Result<Page, ArenaError> {
        self.allocate_inner(size, Duration::ZERO, None)
    }

    /// Like [`Arena::allocate`], failing with `ArenaError::Cancelled` as soon
    /// as `cancel` is set and [`Arena::interrupt_waiters`] is called.
    pub fn allocate_cancellable(
        &self,
        size: usize,
        max_wait: Duration,
        cancel: &AtomicBool,
    ) -> Result<Page, ArenaError> {
        self.allocate_inner(size, max_wait, Some(cancel))
    }

    fn allocate_inner(
        &self,
        size: usize,
        max_wait: Duration,
        cancel: Option<&AtomicBool>,
    ) -> Result<Page, ArenaError> {
        let span = span_for(size);
        let capacity = self.inner.config.capacity;
        if span > capacity {
            return Err(ArenaError::TooLarge { size, capacity });
        }

        let deadline = Instant::now().checked_add(max_wait);
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                return Err(ArenaError::Shutdown);
            }
            if cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                return Err(ArenaError::Cancelled);
            }
            if let Some(lease) = state.carve(span, &self.inner.config) {
                drop(state);
                return Ok(Page {
                    arena: Arc::clone(&self.inner),
                    region: lease.region,
                    offset: lease.offset,
                    span: lease.span,
                    len: size,
                    generation: lease.generation,
                    ptr: lease.ptr,
                    returned: false,
                });
            }

            let expired = match deadline {
                Some(deadline) => Instant::now() >= deadline,
                None => false,
            };
            if max_wait.is_zero() || expired {
                return Err(ArenaError::Timeout {
                    size,
                    waited: max_wait,
                });
            }

            state.waiters += 1;
            match deadline {
                Some(deadline) => {
                    self.inner.space.wait_until(&mut state, deadline);
                }
                None => self.inner.space.wait(&mut state),
            }
            state.waiters -= 1;
        }
    }

    /// Return a page to this arena.
    ///
    /// # Errors
    ///
    /// - `ArenaError::ForeignPage` if the page was leased from another arena;
    ///   the page is then returned to its own arena instead.
    /// - `ArenaError::DoubleFree` if the lease was already returned.
    pub fn deallocate(&self, mut page: Page) -> Result<(), ArenaError> {
        if !Arc::ptr_eq(&page.arena, &self.inner) {
            error!(
                arena = self.inner.id,
                owner = page.arena.id,
                "deallocate called with a page from another arena"
            );
            return Err(ArenaError::ForeignPage);
        }
        page.returned = true;
        self.inner
            .give_back(page.region, page.offset, page.span, page.generation)
    }

    /// Wake every blocked allocation so it re-checks its cancel flag.
    pub fn interrupt_waiters(&self) {
        let _state = self.inner.state.lock();
        self.inner.space.notify_all();
    }

    /// Refuse further allocations and wake all waiters.
    ///
    /// Live pages stay valid and may still be returned.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.space.notify_all();
    }

    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let state = self.inner.state.lock();
        ArenaStats {
            capacity: self.inner.config.capacity,
            reserved: state.reserved,
            outstanding: state.outstanding,
            regions: state.regions.len(),
            live_pages: state.live,
            waiters: state.waiters,
        }
    }
}

/// An exclusive lease on `[offset, offset + len)` of one arena region.
///
/// Pages are move-only tokens. Ownership passes to whoever holds the page
/// until it is given to [`Arena::deallocate`] or dropped.
pub struct Page {
    arena: Arc<ArenaInner>,
    region: usize,
    offset: usize,
    span: usize,
    len: usize,
    generation: u64,
    ptr: NonNull<u8>,
    returned: bool,
}

// SAFETY: the leased range is exclusively owned by this page (free-list
// invariant) and the region memory outlives it (the page holds the arena).
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Requested length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn region(&self) -> usize {
        self.region
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Allocation generation; unique per lease within one arena.
    #[inline]
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [ptr, ptr + len) is inside the region, initialized (regions
        // are zeroed) and exclusively leased to this page.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees no other borrow.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Freeze the whole page into immutable, reference-counted `Bytes`.
    ///
    /// The page goes back to the arena when the last clone is dropped.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for Page {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("region", &self.region)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if let Err(e) = self
            .arena
            .give_back(self.region, self.offset, self.span, self.generation)
        {
            error!(error = %e, "failed to return dropped page");
        }
    }
}

/// Zero-copy `IoBuf` wrapper for Bytes.
///
/// Lets shared payloads go straight to compio writes without a memcpy.
pub struct IoBytes(Bytes);

impl IoBytes {
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Bytes> for IoBytes {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<IoBytes> for Bytes {
    fn from(io_bytes: IoBytes) -> Self {
        io_bytes.0
    }
}

// SAFETY: IoBytes wraps Bytes which is:
// - Immutable (no mutable aliasing)
// - Refcounted (memory stays valid)
// - Contiguous (valid pointer/len guarantees)
unsafe impl IoBuf for IoBytes {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.0.len()
    }
}

// SAFETY: PooledBuf upholds IoBuf invariants:
// - the pointer is the page base plus the reader index
// - [ptr, ptr + len) is the readable, initialized window
// - the page is pinned and exclusively owned while the operation runs
// - a released wrapper reports a dangling pointer with zero length
unsafe impl IoBuf for PooledBuf {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        match self.page_ref() {
            Some(page) => unsafe { page.as_ptr().add(self.reader_index()) },
            None => NonNull::<u8>::dangling().as_ptr(),
        }
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.readable_bytes()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.capacity() - self.reader_index()
    }
}

// SAFETY: same window as IoBuf, writable up to the page length.
unsafe impl IoBufMut for PooledBuf {
    #[inline]
    fn as_buf_mut_ptr(&mut self) -> *mut u8 {
        let reader = self.reader_index();
        match self.page_mut() {
            Some(page) => unsafe { page.as_mut_ptr().add(reader) },
            None => NonNull::<u8>::dangling().as_ptr(),
        }
    }
}

impl SetBufInit for PooledBuf {
    #[inline]
    unsafe fn set_buf_init(&mut self, len: usize) {
        debug_assert!(self.reader_index() + len <= self.capacity());
        self.set_writer_index(self.reader_index() + len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn arena(capacity: usize, region: usize) -> Arena {
        Arena::new(ArenaConfig::new(capacity, region))
    }

    #[test]
    fn conservation_over_paired_sequence() {
        let arena = arena(8192, 2048);
        let mut pages = Vec::new();
        for size in [10, 64, 65, 300, 1000, 1, 2000] {
            pages.push(arena.allocate(size, Duration::ZERO).unwrap());
            assert!(arena.stats().outstanding <= 8192);
            assert!(arena.stats().reserved <= 8192);
        }
        // release in a scrambled order
        for idx in [3, 0, 6, 1, 5, 2, 4] {
            let page = std::mem::replace(
                &mut pages[idx],
                arena.allocate(0, Duration::ZERO).unwrap(),
            );
            arena.deallocate(page).unwrap();
        }
        for page in pages {
            arena.deallocate(page).unwrap();
        }
        let stats = arena.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.live_pages, 0);
    }

    #[test]
    fn first_fit_reuses_released_range() {
        let arena = arena(4096, 4096);
        let a = arena.allocate(128, Duration::ZERO).unwrap();
        let b = arena.allocate(128, Duration::ZERO).unwrap();
        assert_eq!((a.offset(), b.offset()), (0, 128));

        let a_offset = a.offset();
        arena.deallocate(a).unwrap();
        let c = arena.allocate(100, Duration::ZERO).unwrap();
        assert_eq!(c.offset(), a_offset);
        assert_eq!(c.region(), 0);
        drop(b);
        drop(c);
        assert_eq!(arena.stats().outstanding, 0);
    }

    #[test]
    fn released_neighbours_coalesce() {
        let arena = arena(1024, 1024);
        let a = arena.allocate(256, Duration::ZERO).unwrap();
        let b = arena.allocate(256, Duration::ZERO).unwrap();
        let c = arena.allocate(512, Duration::ZERO).unwrap();
        drop(a);
        drop(c);
        drop(b);
        // whole region is one span again
        let all = arena.allocate(1024, Duration::ZERO).unwrap();
        assert_eq!(all.offset(), 0);
    }

    #[test]
    fn pages_never_overlap() {
        let arena = arena(4096, 1024);
        let pages: Vec<Page> = (0..16)
            .map(|i| arena.allocate(100 + i, Duration::ZERO).unwrap())
            .collect();
        for (i, a) in pages.iter().enumerate() {
            for b in &pages[i + 1..] {
                if a.region() == b.region() {
                    let a_end = a.offset() + span_for(a.len());
                    let b_end = b.offset() + span_for(b.len());
                    assert!(a_end <= b.offset() || b_end <= a.offset());
                }
            }
        }
    }

    #[test]
    fn capacity_is_a_hard_ceiling() {
        let arena = arena(1024, 512);
        let _a = arena.allocate(512, Duration::ZERO).unwrap();
        let _b = arena.allocate(512, Duration::ZERO).unwrap();
        let err = arena.allocate(64, Duration::ZERO).unwrap_err();
        assert!(err.is_backpressure());
        assert_eq!(arena.stats().reserved, 1024);

        assert!(matches!(
            arena.allocate(4096, Duration::ZERO),
            Err(ArenaError::TooLarge { .. })
        ));
    }

    #[test]
    fn allocate_times_out_as_backpressure() {
        let arena = arena(256, 256);
        let _held = arena.allocate(256, Duration::ZERO).unwrap();
        let start = Instant::now();
        let err = arena.allocate(64, Duration::from_millis(50)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert!(matches!(err, ArenaError::Timeout { size: 64, .. }));
    }

    #[test]
    fn blocked_allocate_wakes_on_release() {
        let arena = arena(256, 256);
        let held = arena.allocate(256, Duration::ZERO).unwrap();
        let waiter = {
            let arena = arena.clone();
            thread::spawn(move || arena.allocate(128, Duration::from_secs(5)))
        };
        while arena.stats().waiters == 0 {
            thread::yield_now();
        }
        arena.deallocate(held).unwrap();
        let page = waiter.join().unwrap().unwrap();
        assert_eq!(page.len(), 128);
    }

    #[test]
    fn cancelled_allocate_fails_fast() {
        let arena = arena(128, 128);
        let _held = arena.allocate(128, Duration::ZERO).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let arena = arena.clone();
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || arena.allocate_cancellable(64, Duration::from_secs(30), &cancel))
        };
        while arena.stats().waiters == 0 {
            thread::yield_now();
        }
        cancel.store(true, Ordering::Release);
        arena.interrupt_waiters();
        assert_eq!(waiter.join().unwrap().unwrap_err(), ArenaError::Cancelled);
    }

    #[test]
    fn shutdown_rejects_allocations() {
        let arena = arena(1024, 1024);
        let live = arena.allocate(64, Duration::ZERO).unwrap();
        arena.shutdown();
        assert_eq!(
            arena.allocate(64, Duration::ZERO).unwrap_err(),
            ArenaError::Shutdown
        );
        arena.deallocate(live).unwrap();
        assert_eq!(arena.stats().outstanding, 0);
    }

    #[test]
    fn mismatched_span_frees_nothing() {
        let arena = arena(1024, 1024);
        let page = arena.allocate(64, Duration::ZERO).unwrap();
        assert_eq!(
            arena
                .inner
                .give_back(page.region, page.offset, page.span * 2, page.generation)
                .unwrap_err(),
            ArenaError::DoubleFree {
                region: page.region,
                offset: page.offset
            }
        );
        assert_eq!(arena.stats().outstanding, span_for(64));
        arena.deallocate(page).unwrap();
        assert_eq!(arena.stats().outstanding, 0);
    }

    #[test]
    fn foreign_page_is_rejected_and_returned_home() {
        let home = arena(1024, 1024);
        let other = arena(1024, 1024);
        let page = home.allocate(64, Duration::ZERO).unwrap();
        assert_eq!(other.deallocate(page).unwrap_err(), ArenaError::ForeignPage);
        assert_eq!(home.stats().outstanding, 0);
        assert_eq!(other.stats().outstanding, 0);
    }

    #[test]
    fn frozen_page_returns_when_last_clone_drops() {
        let arena = arena(1024, 1024);
        let mut page = arena.allocate(4, Duration::ZERO).unwrap();
        page.as_mut_slice().copy_from_slice(b"ping");
        let bytes = page.freeze();
        let clone = bytes::Bytes::slice(&bytes, 1..);
        drop(bytes);
        assert_eq!(arena.stats().live_pages, 1);
        assert_eq!(&clone[..], b"ing");
        drop(clone);
        assert_eq!(arena.stats().live_pages, 0);
    }

    #[test]
    fn concurrent_churn_keeps_accounting() {
        let arena = arena(64 * 1024, 8 * 1024);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let arena = arena.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        let size = 1 + (i * 37 + t * 11) % 900;
                        let page = arena.allocate(size, Duration::from_secs(5)).unwrap();
                        assert_eq!(page.len(), size);
                        arena.deallocate(page).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(arena.stats().outstanding, 0);
        assert!(arena.stats().reserved <= 64 * 1024);
    }
}

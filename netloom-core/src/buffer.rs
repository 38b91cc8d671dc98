//! Pooled, reference-counted buffer over an arena page.
//!
//! A [`PooledBuf`] is a bounded byte buffer with independent reader and
//! writer cursors. Its wrapper state comes from the per-thread
//! [`recycler`](crate::recycler) and its bytes from an [`Arena`] page. When
//! the reference count reaches zero the page goes back to the arena and the
//! wrapper back to the recycler; every later access sees an empty,
//! released buffer.
//!
//! The buffer never grows. Writing past the page length fails with
//! [`BufferError::Overflow`].

use crate::alloc::{Arena, Page};
use crate::error::{ArenaError, BufferError};
use crate::recycler::{self, BufShell};

use bytes::{Buf, Bytes};
use std::fmt;
use std::time::Duration;
use tracing::error;

pub struct PooledBuf {
    shell: Option<Box<BufShell>>,
}

impl PooledBuf {
    /// Bind `page` to a recycled wrapper with a reference count of one.
    #[must_use]
    pub fn new(page: Page) -> Self {
        let mut shell = recycler::get();
        shell.bind(page);
        Self { shell: Some(shell) }
    }

    /// Allocate a page of `size` bytes and wrap it.
    pub fn allocate(arena: &Arena, size: usize, max_wait: Duration) -> Result<Self, ArenaError> {
        arena.allocate(size, max_wait).map(Self::new)
    }

    /// Allocate and fill with `src`.
    pub fn copy_from_slice(
        arena: &Arena,
        src: &[u8],
        max_wait: Duration,
    ) -> Result<Self, ArenaError> {
        let mut buf = Self::allocate(arena, src.len(), max_wait)?;
        if let Some(shell) = buf.shell.as_mut() {
            if let Some(page) = shell.page.as_mut() {
                page.as_mut_slice().copy_from_slice(src);
                shell.writer = src.len();
            }
        }
        Ok(buf)
    }

    #[inline]
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shell.is_none()
    }

    /// Page length, or zero once released.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.page_ref().map_or(0, Page::len)
    }

    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.shell.as_ref().map_or(0, |s| s.refs)
    }

    #[inline]
    #[must_use]
    pub fn reader_index(&self) -> usize {
        self.shell.as_ref().map_or(0, |s| s.reader)
    }

    #[inline]
    #[must_use]
    pub fn writer_index(&self) -> usize {
        self.shell.as_ref().map_or(0, |s| s.writer)
    }

    #[inline]
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index() - self.reader_index()
    }

    #[inline]
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer_index()
    }

    /// The readable window `[reader, writer)`.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self.shell.as_ref() {
            Some(shell) => match shell.page.as_ref() {
                Some(page) => &page.as_slice()[shell.reader..shell.writer],
                None => &[],
            },
            None => &[],
        }
    }

    /// Append bytes at the writer cursor.
    ///
    /// # Errors
    ///
    /// `Released` after the last release, `Overflow` if `src` does not fit.
    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), BufferError> {
        let shell = self.shell.as_mut().ok_or(BufferError::Released)?;
        let page = shell.page.as_mut().ok_or(BufferError::Released)?;
        let available = page.len() - shell.writer;
        if src.len() > available {
            return Err(BufferError::Overflow {
                requested: src.len(),
                available,
            });
        }
        page.as_mut_slice()[shell.writer..shell.writer + src.len()].copy_from_slice(src);
        shell.writer += src.len();
        Ok(())
    }

    /// Reset both cursors, keeping the page.
    pub fn clear(&mut self) {
        if let Some(shell) = self.shell.as_mut() {
            shell.reader = 0;
            shell.writer = 0;
        }
    }

    /// Add a reference. Returns the new count.
    pub fn retain(&mut self) -> Result<usize, BufferError> {
        match self.shell.as_mut() {
            Some(shell) => {
                shell.refs += 1;
                Ok(shell.refs)
            }
            None => {
                error!("retain on a released buffer");
                Err(BufferError::Released)
            }
        }
    }

    /// Drop a reference. Returns `true` when this call released the page.
    ///
    /// # Errors
    ///
    /// `BufferError::Released` if the count already reached zero. This is a
    /// programming error; it is logged and has no other effect.
    pub fn release(&mut self) -> Result<bool, BufferError> {
        let Some(shell) = self.shell.as_mut() else {
            error!("release on an already released buffer");
            return Err(BufferError::Released);
        };
        shell.refs -= 1;
        if shell.refs > 0 {
            return Ok(false);
        }
        self.deallocate();
        Ok(true)
    }

    /// Convert the readable window into shared `Bytes` without copying.
    ///
    /// The page stays leased until the last `Bytes` clone is dropped.
    #[must_use]
    pub fn freeze(mut self) -> Bytes {
        let Some(mut shell) = self.shell.take() else {
            return Bytes::new();
        };
        let (reader, writer) = (shell.reader, shell.writer);
        let bytes = shell
            .page
            .take()
            .map_or_else(Bytes::new, |page| page.freeze().slice(reader..writer));
        recycler::recycle(shell);
        bytes
    }

    fn deallocate(&mut self) {
        if let Some(mut shell) = self.shell.take() {
            // Page drop returns the lease.
            drop(shell.page.take());
            recycler::recycle(shell);
        }
    }

    #[inline]
    pub(crate) fn page_ref(&self) -> Option<&Page> {
        self.shell.as_ref().and_then(|s| s.page.as_ref())
    }

    #[inline]
    pub(crate) fn page_mut(&mut self) -> Option<&mut Page> {
        self.shell.as_mut().and_then(|s| s.page.as_mut())
    }

    #[inline]
    pub(crate) fn set_writer_index(&mut self, writer: usize) {
        if let Some(shell) = self.shell.as_mut() {
            shell.writer = writer;
        }
    }
}

impl Buf for PooledBuf {
    #[inline]
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.readable_bytes(),
            "cannot advance past readable bytes: {} > {}",
            cnt,
            self.readable_bytes()
        );
        if let Some(shell) = self.shell.as_mut() {
            shell.reader += cnt;
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.deallocate();
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("reader", &self.reader_index())
            .field("writer", &self.writer_index())
            .field("capacity", &self.capacity())
            .field("refs", &self.ref_count())
            .finish()
    }
}

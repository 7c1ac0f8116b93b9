//! Reusable buffer pool
//!
//! Fixed-capacity `BytesMut` buffers handed out as owning [`PooledBuf`]
//! handles. Release happens on scope exit: whatever path a buffer takes
//! through the writer, it returns to the pool exactly once when the handle
//! drops, and Rust's move semantics make a second free unrepresentable.
//! The outstanding counter is the leak tracker; it must read zero once all
//! handles are gone.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Capacity of each pooled buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024;

/// How many free buffers the pool retains before dropping extras
pub const DEFAULT_POOL_LIMIT: usize = 16;

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    limit: usize,
    outstanding: AtomicUsize,
}

/// A pool of reusable fixed-capacity buffers.
///
/// Cheap to clone; clones share the same free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with the default buffer capacity and retention limit
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY, DEFAULT_POOL_LIMIT)
    }

    /// Create a pool with custom buffer capacity and retention limit
    pub fn with_capacity(capacity: usize, limit: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(limit)),
                capacity,
                limit,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a buffer from the pool, allocating a fresh one if none is free.
    pub fn acquire(&self) -> PooledBuf {
        let buf = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.capacity));

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffers currently checked out. Non-zero after all users are done
    /// means something leaked a handle.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Buffers currently sitting in the free list
    pub fn free_count(&self) -> usize {
        self.inner.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An owning handle to a pooled buffer.
///
/// Dereferences to `BytesMut`; returns the buffer to the pool on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        buf.clear();
        if let Ok(mut free) = self.pool.free.lock() {
            if free.len() < self.pool.limit {
                free.push(buf);
            }
        }
    }
}

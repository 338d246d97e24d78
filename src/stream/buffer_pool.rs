//! Pooled scratch buffers
//!
//! Conduits borrow fixed-size buffers for ciphertext and overflow plaintext
//! and hand them back when the connection no longer needs them. A buffer
//! goes back to the free list when its [`PooledBuffer`] is dropped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::protocol::constants::MAX_PACKET_LEN;

/// Default pooled buffer size: one maximum TLS record plus header
pub const DEFAULT_BUFFER_SIZE: usize = MAX_PACKET_LEN;

/// Default number of idle buffers kept on the free list
pub const DEFAULT_MAX_BUFFERS: usize = 64;

struct PoolShared {
    buffer_size: usize,
    max_buffers: usize,
    free: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
    allocated: AtomicUsize,
}

// ============= Buffer Pool =============

/// Shared pool of equally-sized buffers
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BUFFERS)
    }

    pub fn with_config(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                max_buffers,
                free: Mutex::new(Vec::with_capacity(max_buffers)),
                outstanding: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Buffers currently handed out (pooled or oversized)
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Idle buffers on the free list
    pub fn idle(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Total pool-sized buffers ever allocated
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Take a buffer of the pool's size
    pub fn get(&self) -> PooledBuffer {
        let buf = self.shared.free.lock().pop().unwrap_or_else(|| {
            self.shared.allocated.fetch_add(1, Ordering::Relaxed);
            BytesMut::zeroed(self.shared.buffer_size)
        });
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer::new(buf, Some(self.shared.clone()))
    }

    /// Take a buffer with room for at least `size` bytes.
    ///
    /// Requests above the pool's buffer size get a one-off allocation that is
    /// freed rather than pooled when dropped.
    pub fn get_at_least(&self, size: usize) -> PooledBuffer {
        if size <= self.shared.buffer_size {
            return self.get();
        }
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer::new(BytesMut::zeroed(size), Some(self.shared.clone()))
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("outstanding", &self.outstanding())
            .field("idle", &self.idle())
            .finish()
    }
}

impl PoolShared {
    fn give_back(&self, buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if buf.len() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            free.push(buf);
        }
    }
}

// ============= Pooled Buffer =============

/// Buffer with read (`head`) and write (`tail`) cursors.
///
/// Bytes in `head..tail` are readable, `tail..capacity` is writable.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    head: usize,
    tail: usize,
    pool: Option<Arc<PoolShared>>,
}

impl PooledBuffer {
    fn new(buf: BytesMut, pool: Option<Arc<PoolShared>>) -> Self {
        Self { buf: Some(buf), head: 0, tail: 0, pool }
    }

    /// Standalone buffer that is not returned to any pool
    pub fn unpooled(size: usize) -> Self {
        Self::new(BytesMut::zeroed(size), None)
    }

    fn storage(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn capacity(&self) -> usize {
        self.storage().len()
    }

    /// Readable byte count
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Writable space after the tail
    pub fn space(&self) -> usize {
        self.capacity() - self.tail
    }

    pub fn is_full(&self) -> bool {
        self.head == 0 && self.tail == self.capacity()
    }

    pub fn readable(&self) -> &[u8] {
        let (head, tail) = (self.head, self.tail);
        &self.storage()[head..tail]
    }

    pub fn writable(&mut self) -> &mut [u8] {
        let tail = self.tail;
        &mut self.storage_mut()[tail..]
    }

    /// Mark `n` bytes of the writable region as filled
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.space());
        self.tail = (self.tail + n).min(self.capacity());
    }

    /// Drop `n` readable bytes from the front
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.head = (self.head + n).min(self.tail);
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Move readable bytes to the front so the whole tail is writable
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        let (head, tail) = (self.head, self.tail);
        self.storage_mut().copy_within(head..tail, 0);
        self.tail = tail - head;
        self.head = 0;
    }

    /// Copy as much of `data` as fits; returns the number copied
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        if self.space() < data.len() {
            self.compact();
        }
        let n = data.len().min(self.space());
        self.writable()[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    /// Copy readable bytes into `dst`, consuming them; returns the count
    pub fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let n = self.len().min(dst.len());
        dst[..n].copy_from_slice(&self.readable()[..n]);
        self.consume(n);
        n
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Replace this buffer with one of at least `size` bytes from `pool`,
    /// carrying the readable bytes over.
    pub fn grow(&mut self, pool: &BufferPool, size: usize) {
        let mut larger = pool.get_at_least(size.max(self.len()));
        larger.extend_from_slice(self.readable());
        *self = larger;
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.pool.take()) {
            pool.give_back(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}

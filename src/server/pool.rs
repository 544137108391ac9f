use crossbeam::queue::ArrayQueue;
use std::{
    fmt, mem,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Fixed-size pool of connection read buffers.
///
/// At most `capacity` buffers ever exist. They are allocated on first use
/// and recycled through a lock-free queue when a connection ends, so total
/// read-buffer memory is bounded by `capacity * buffer_size`.
pub(crate) struct BufferPool {
    free: ArrayQueue<Box<[u8]>>,
    allocated: AtomicUsize,
    buffer_size: usize,
}

impl BufferPool {
    pub(crate) fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            // ArrayQueue rejects a zero capacity
            free: ArrayQueue::new(capacity.max(1)),
            allocated: AtomicUsize::new(0),
            buffer_size,
        })
    }

    /// Takes a buffer, or `None` when every buffer is in use.
    pub(crate) fn acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        if let Some(buffer) = self.free.pop() {
            return Some(PooledBuffer::pooled(buffer, self));
        }

        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            if current >= self.free.capacity() {
                return self.free.pop().map(|buffer| PooledBuffer::pooled(buffer, self));
            }

            match self.allocated.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let buffer = vec![0; self.buffer_size].into_boxed_slice();
        Some(PooledBuffer::pooled(buffer, self))
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.free.len() + self.free.capacity() - self.allocated.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("free", &self.free.len())
            .field("allocated", &self.allocated.load(Ordering::Relaxed))
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

/// A read buffer that returns to its pool when dropped.
pub struct PooledBuffer {
    buffer: Box<[u8]>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuffer {
    fn pooled(buffer: Box<[u8]>, pool: &Arc<BufferPool>) -> Self {
        Self {
            buffer,
            pool: Some(Arc::clone(pool)),
        }
    }

    /// A buffer that belongs to no pool.
    pub(crate) fn detached(size: usize) -> Self {
        Self {
            buffer: vec![0; size].into_boxed_slice(),
            pool: None,
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let _ = pool.free.push(mem::take(&mut self.buffer));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

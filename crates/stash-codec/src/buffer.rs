//! Reusable scratch buffers for block I/O.
//!
//! The pool hands out fixed-size buffers under a single lock and takes them
//! back when the RAII guard drops. Acquisition never blocks: an empty pool
//! falls back to a fresh allocation.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Size of one pool buffer. Inputs at most this long are hashed and copied
/// through a single slot; longer inputs take the chunked paths.
pub const BUFFER_SLOT_SIZE: usize = 4 * 1024 * 1024;

/// Pool of reusable scratch buffers.
#[derive(Default)]
pub struct BufferPool {
    slots: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer from the pool, allocating if none is free.
    pub fn acquire(&self) -> PoolBuffer<'_> {
        let buf = self
            .slots
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SLOT_SIZE].into_boxed_slice());
        PoolBuffer {
            pool: self,
            buf: Some(buf),
        }
    }

    fn release(&self, buf: Box<[u8]>) {
        self.slots.lock().unwrap().push(buf);
    }

    /// Number of buffers currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// A pool buffer, returned to its pool on drop.
pub struct PoolBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for PoolBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

impl DerefMut for PoolBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PoolBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_slot_on_drop() {
        let pool = BufferPool::new();
        assert_eq!(pool.idle_count(), 0);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 2);
        {
            let _c = pool.acquire();
            assert_eq!(pool.idle_count(), 1);
        }
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_buffer_is_full_size() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        assert_eq!(buf.len(), BUFFER_SLOT_SIZE);
    }
}

//! Reusable text buffer pool.
//!
//! Every batch builds one envelope string, and every queued call carries
//! its pre-serialized body string. The pool keeps those allocations alive
//! across batches instead of paying for them per call.
//!
//! Checkout never blocks: if the free list is empty a fresh buffer is
//! allocated, so the send path is never stalled by pool contention. The
//! free list has a fixed capacity; buffers recycled beyond it are dropped.

use std::sync::{Arc, Mutex};

/// Number of buffers kept alive by default.
pub const DEFAULT_POOL_SIZE: usize = 256;

/// Initial capacity of each pooled buffer.
const BUFFER_CAPACITY: usize = 512;

/// A shared pool of reusable `String` buffers.
///
/// Cloning the pool is cheap and yields a handle to the same free list.
#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<String>>>,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool pre-filled to [`DEFAULT_POOL_SIZE`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_SIZE)
    }

    /// Create a pool pre-filled with `capacity` buffers.
    pub fn with_capacity(capacity: usize) -> Self {
        let free = (0..capacity)
            .map(|_| String::with_capacity(BUFFER_CAPACITY))
            .collect();
        Self {
            free: Arc::new(Mutex::new(free)),
            capacity,
        }
    }

    /// Take a buffer out of the pool, or allocate a fresh one if the pool
    /// is empty. Never blocks beyond the brief free-list lock.
    pub fn checkout(&self) -> String {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop()
            .unwrap_or_else(|| String::with_capacity(BUFFER_CAPACITY))
    }

    /// Return a buffer to the pool. The buffer is cleared; if the free
    /// list is already at capacity the buffer is dropped instead.
    pub fn recycle(&self, mut buf: String) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_starts_full() {
        let pool = BufferPool::with_capacity(4);
        assert_eq!(pool.idle(), 4);
    }

    #[test]
    fn test_checkout_and_recycle() {
        let pool = BufferPool::with_capacity(2);

        let mut buf = pool.checkout();
        assert_eq!(pool.idle(), 1);

        buf.push_str("<value><int>1</int></value>");
        pool.recycle(buf);
        assert_eq!(pool.idle(), 2);

        // Recycled buffers come back cleared.
        let buf = pool.checkout();
        assert!(buf.is_empty());
        assert!(buf.capacity() > 0);
    }

    #[test]
    fn test_empty_pool_falls_back_to_allocation() {
        let pool = BufferPool::with_capacity(1);
        let a = pool.checkout();
        let b = pool.checkout();
        assert_eq!(pool.idle(), 0);
        drop((a, b));
    }

    #[test]
    fn test_recycle_beyond_capacity_drops_buffer() {
        let pool = BufferPool::with_capacity(1);
        let a = pool.checkout();
        pool.recycle(a);
        pool.recycle(String::from("extra"));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_clones_share_free_list() {
        let pool = BufferPool::with_capacity(3);
        let other = pool.clone();
        let _buf = pool.checkout();
        assert_eq!(other.idle(), 2);
    }
}

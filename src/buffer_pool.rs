//! Reusable byte-buffer pool for the TUN read path.
//!
//! Buffers are plain `Vec<u8>` handed out zeroed and length-set; oversized
//! requests bypass the pool entirely.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_POOL_SIZE: usize = 64;
const MAX_POOLED_CAPACITY: usize = 64 * 1024;
const MAX_POOL_ENTRIES: usize = 128;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub direct: u64,
}

pub struct BufferPool {
    buffers: Mutex<VecDeque<Vec<u8>>>,
    buffer_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    direct: AtomicU64,
}

impl BufferPool {
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let mut buffers = VecDeque::with_capacity(pool_size);
        for _ in 0..pool_size {
            buffers.push_back(vec![0u8; buffer_size]);
        }
        Self {
            buffers: Mutex::new(buffers),
            buffer_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            direct: AtomicU64::new(0),
        }
    }

    /// Fetch a zeroed buffer of at least `min` bytes. Requests beyond the
    /// pooled capacity allocate directly and never return to the pool.
    pub fn acquire(&self, min: usize) -> Vec<u8> {
        if min > MAX_POOLED_CAPACITY {
            self.direct.fetch_add(1, Ordering::Relaxed);
            return vec![0u8; min];
        }
        let reused = {
            let mut guard = self.buffers.lock();
            let head_fits = guard.front().is_some_and(|front| front.capacity() >= min);
            if head_fits {
                guard.pop_front()
            } else {
                None
            }
        };
        match reused {
            Some(mut buffer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buffer.clear();
                buffer.resize(buffer.capacity(), 0);
                buffer
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; min.max(self.buffer_size)]
            }
        }
    }

    /// Return a buffer. Oversized buffers and overflow beyond the retain cap
    /// are dropped on the floor.
    pub fn release(&self, buffer: Vec<u8>) {
        if buffer.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let mut guard = self.buffers.lock();
        if guard.len() < MAX_POOL_ENTRIES {
            guard.push_back(buffer);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE, DEFAULT_BUFFER_SIZE)
    }
}

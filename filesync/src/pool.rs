//! Process-wide pool of copy buffers

use std::sync::{Mutex, MutexGuard, OnceLock};

/// Default size of a pooled buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

const MAX_POOLED: usize = 64;

static GLOBAL: OnceLock<BufferPool> = OnceLock::new();

/// A concurrency-safe free list of byte buffers. Buffers are checked out with
/// [`BufferPool::get`] and must be handed back with [`BufferPool::put`].
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            free: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide pool
    pub fn global() -> &'static BufferPool {
        GLOBAL.get_or_init(|| BufferPool::new(DEFAULT_BUFFER_SIZE))
    }

    /// Size the process-wide pool. Returns false once the pool is in use.
    pub fn init_global(size: usize) -> bool {
        GLOBAL.set(BufferPool::new(size)).is_ok()
    }

    fn free(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.free.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Check out a zeroed buffer of the pool's size
    pub fn get(&self) -> Vec<u8> {
        let reused = self.free().pop();
        match reused {
            Some(buf) => buf,
            None => vec![0; self.size],
        }
    }

    /// Return a buffer. Buffers of the wrong size are dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        buf.fill(0);
        let mut free = self.free();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new(16);
        let mut buf = pool.get();
        buf[0] = 7;
        let ptr = buf.as_ptr();
        pool.put(buf);

        let again = pool.get();
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again[0], 0);
    }

    #[test]
    fn test_poisoned_free_list_is_still_used() {
        let pool = std::sync::Arc::new(BufferPool::new(16));
        let holder = std::sync::Arc::clone(&pool);
        let _ = std::thread::spawn(move || {
            let _free = holder.free.lock().unwrap();
            panic!("poisoning the free list");
        })
        .join();
        assert!(pool.free.is_poisoned());

        let buf = pool.get();
        let ptr = buf.as_ptr();
        pool.put(buf);
        assert_eq!(pool.get().as_ptr(), ptr);
    }

    #[test]
    fn test_wrong_size_is_dropped() {
        let pool = BufferPool::new(16);
        pool.put(vec![0; 8]);
        assert_eq!(pool.get().len(), 16);
    }
}

//! Reusable byte buffers for staging storage bodies and extracted tiles.
//!
//! Handlers take buffers through a lease that returns them to the manager
//! when dropped, so the get/put pairing holds on every exit path, including
//! early error returns.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Acquire and release byte accumulators.
///
/// Implementations are internally synchronized; `get`/`put` are safe under
/// contention.
pub trait BufferManager: Send + Sync {
    fn get(&self) -> Vec<u8>;
    fn put(&self, buf: Vec<u8>);
}

/// A buffer checked out of a manager, returned on drop.
pub struct BufferLease<'a> {
    manager: &'a dyn BufferManager,
    buf: Option<Vec<u8>>,
}

impl<'a> BufferLease<'a> {
    pub fn new(manager: &'a dyn BufferManager) -> Self {
        Self {
            manager,
            buf: Some(manager.get()),
        }
    }
}

impl Deref for BufferLease<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for BufferLease<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.manager.put(buf);
        }
    }
}

/// Allocates a fresh buffer on every `get`; `put` drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnDemandBufferManager;

impl BufferManager for OnDemandBufferManager {
    fn get(&self) -> Vec<u8> {
        Vec::new()
    }

    fn put(&self, _buf: Vec<u8>) {}
}

/// Bounded pool of `num_entries` buffers, each pre-sized to `entry_size`.
///
/// On exhaustion `get` falls back to a fresh allocation; `put` drops buffers
/// when the pool is full or when a buffer has grown far past the entry size.
pub struct PooledBufferManager {
    pool: Mutex<Vec<Vec<u8>>>,
    num_entries: usize,
    entry_size: usize,
}

impl PooledBufferManager {
    pub fn new(num_entries: usize, entry_size: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::with_capacity(num_entries)),
            num_entries,
            entry_size,
        }
    }

    /// Number of buffers currently sitting in the pool.
    pub fn pooled(&self) -> usize {
        self.pool.lock().expect("buffer pool lock poisoned").len()
    }
}

impl BufferManager for PooledBufferManager {
    fn get(&self) -> Vec<u8> {
        let mut pool = self.pool.lock().expect("buffer pool lock poisoned");
        pool.pop()
            .unwrap_or_else(|| Vec::with_capacity(self.entry_size))
    }

    fn put(&self, mut buf: Vec<u8>) {
        // buffers that ballooned past double the entry size are not worth
        // keeping around
        if buf.capacity() > self.entry_size.saturating_mul(2) {
            return;
        }
        let mut pool = self.pool.lock().expect("buffer pool lock poisoned");
        if pool.len() < self.num_entries {
            buf.clear();
            pool.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_on_demand() {
        let manager = OnDemandBufferManager;
        let buf = manager.get();
        assert!(buf.is_empty());
        manager.put(buf);
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let manager = PooledBufferManager::new(2, 1024);

        let mut buf = manager.get();
        assert_eq!(buf.capacity(), 1024);
        buf.extend_from_slice(b"some bytes");
        manager.put(buf);
        assert_eq!(manager.pooled(), 1);

        // the returned buffer comes back cleared with capacity intact
        let buf = manager.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
        assert_eq!(manager.pooled(), 0);
    }

    #[test]
    fn test_pool_bounded() {
        let manager = PooledBufferManager::new(1, 16);
        manager.put(Vec::with_capacity(16));
        manager.put(Vec::with_capacity(16));
        assert_eq!(manager.pooled(), 1);
    }

    #[test]
    fn test_pool_drops_oversized_buffers() {
        let manager = PooledBufferManager::new(4, 16);
        manager.put(Vec::with_capacity(1024));
        assert_eq!(manager.pooled(), 0);
    }

    #[test]
    fn test_pool_falls_back_on_exhaustion() {
        let manager = PooledBufferManager::new(1, 8);
        let a = manager.get();
        let b = manager.get();
        assert_eq!(a.capacity(), 8);
        assert_eq!(b.capacity(), 8);
    }

    /// Manager that counts gets and puts, for verifying lease discipline.
    #[derive(Default)]
    struct CountingManager {
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    impl BufferManager for CountingManager {
        fn get(&self) -> Vec<u8> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }

        fn put(&self, _buf: Vec<u8>) {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_lease_returns_buffer_on_drop() {
        let manager = CountingManager::default();
        {
            let mut lease = BufferLease::new(&manager);
            lease.extend_from_slice(b"data");
            assert_eq!(lease.len(), 4);
        }
        assert_eq!(manager.gets.load(Ordering::SeqCst), 1);
        assert_eq!(manager.puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lease_returns_buffer_on_early_exit() {
        let manager = CountingManager::default();

        fn failing_path(manager: &dyn BufferManager) -> Result<(), ()> {
            let _lease = BufferLease::new(manager);
            Err(())
        }

        assert!(failing_path(&manager).is_err());
        assert_eq!(manager.gets.load(Ordering::SeqCst), 1);
        assert_eq!(manager.puts.load(Ordering::SeqCst), 1);
    }
}

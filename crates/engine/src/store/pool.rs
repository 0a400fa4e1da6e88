//! Reference-counted pool of live chunk handles.
//!
//! Every handle the streamer hands out goes through [`ChunkPool::acquire`], so
//! two viewers of the same chunk share one allocation. Released entries stay
//! resident as idle until [`ChunkPool::cleanup_unused`] trims them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::world::ChunkHandle;
use crate::world::chunk::ChunkKey;

struct PoolEntry {
    handle: ChunkHandle,
    refs: usize,
    /// Logical time of the last release, used for oldest-first cleanup.
    idle_since: u64,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<ChunkKey, PoolEntry>,
    clock: u64,
    acquires: u64,
    reuses: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub acquires: u64,
    pub reuses: u64,
}

#[derive(Default)]
pub struct ChunkPool {
    inner: Mutex<PoolInner>,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resident handle for `key`, or one built by `loader`. The loader runs
    /// without the pool lock held; if another caller wins the race, its
    /// handle is returned and the freshly built one is dropped.
    pub fn acquire<E>(
        &self,
        key: ChunkKey,
        loader: impl FnOnce() -> Result<ChunkHandle, E>,
    ) -> Result<ChunkHandle, E> {
        {
            let mut inner = self.inner.lock().expect("chunk pool poisoned");
            inner.acquires += 1;
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.refs += 1;
                let handle = Arc::clone(&entry.handle);
                inner.reuses += 1;
                return Ok(handle);
            }
        }

        let built = loader()?;

        let mut inner = self.inner.lock().expect("chunk pool poisoned");
        let entry = inner.entries.entry(key).or_insert(PoolEntry {
            handle: built,
            refs: 0,
            idle_since: 0,
        });
        entry.refs += 1;
        Ok(Arc::clone(&entry.handle))
    }

    /// Drop one reference. Returns false if `key` is not pooled or already idle.
    pub fn release(&self, key: ChunkKey) -> bool {
        let mut inner = self.inner.lock().expect("chunk pool poisoned");
        inner.clock += 1;
        let now = inner.clock;
        match inner.entries.get_mut(&key) {
            Some(entry) if entry.refs > 0 => {
                entry.refs -= 1;
                if entry.refs == 0 {
                    entry.idle_since = now;
                }
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: ChunkKey) -> Option<ChunkHandle> {
        let inner = self.inner.lock().expect("chunk pool poisoned");
        inner.entries.get(&key).map(|e| Arc::clone(&e.handle))
    }

    pub fn ref_count(&self, key: ChunkKey) -> usize {
        let inner = self.inner.lock().expect("chunk pool poisoned");
        inner.entries.get(&key).map_or(0, |e| e.refs)
    }

    /// Reserve map capacity for `n` more entries.
    pub fn preallocate(&self, n: usize) {
        self.inner.lock().expect("chunk pool poisoned").entries.reserve(n);
    }

    /// Drop idle entries, oldest release first, until at most `keep_min` idle
    /// entries remain. Returns the number dropped.
    pub fn cleanup_unused(&self, keep_min: usize) -> usize {
        let mut inner = self.inner.lock().expect("chunk pool poisoned");
        let mut idle: Vec<(u64, ChunkKey)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.refs == 0)
            .map(|(k, e)| (e.idle_since, *k))
            .collect();
        if idle.len() <= keep_min {
            return 0;
        }
        idle.sort_unstable();
        let excess = idle.len() - keep_min;
        for (_, key) in idle.into_iter().take(excess) {
            inner.entries.remove(&key);
        }
        excess
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("chunk pool poisoned");
        let active = inner.entries.values().filter(|e| e.refs > 0).count();
        PoolStats {
            total: inner.entries.len(),
            active,
            idle: inner.entries.len() - active,
            acquires: inner.acquires,
            reuses: inner.reuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::chunk::{Lod, WorldChunk};
    use crate::world::new_handle;
    use crate::world::position::ChunkPos;
    use std::convert::Infallible;

    fn build(x: i32) -> Result<ChunkHandle, Infallible> {
        Ok(new_handle(WorldChunk::new(ChunkPos::new(x, 0), 2, Lod::High)))
    }

    #[test]
    fn second_acquire_reuses_the_handle() {
        let pool = ChunkPool::new();
        let key = ChunkKey::new(1, 0, Lod::High);
        let a = pool.acquire(key, || build(1)).unwrap();
        let b = pool.acquire(key, || -> Result<ChunkHandle, Infallible> { panic!("loader must not run") }).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let s = pool.stats();
        assert_eq!((s.total, s.active, s.acquires, s.reuses), (1, 1, 2, 1));
    }

    #[test]
    fn release_makes_entries_idle() {
        let pool = ChunkPool::new();
        let key = ChunkKey::new(1, 0, Lod::High);
        pool.acquire(key, || build(1)).unwrap();
        pool.acquire(key, || build(1)).unwrap();
        assert!(pool.release(key));
        assert_eq!(pool.stats().idle, 0);
        assert!(pool.release(key));
        assert_eq!(pool.stats().idle, 1);
        assert!(!pool.release(key));
    }

    #[test]
    fn cleanup_drops_oldest_idle_first() {
        let pool = ChunkPool::new();
        let keys: Vec<_> = (0..4).map(|x| ChunkKey::new(x, 0, Lod::High)).collect();
        for (i, &k) in keys.iter().enumerate() {
            pool.acquire(k, || build(i as i32)).unwrap();
        }
        pool.release(keys[2]);
        pool.release(keys[0]);
        pool.release(keys[1]);
        assert_eq!(pool.cleanup_unused(1), 2);
        assert!(pool.get(keys[1]).is_some());
        assert!(pool.get(keys[0]).is_none());
        assert!(pool.get(keys[2]).is_none());
        assert!(pool.get(keys[3]).is_some());
        assert_eq!(pool.cleanup_unused(1), 0);
    }

    #[test]
    fn loader_errors_leave_no_entry() {
        let pool = ChunkPool::new();
        let key = ChunkKey::new(0, 0, Lod::Low);
        let r: Result<ChunkHandle, &str> = pool.acquire(key, || Err("boom"));
        assert!(r.is_err());
        assert_eq!(pool.stats().total, 0);
    }
}

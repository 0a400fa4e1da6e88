//! Three-tier chunk store: memory, then disk, then generator.
//!
//! An optional [`ChunkBackend`] sits between disk and generator. It holds
//! chunks players have edited so they survive a wiped disk cache.
//!
//! Lock order: cache, then disk index, then save queue.

pub mod cache;
pub mod disk;
pub mod pool;
mod saver;

use std::convert::Infallible;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::world::chunk::{ChunkFormatError, ChunkKey, Lod, WorldChunk};
use crate::world::generator::WorldGenerator;
use crate::world::{ChunkHandle, new_handle};
use cache::{EvictionPolicy, MemoryCache};
use disk::DiskCache;
use pool::{ChunkPool, PoolStats};
use saver::{SaveJob, SaveQueue, SaveResult, SaveWorker};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("disk cache I/O: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt chunk file: {0}")]
    Corrupt(String),
    #[error("chunk codec: {0}")]
    Codec(#[from] ChunkFormatError),
    #[error("chunk backend: {0}")]
    Backend(String),
}

/// Durable home for player-edited chunks, typically the persistence layer.
pub trait ChunkBackend: Send + Sync {
    /// Canonical chunk JSON, if stored.
    fn load(&self, key: ChunkKey) -> Result<Option<Vec<u8>>, CacheError>;
    fn save(&self, key: ChunkKey, bytes: &[u8]) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_memory_chunks: usize,
    pub max_memory_bytes: usize,
    /// `None` disables the disk tier.
    pub disk_path: Option<PathBuf>,
    pub max_disk_chunks: usize,
    pub eviction_policy: EvictionPolicy,
    pub compression_level: u32,
    pub async_save: bool,
    pub save_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_memory_chunks: 1000,
            max_memory_bytes: 512 * 1024 * 1024,
            disk_path: None,
            max_disk_chunks: 10_000,
            eviction_policy: EvictionPolicy::Lru,
            compression_level: 6,
            async_save: true,
            save_batch_size: 10,
        }
    }
}

#[derive(Default)]
struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    disk_reads: AtomicU64,
    disk_read_errors: AtomicU64,
    disk_writes: AtomicU64,
    disk_write_errors: AtomicU64,
    generated: AtomicU64,
    lod_rebuilds: AtomicU64,
    backend_loads: AtomicU64,
    backend_saves: AtomicU64,
    backend_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub disk_reads: u64,
    pub disk_read_errors: u64,
    pub disk_writes: u64,
    pub disk_write_errors: u64,
    pub generated: u64,
    pub lod_rebuilds: u64,
    pub backend_loads: u64,
    pub backend_saves: u64,
    pub backend_errors: u64,
    pub memory_bytes: usize,
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub pending_saves: usize,
    pub pool: PoolStats,
}

/// State shared with the save worker thread.
pub(crate) struct StoreShared {
    cache: RwLock<MemoryCache>,
    disk: Option<DiskCache>,
    backend: RwLock<Option<Arc<dyn ChunkBackend>>>,
    queue: SaveQueue,
    counters: StoreCounters,
}

impl StoreShared {
    fn backend(&self) -> Option<Arc<dyn ChunkBackend>> {
        self.backend.read().expect("backend slot poisoned").clone()
    }

    /// Write one chunk to disk. A failed job comes back for rescheduling.
    pub(crate) fn save_job(&self, job: SaveJob) -> SaveResult {
        let Some(disk) = &self.disk else {
            return SaveResult::Skipped;
        };
        let (snapshot, generation) = match &job.orphan {
            Some(handle) => (handle.read().expect("chunk poisoned").clone(), None),
            None => {
                let cache = self.cache.read().expect("chunk cache poisoned");
                let Some(entry) = cache.peek(&job.key) else {
                    return SaveResult::Skipped;
                };
                if !entry.dirty {
                    return SaveResult::Skipped;
                }
                let snapshot = entry.chunk.read().expect("chunk poisoned").clone();
                (snapshot, Some(entry.dirty_gen))
            }
        };

        if job.orphan.is_some() && snapshot.is_modified() {
            self.save_to_backend(job.key, &snapshot);
        }

        match disk.write(&snapshot) {
            Ok(()) => {
                self.counters.disk_writes.fetch_add(1, Ordering::Relaxed);
                if let Some(generation) = generation {
                    self.cache
                        .write()
                        .expect("chunk cache poisoned")
                        .mark_saved(&job.key, generation);
                }
                SaveResult::Saved
            }
            Err(e) => {
                self.counters.disk_write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to save chunk {} to disk (try {}): {}", job.key, job.attempts + 1, e);
                let SaveJob { key, orphan, attempts } = job;
                let Some(handle) = orphan else {
                    return SaveResult::Failed(SaveJob { key, orphan: None, attempts });
                };
                // Still referenced elsewhere? Readers should see it again, so it
                // goes back into memory and retries from there.
                if Arc::strong_count(&handle) > 1 {
                    let mut cache = self.cache.write().expect("chunk cache poisoned");
                    if !cache.contains(&key) {
                        let outcome = cache.insert(key, handle, true, false);
                        for (evicted, entry) in outcome.evicted.into_iter().filter(|(_, e)| e.dirty) {
                            self.queue.push_orphan(evicted, entry.chunk);
                        }
                        return SaveResult::Failed(SaveJob { key, orphan: None, attempts });
                    }
                }
                SaveResult::Failed(SaveJob { key, orphan: Some(handle), attempts })
            }
        }
    }

    fn save_to_backend(&self, key: ChunkKey, chunk: &WorldChunk) -> bool {
        let Some(backend) = self.backend() else {
            return false;
        };
        let result = chunk
            .to_canonical_json()
            .map_err(CacheError::from)
            .and_then(|bytes| backend.save(key, &bytes));
        match result {
            Ok(()) => {
                self.counters.backend_saves.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to save chunk {} to backend: {}", key, e);
                false
            }
        }
    }
}

pub struct ChunkStore {
    config: StoreConfig,
    shared: Arc<StoreShared>,
    generator: Arc<WorldGenerator>,
    pool: ChunkPool,
    saver: Mutex<Option<SaveWorker>>,
    saver_active: AtomicBool,
}

impl ChunkStore {
    pub fn new(config: StoreConfig, generator: Arc<WorldGenerator>) -> Result<Self, CacheError> {
        let disk = match &config.disk_path {
            Some(path) => Some(DiskCache::open(path, config.compression_level, config.max_disk_chunks)?),
            None => None,
        };
        let shared = Arc::new(StoreShared {
            cache: RwLock::new(MemoryCache::new(
                config.eviction_policy,
                config.max_memory_chunks,
                config.max_memory_bytes,
            )),
            disk,
            backend: RwLock::new(None),
            queue: SaveQueue::default(),
            counters: StoreCounters::default(),
        });
        let saver: Option<SaveWorker> = if config.async_save && shared.disk.is_some() {
            Some(SaveWorker::spawn(Arc::clone(&shared), config.save_batch_size)?)
        } else {
            None
        };
        tracing::info!(
            "Chunk store ready: {} policy, {} chunks / {} bytes in memory, disk {}",
            config.eviction_policy,
            config.max_memory_chunks,
            config.max_memory_bytes,
            if shared.disk.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            config,
            shared,
            generator,
            pool: ChunkPool::new(),
            saver_active: AtomicBool::new(saver.is_some()),
            saver: Mutex::new(saver),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn generator(&self) -> &Arc<WorldGenerator> {
        &self.generator
    }

    pub fn set_backend(&self, backend: Arc<dyn ChunkBackend>) {
        *self.shared.backend.write().expect("backend slot poisoned") = Some(backend);
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Chunk for `key` from the first tier that has it. Never fails: any
    /// lower-tier error falls through to the generator.
    pub fn get(&self, key: ChunkKey) -> ChunkHandle {
        if let Some(handle) = self.shared.cache.write().expect("chunk cache poisoned").get(&key) {
            self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
            return handle;
        }
        self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
        let (chunk, dirty, persisted) = self.load_below_memory(key);
        self.insert_loaded(key, chunk, dirty, persisted)
    }

    /// Batch form of [`get`](Self::get). Misses are loaded in parallel.
    pub fn get_many(&self, keys: &[ChunkKey]) -> Vec<ChunkHandle> {
        let mut found: Vec<Option<ChunkHandle>> = {
            let mut cache = self.shared.cache.write().expect("chunk cache poisoned");
            keys.iter().map(|k| cache.get(k)).collect()
        };
        let hits = found.iter().filter(|h| h.is_some()).count() as u64;
        self.shared.counters.hits.fetch_add(hits, Ordering::Relaxed);
        self.shared
            .counters
            .misses
            .fetch_add(keys.len() as u64 - hits, Ordering::Relaxed);

        let missing: Vec<usize> = (0..keys.len()).filter(|&i| found[i].is_none()).collect();
        let loaded: Vec<(usize, (WorldChunk, bool, bool))> = missing
            .par_iter()
            .map(|&i| (i, self.load_below_memory(keys[i])))
            .collect();
        for (i, (chunk, dirty, persisted)) in loaded {
            found[i] = Some(self.insert_loaded(keys[i], chunk, dirty, persisted));
        }
        found.into_iter().flatten().collect()
    }

    /// Disk, then another resident LOD, then backend, then generator.
    /// Returns the chunk with its initial `dirty` and `persisted` flags.
    fn load_below_memory(&self, key: ChunkKey) -> (WorldChunk, bool, bool) {
        let counters = &self.shared.counters;
        if let Some(disk) = &self.shared.disk {
            match disk.read(&key) {
                Ok(Some(chunk)) => {
                    counters.disk_reads.fetch_add(1, Ordering::Relaxed);
                    return (chunk, false, true);
                }
                Ok(None) => {}
                Err(e) => {
                    counters.disk_read_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Disk cache read for {} failed, treating as miss: {}", key, e);
                }
            }
        }

        let sibling = {
            let cache = self.shared.cache.read().expect("chunk cache poisoned");
            Lod::ALL
                .iter()
                .filter(|&&lod| lod != key.lod)
                .find_map(|&lod| cache.peek(&ChunkKey::new(key.x, key.z, lod)).map(|e| Arc::clone(&e.chunk)))
        };
        if let Some(sibling) = sibling {
            counters.lod_rebuilds.fetch_add(1, Ordering::Relaxed);
            let chunk = sibling.read().expect("chunk poisoned").with_lod(key.lod);
            return (chunk, true, false);
        }

        if let Some(backend) = self.shared.backend() {
            let restored = backend.load(key).and_then(|bytes| match bytes {
                Some(bytes) => WorldChunk::from_canonical_json(&bytes, key.lod)
                    .map(Some)
                    .map_err(CacheError::from),
                None => Ok(None),
            });
            match restored {
                Ok(Some(chunk)) => {
                    counters.backend_loads.fetch_add(1, Ordering::Relaxed);
                    return (chunk, true, false);
                }
                Ok(None) => {}
                Err(e) => {
                    counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Chunk backend load for {} failed: {}", key, e);
                }
            }
        }

        counters.generated.fetch_add(1, Ordering::Relaxed);
        (self.generator.generate(key.pos(), key.lod), true, false)
    }

    fn insert_loaded(&self, key: ChunkKey, chunk: WorldChunk, dirty: bool, persisted: bool) -> ChunkHandle {
        let handle = new_handle(chunk);
        let evicted = {
            let mut cache = self.shared.cache.write().expect("chunk cache poisoned");
            // Another thread may have loaded it meanwhile; keep a single handle.
            if let Some(existing) = cache.get(&key) {
                return existing;
            }
            let outcome = cache.insert(key, Arc::clone(&handle), dirty, persisted);
            self.schedule_evicted(outcome.evicted)
        };
        self.save_inline(evicted);
        if dirty && self.saver_running() {
            self.shared.queue.push(key);
        }
        handle
    }

    /// Evicted dirty entries go to the save queue while the cache lock is
    /// still held. Without a worker they are returned for an inline save.
    fn schedule_evicted(&self, evicted: Vec<(ChunkKey, cache::ChunkEntry)>) -> Vec<SaveJob> {
        self.shared
            .counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        let mut inline = Vec::new();
        for (key, entry) in evicted {
            if !entry.dirty || self.shared.disk.is_none() {
                continue;
            }
            if self.saver_running() {
                self.shared.queue.push_orphan(key, entry.chunk);
            } else {
                inline.push(SaveJob::new(key, Some(entry.chunk)));
            }
        }
        inline
    }

    /// Failures wait in the retry queue; without a worker they run on the
    /// next flush.
    fn save_inline(&self, jobs: Vec<SaveJob>) {
        for job in jobs {
            if let SaveResult::Failed(job) = self.shared.save_job(job) {
                self.shared.queue.retry(job);
            }
        }
    }

    fn saver_running(&self) -> bool {
        self.saver_active.load(Ordering::Acquire)
    }

    fn stop_saver(&self) {
        self.saver_active.store(false, Ordering::Release);
        let worker = self.saver.lock().expect("saver slot poisoned").take();
        if let Some(mut worker) = worker {
            worker.shutdown();
        }
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Insert a chunk built elsewhere.
    pub fn put(&self, chunk: WorldChunk, dirty: bool) -> ChunkHandle {
        let key = chunk.key();
        let handle = new_handle(chunk);
        let evicted = {
            let mut cache = self.shared.cache.write().expect("chunk cache poisoned");
            let outcome = cache.insert(key, Arc::clone(&handle), dirty, false);
            self.schedule_evicted(outcome.evicted)
        };
        self.save_inline(evicted);
        if dirty && self.saver_running() {
            self.shared.queue.push(key);
        }
        handle
    }

    pub fn put_many(&self, chunks: Vec<WorldChunk>, dirty: bool) -> Vec<ChunkHandle> {
        chunks.into_iter().map(|c| self.put(c, dirty)).collect()
    }

    /// Flag a resident chunk for saving after an in-place edit. A chunk that
    /// fell out of memory but is still pooled is re-admitted.
    pub fn mark_dirty(&self, key: ChunkKey) -> bool {
        let marked = {
            let mut cache = self.shared.cache.write().expect("chunk cache poisoned");
            let marked = cache.mark_dirty(&key).is_some();
            if marked {
                cache.refresh_size(&key);
            }
            marked
        };
        if !marked {
            let Some(handle) = self.pool.get(key) else {
                return false;
            };
            let evicted = {
                let mut cache = self.shared.cache.write().expect("chunk cache poisoned");
                let outcome = cache.insert(key, handle, true, false);
                self.schedule_evicted(outcome.evicted)
            };
            self.save_inline(evicted);
        }
        if self.saver_running() {
            self.shared.queue.push(key);
        }
        true
    }

    /// Drop `key` from memory and disk. Pooled handles stay valid.
    pub fn invalidate(&self, key: ChunkKey) -> bool {
        let in_memory = self.shared.cache.write().expect("chunk cache poisoned").remove(&key).is_some();
        let on_disk = self.shared.disk.as_ref().is_some_and(|d| d.remove(&key));
        in_memory || on_disk
    }

    // ── Pool ────────────────────────────────────────────────────────────

    /// Reference-counted handle for a streamed-in chunk.
    pub fn acquire(&self, key: ChunkKey) -> ChunkHandle {
        self.pool
            .acquire(key, || Ok::<_, Infallible>(self.get(key)))
            .unwrap_or_else(|never| match never {})
    }

    pub fn release(&self, key: ChunkKey) -> bool {
        self.pool.release(key)
    }

    pub fn preallocate(&self, n: usize) {
        self.pool.preallocate(n);
    }

    pub fn cleanup_pool(&self, keep_min: usize) -> usize {
        self.pool.cleanup_unused(keep_min)
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Write every dirty chunk to disk, push edited chunks to the backend and
    /// rewrite the disk index. Blocks until done.
    pub fn flush(&self) -> Result<usize, CacheError> {
        let started = Instant::now();
        let (dirty, modified): (Vec<ChunkKey>, Vec<(ChunkKey, ChunkHandle)>) = {
            let cache = self.shared.cache.read().expect("chunk cache poisoned");
            let modified = cache
                .entries()
                .filter(|(_, e)| e.chunk.read().expect("chunk poisoned").is_modified())
                .map(|(k, e)| (*k, Arc::clone(&e.chunk)))
                .collect();
            (cache.dirty_keys(), modified)
        };

        let mut backend_saved = 0;
        for (key, handle) in modified {
            let snapshot = handle.read().expect("chunk poisoned").clone();
            if self.shared.save_to_backend(key, &snapshot) {
                handle.write().expect("chunk poisoned").clear_modified();
                backend_saved += 1;
            }
        }

        let mut saved = 0;
        if self.shared.disk.is_some() {
            for key in dirty {
                self.shared.queue.push(key);
            }
            saved = self.shared.queue.drain(&self.shared);
            if let Some(disk) = &self.shared.disk {
                disk.flush_index()?;
            }
        }
        tracing::info!(
            "Chunk store flushed: {} to disk, {} to backend in {:?}",
            saved,
            backend_saved,
            started.elapsed()
        );
        Ok(saved)
    }

    /// Flush and stop the save worker.
    pub fn shutdown(&self) -> Result<(), CacheError> {
        self.flush()?;
        self.stop_saver();
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn in_memory(&self, key: &ChunkKey) -> bool {
        self.shared.cache.read().expect("chunk cache poisoned").contains(key)
    }

    pub fn on_disk(&self, key: &ChunkKey) -> bool {
        self.shared.disk.as_ref().is_some_and(|d| d.contains(key))
    }

    pub fn is_dirty(&self, key: &ChunkKey) -> bool {
        let cache = self.shared.cache.read().expect("chunk cache poisoned");
        cache.peek(key).is_some_and(|e| e.dirty)
    }

    /// Keys from most to least recently used.
    pub fn access_order(&self) -> Vec<ChunkKey> {
        self.shared.cache.read().expect("chunk cache poisoned").access_order()
    }

    /// `(key, size_bytes, estimated_size)` for every resident entry.
    pub fn size_report(&self) -> Vec<(ChunkKey, usize, usize)> {
        let cache = self.shared.cache.read().expect("chunk cache poisoned");
        cache
            .entries()
            .map(|(k, e)| (*k, e.size_bytes, e.chunk.read().expect("chunk poisoned").estimated_size()))
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let c = &self.shared.counters;
        let (memory_bytes, memory_entries) = {
            let cache = self.shared.cache.read().expect("chunk cache poisoned");
            (cache.bytes(), cache.len())
        };
        StoreStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            disk_reads: c.disk_reads.load(Ordering::Relaxed),
            disk_read_errors: c.disk_read_errors.load(Ordering::Relaxed),
            disk_writes: c.disk_writes.load(Ordering::Relaxed),
            disk_write_errors: c.disk_write_errors.load(Ordering::Relaxed),
            generated: c.generated.load(Ordering::Relaxed),
            lod_rebuilds: c.lod_rebuilds.load(Ordering::Relaxed),
            backend_loads: c.backend_loads.load(Ordering::Relaxed),
            backend_saves: c.backend_saves.load(Ordering::Relaxed),
            backend_errors: c.backend_errors.load(Ordering::Relaxed),
            memory_bytes,
            memory_entries,
            disk_entries: self.shared.disk.as_ref().map_or(0, |d| d.len()),
            pending_saves: self.shared.queue.len(),
            pool: self.pool.stats(),
        }
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        self.stop_saver();
        if let Some(disk) = &self.shared.disk {
            if let Err(e) = disk.flush_index() {
                tracing::warn!("Failed to rewrite disk index on shutdown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::generator::GeneratorConfig;

    fn store(config: StoreConfig) -> ChunkStore {
        ChunkStore::new(config, Arc::new(WorldGenerator::new(GeneratorConfig::default()))).unwrap()
    }

    #[test]
    fn memory_hit_after_first_get() {
        let s = store(StoreConfig::default());
        let key = ChunkKey::new(0, 0, Lod::High);
        let a = s.get(key);
        let b = s.get(key);
        assert!(Arc::ptr_eq(&a, &b));
        let st = s.stats();
        assert_eq!((st.hits, st.misses, st.generated), (1, 1, 1));
    }

    #[test]
    fn other_lod_is_rebuilt_from_resident_blocks() {
        let s = store(StoreConfig::default());
        let high = s.get(ChunkKey::new(2, 2, Lod::High));
        high.write()
            .unwrap()
            .set_block(crate::world::position::LocalBlockPos::new(0, 63, 0), crate::world::block::BlockType::Wood);
        let low = s.get(ChunkKey::new(2, 2, Lod::Low));
        assert_eq!(low.read().unwrap().surface_height(0, 0), 64.0);
        assert_eq!(s.stats().lod_rebuilds, 1);
    }

    #[test]
    fn size_accounting_matches_estimates() {
        let s = store(StoreConfig { max_memory_chunks: 3, ..StoreConfig::default() });
        let keys: Vec<_> = (0..5).map(|x| ChunkKey::new(x, 0, Lod::Medium)).collect();
        s.get_many(&keys);
        let report = s.size_report();
        assert_eq!(report.len(), 3);
        for (_, recorded, estimated) in report {
            assert_eq!(recorded, estimated);
        }
        assert_eq!(s.stats().evictions, 2);
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("worldcore_store_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn blank(x: i32) -> WorldChunk {
        WorldChunk::new(crate::world::position::ChunkPos::new(x, 0), 16, Lod::High)
    }

    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn failed_background_save_is_retried_once_disk_recovers() {
        let dir = temp_dir("retry");
        let s = store(StoreConfig { disk_path: Some(dir.clone()), ..StoreConfig::default() });
        std::fs::remove_dir_all(&dir).unwrap();

        let key = blank(4).key();
        let _handle = s.put(blank(4), true);
        wait_for("first failed write", || s.stats().disk_write_errors >= 1);
        assert!(s.is_dirty(&key));

        std::fs::create_dir_all(&dir).unwrap();
        wait_for("retried write", || !s.is_dirty(&key));
        assert!(s.on_disk(&key));
        assert_eq!(s.stats().pending_saves, 0);

        drop(s);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn evicted_chunk_whose_save_failed_is_written_on_flush() {
        let dir = temp_dir("orphan");
        let s = store(StoreConfig {
            disk_path: Some(dir.clone()),
            async_save: false,
            max_memory_chunks: 1,
            ..StoreConfig::default()
        });
        std::fs::remove_dir_all(&dir).unwrap();

        let first = blank(1).key();
        let second = blank(2).key();
        s.put(blank(1), true);
        s.put(blank(2), true);
        assert!(!s.in_memory(&first));
        assert_eq!(s.stats().disk_write_errors, 1);
        assert_eq!(s.stats().pending_saves, 1);

        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(s.flush().unwrap(), 2);
        assert!(s.on_disk(&first));
        assert!(s.on_disk(&second));
        assert_eq!(s.stats().pending_saves, 0);

        drop(s);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn get_many_preserves_order() {
        let s = store(StoreConfig::default());
        let keys = [ChunkKey::new(5, 1, Lod::Low), ChunkKey::new(-3, 2, Lod::Low)];
        let handles = s.get_many(&keys);
        assert_eq!(handles[0].read().unwrap().pos(), keys[0].pos());
        assert_eq!(handles[1].read().unwrap().pos(), keys[1].pos());
    }
}

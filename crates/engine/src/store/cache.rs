//! Bounded in-memory chunk cache with selectable eviction.
//!
//! Not synchronized: [`ChunkStore`](super::ChunkStore) wraps it in a `RwLock`.
//! Time is a logical clock bumped on every access so that LRU order and
//! `last_access` ranks always agree.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::world::ChunkHandle;
use crate::world::chunk::ChunkKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionPolicy {
    #[default]
    #[serde(rename = "LRU")]
    Lru,
    #[serde(rename = "LFU")]
    Lfu,
    #[serde(rename = "FIFO")]
    Fifo,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(EvictionPolicy::Lru),
            "LFU" => Ok(EvictionPolicy::Lfu),
            "FIFO" => Ok(EvictionPolicy::Fifo),
            other => Err(format!("unknown eviction policy '{}'", other)),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EvictionPolicy::Lru => "LRU",
            EvictionPolicy::Lfu => "LFU",
            EvictionPolicy::Fifo => "FIFO",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub chunk: ChunkHandle,
    pub size_bytes: usize,
    pub access_count: u64,
    pub last_access: u64,
    pub created_at: u64,
    pub dirty: bool,
    pub persisted: bool,
    /// Bumped on every `mark_dirty`; a save only clears `dirty` if the
    /// generation it captured is still current.
    pub dirty_gen: u64,
}

/// Result of an insert: what was evicted to make room, and whether the new
/// chunk was kept at all (a chunk larger than the byte budget is not).
#[derive(Debug, Default)]
pub struct InsertOutcome {
    pub evicted: Vec<(ChunkKey, ChunkEntry)>,
    pub cached: bool,
}

pub struct MemoryCache {
    policy: EvictionPolicy,
    max_entries: usize,
    max_bytes: usize,
    entries: HashMap<ChunkKey, ChunkEntry>,
    /// last_access -> key. Iterating in reverse yields most-recent first.
    access_order: BTreeMap<u64, ChunkKey>,
    clock: u64,
    bytes: usize,
}

impl MemoryCache {
    pub fn new(policy: EvictionPolicy, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            policy,
            max_entries: max_entries.max(1),
            max_bytes,
            entries: HashMap::new(),
            access_order: BTreeMap::new(),
            clock: 0,
            bytes: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Hit path: bumps access count and LRU position.
    pub fn get(&mut self, key: &ChunkKey) -> Option<ChunkHandle> {
        let now = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.access_order.remove(&entry.last_access);
        entry.last_access = now;
        entry.access_count += 1;
        self.access_order.insert(now, *key);
        Some(Arc::clone(&entry.chunk))
    }

    /// Read without touching access statistics.
    pub fn peek(&self, key: &ChunkKey) -> Option<&ChunkEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace `key`, evicting per policy first.
    pub fn insert(&mut self, key: ChunkKey, chunk: ChunkHandle, dirty: bool, persisted: bool) -> InsertOutcome {
        let size = chunk.read().expect("chunk poisoned").estimated_size();
        let mut outcome = InsertOutcome::default();

        if let Some(old) = self.remove(&key) {
            // Unsaved edits carried by the replaced entry still need a save.
            if old.dirty && !Arc::ptr_eq(&old.chunk, &chunk) {
                outcome.evicted.push((key, old));
            }
        }
        if size > self.max_bytes {
            return outcome;
        }
        while !self.entries.is_empty()
            && (self.entries.len() + 1 > self.max_entries || self.bytes + size > self.max_bytes)
        {
            let Some(victim) = self.select_victim() else { break };
            if let Some(entry) = self.remove(&victim) {
                outcome.evicted.push((victim, entry));
            }
        }

        let now = self.tick();
        self.entries.insert(
            key,
            ChunkEntry {
                chunk,
                size_bytes: size,
                access_count: 1,
                last_access: now,
                created_at: now,
                dirty,
                persisted,
                dirty_gen: 0,
            },
        );
        self.access_order.insert(now, key);
        self.bytes += size;
        outcome.cached = true;
        outcome
    }

    pub fn remove(&mut self, key: &ChunkKey) -> Option<ChunkEntry> {
        let entry = self.entries.remove(key)?;
        self.access_order.remove(&entry.last_access);
        self.bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Next key the policy would evict.
    pub fn select_victim(&self) -> Option<ChunkKey> {
        match self.policy {
            EvictionPolicy::Lru => self.access_order.values().next().copied(),
            EvictionPolicy::Lfu => self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.access_count, e.created_at))
                .map(|(k, _)| *k),
            EvictionPolicy::Fifo => self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| *k),
        }
    }

    /// Flag `key` as needing a disk save. Returns the new dirty generation.
    pub fn mark_dirty(&mut self, key: &ChunkKey) -> Option<u64> {
        let entry = self.entries.get_mut(key)?;
        entry.dirty = true;
        entry.dirty_gen += 1;
        Some(entry.dirty_gen)
    }

    /// Record a successful save taken at `generation`.
    pub fn mark_saved(&mut self, key: &ChunkKey, generation: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.dirty_gen == generation => {
                entry.dirty = false;
                entry.persisted = true;
                true
            }
            _ => false,
        }
    }

    /// Re-measure an entry after its chunk was edited in place.
    pub fn refresh_size(&mut self, key: &ChunkKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            let size = entry.chunk.read().expect("chunk poisoned").estimated_size();
            self.bytes = self.bytes - entry.size_bytes + size;
            entry.size_bytes = size;
        }
    }

    /// Keys from most to least recently used.
    pub fn access_order(&self) -> Vec<ChunkKey> {
        self.access_order.values().rev().copied().collect()
    }

    pub fn keys(&self) -> Vec<ChunkKey> {
        self.entries.keys().copied().collect()
    }

    pub fn dirty_keys(&self) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> =
            self.entries.iter().filter(|(_, e)| e.dirty).map(|(k, _)| *k).collect();
        keys.sort_unstable();
        keys
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ChunkKey, &ChunkEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::chunk::{Lod, WorldChunk};
    use crate::world::new_handle;
    use crate::world::position::ChunkPos;

    fn handle(x: i32) -> ChunkHandle {
        new_handle(WorldChunk::new(ChunkPos::new(x, 0), 1, Lod::High))
    }

    fn key(x: i32) -> ChunkKey {
        ChunkKey::new(x, 0, Lod::High)
    }

    fn unit_size() -> usize {
        handle(0).read().unwrap().estimated_size()
    }

    #[test]
    fn lru_evicts_least_recent() {
        let mut c = MemoryCache::new(EvictionPolicy::Lru, 3, usize::MAX);
        for x in 0..3 {
            c.insert(key(x), handle(x), false, false);
        }
        c.get(&key(0));
        let out = c.insert(key(3), handle(3), false, false);
        assert_eq!(out.evicted.len(), 1);
        assert_eq!(out.evicted[0].0, key(1));
        assert_eq!(c.access_order(), vec![key(3), key(0), key(2)]);
    }

    #[test]
    fn lfu_evicts_least_used_then_oldest() {
        let mut c = MemoryCache::new(EvictionPolicy::Lfu, 3, usize::MAX);
        for x in 0..3 {
            c.insert(key(x), handle(x), false, false);
        }
        c.get(&key(0));
        c.get(&key(2));
        let out = c.insert(key(3), handle(3), false, false);
        assert_eq!(out.evicted[0].0, key(1));
        let out = c.insert(key(4), handle(4), false, false);
        assert_eq!(out.evicted[0].0, key(3));
    }

    #[test]
    fn fifo_ignores_access() {
        let mut c = MemoryCache::new(EvictionPolicy::Fifo, 2, usize::MAX);
        c.insert(key(0), handle(0), false, false);
        c.insert(key(1), handle(1), false, false);
        c.get(&key(0));
        let out = c.insert(key(2), handle(2), false, false);
        assert_eq!(out.evicted[0].0, key(0));
    }

    #[test]
    fn byte_budget_holds_after_every_insert() {
        let unit = unit_size();
        let mut c = MemoryCache::new(EvictionPolicy::Lru, 100, unit * 2 + unit / 2);
        for x in 0..6 {
            c.insert(key(x), handle(x), false, false);
            assert!(c.bytes() <= c.max_bytes());
            let sum: usize = c.entries().map(|(_, e)| e.size_bytes).sum();
            assert_eq!(sum, c.bytes());
        }
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn oversized_chunks_are_not_cached() {
        let mut c = MemoryCache::new(EvictionPolicy::Lru, 10, 10);
        let out = c.insert(key(0), handle(0), true, false);
        assert!(!out.cached);
        assert!(c.is_empty());
    }

    #[test]
    fn access_order_matches_last_access_rank() {
        let mut c = MemoryCache::new(EvictionPolicy::Lru, 10, usize::MAX);
        for x in 0..5 {
            c.insert(key(x), handle(x), false, false);
        }
        for x in [3, 1, 4, 1] {
            c.get(&key(x));
        }
        let mut by_time: Vec<(u64, ChunkKey)> = c.entries().map(|(k, e)| (e.last_access, *k)).collect();
        by_time.sort_by(|a, b| b.0.cmp(&a.0));
        let ranked: Vec<ChunkKey> = by_time.into_iter().map(|(_, k)| k).collect();
        assert_eq!(c.access_order(), ranked);
        assert_eq!(c.peek(&key(1)).unwrap().access_count, 3);
    }

    #[test]
    fn stale_save_generation_keeps_dirty() {
        let mut c = MemoryCache::new(EvictionPolicy::Lru, 10, usize::MAX);
        c.insert(key(0), handle(0), true, false);
        let g1 = c.mark_dirty(&key(0)).unwrap();
        let g2 = c.mark_dirty(&key(0)).unwrap();
        assert!(!c.mark_saved(&key(0), g1));
        assert!(c.peek(&key(0)).unwrap().dirty);
        assert!(c.mark_saved(&key(0), g2));
        let e = c.peek(&key(0)).unwrap();
        assert!(!e.dirty && e.persisted);
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("lfu".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lfu);
        assert!("MRU".parse::<EvictionPolicy>().is_err());
        assert_eq!(EvictionPolicy::Fifo.to_string(), "FIFO");
    }
}

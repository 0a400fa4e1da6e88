pub mod block;
pub mod chunk;
pub mod generator;
pub mod lod;
pub mod mesh;
pub mod position;

use std::sync::{Arc, RwLock};

use block::BlockType;
use chunk::WorldChunk;
use dashmap::{DashMap, DashSet};
use position::{ChunkPos, LocalBlockPos, Vec3};

/// Shared, reference-counted chunk. Readers take the read lock; only the game
/// loop and the store write through it.
pub type ChunkHandle = Arc<RwLock<WorldChunk>>;

pub fn new_handle(chunk: WorldChunk) -> ChunkHandle {
    Arc::new(RwLock::new(chunk))
}

/// The set of chunks currently streamed in. Thread-safe, lock-sharded by column.
///
/// One handle per column: loading another LOD for a column replaces the old
/// handle.
pub struct World {
    chunks: DashMap<ChunkPos, ChunkHandle>,
    /// Columns edited since the last call to `take_modified`.
    modified: DashSet<ChunkPos>,
}

impl World {
    pub fn new() -> Self {
        Self {
            chunks: DashMap::new(),
            modified: DashSet::new(),
        }
    }

    /// Insert or replace the loaded chunk for a column. Returns the previous handle.
    pub fn insert_chunk(&self, handle: ChunkHandle) -> Option<ChunkHandle> {
        let pos = handle.read().expect("chunk poisoned").pos();
        self.chunks.insert(pos, handle)
    }

    pub fn remove_chunk(&self, pos: ChunkPos) -> Option<ChunkHandle> {
        self.chunks.remove(&pos).map(|(_, h)| h)
    }

    pub fn get_chunk(&self, pos: ChunkPos) -> Option<ChunkHandle> {
        self.chunks.get(&pos).map(|h| Arc::clone(h.value()))
    }

    pub fn has_chunk(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn positions(&self) -> Vec<ChunkPos> {
        self.chunks.iter().map(|e| *e.key()).collect()
    }

    /// Terrain surface at a world XZ position, if its chunk is loaded.
    pub fn surface_height(&self, world_x: f32, world_z: f32) -> Option<f32> {
        let pos = Vec3::new(world_x, 0.0, world_z).chunk();
        let handle = self.chunks.get(&pos)?;
        let chunk = handle.read().expect("chunk poisoned");
        Some(chunk.height_at(world_x, world_z))
    }

    /// Block at absolute block coordinates. AIR for unloaded chunks.
    pub fn get_block(&self, x: i64, y: i64, z: i64) -> BlockType {
        let Some((pos, local)) = LocalBlockPos::from_world(x, y, z) else {
            return BlockType::Air;
        };
        match self.chunks.get(&pos) {
            Some(h) => h.read().expect("chunk poisoned").get_block(local),
            None => BlockType::Air,
        }
    }

    /// Edit a block in a loaded chunk, rebuild its geometry and mark it modified.
    /// Returns the handle of the edited chunk, or `None` if the column is not
    /// loaded or the position is out of range.
    pub fn set_block(&self, x: i64, y: i64, z: i64, block: BlockType) -> Option<ChunkHandle> {
        let (pos, local) = LocalBlockPos::from_world(x, y, z)?;
        let handle = self.get_chunk(pos)?;
        {
            let mut chunk = handle.write().expect("chunk poisoned");
            if !chunk.set_block(local, block) {
                return None;
            }
            chunk.rebuild();
        }
        self.modified.insert(pos);
        Some(handle)
    }

    /// Drain and return all columns modified since the last call.
    pub fn take_modified(&self) -> Vec<ChunkPos> {
        let mut out = Vec::new();
        // A column dirtied between collect and remove is simply saved again next time.
        for entry in self.modified.iter() {
            out.push(*entry);
        }
        for pos in &out {
            self.modified.remove(pos);
        }
        out
    }

    pub fn modified_count(&self) -> usize {
        self.modified.len()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

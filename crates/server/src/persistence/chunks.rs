//! Plugs a [`Persistence`] adapter into the chunk store as its backend tier.

use std::sync::Arc;

use worldcore_engine::store::{CacheError, ChunkBackend};
use worldcore_engine::world::chunk::ChunkKey;

use super::Persistence;

pub struct PersistenceChunks {
    inner: Arc<dyn Persistence>,
}

impl PersistenceChunks {
    pub fn new(inner: Arc<dyn Persistence>) -> Self {
        Self { inner }
    }
}

impl ChunkBackend for PersistenceChunks {
    fn load(&self, key: ChunkKey) -> Result<Option<Vec<u8>>, CacheError> {
        self.inner
            .load_chunk(key.x, key.z, key.lod.ordinal())
            .map_err(|e| CacheError::Backend(format!("{:#}", e)))
    }

    fn save(&self, key: ChunkKey, bytes: &[u8]) -> Result<(), CacheError> {
        self.inner
            .save_chunk(key.x, key.z, key.lod.ordinal(), bytes)
            .map_err(|e| CacheError::Backend(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use worldcore_engine::store::{ChunkStore, StoreConfig};
    use worldcore_engine::world::block::BlockType;
    use worldcore_engine::world::chunk::Lod;
    use worldcore_engine::world::generator::{GeneratorConfig, WorldGenerator};
    use worldcore_engine::world::position::{LocalBlockPos, Vec3};

    #[test]
    fn edited_chunks_flush_to_persistence_and_reload() {
        let db = Arc::new(MemoryStore::new(true, Vec3::ZERO));
        let generator = Arc::new(WorldGenerator::new(GeneratorConfig::default()));
        let key = ChunkKey::new(3, -2, Lod::High);

        let store = ChunkStore::new(StoreConfig::default(), Arc::clone(&generator)).unwrap();
        store.set_backend(Arc::new(PersistenceChunks::new(db.clone())));
        let handle = store.get(key);
        handle.write().unwrap().set_block(LocalBlockPos::new(1, 0, 1), BlockType::Wood);
        store.mark_dirty(key);
        store.flush().unwrap();
        assert!(db.load_chunk(3, -2, 0).unwrap().is_some());

        let fresh = ChunkStore::new(StoreConfig::default(), generator).unwrap();
        fresh.set_backend(Arc::new(PersistenceChunks::new(db)));
        let chunk = fresh.get(key);
        assert_eq!(chunk.read().unwrap().get_block(LocalBlockPos::new(1, 0, 1)), BlockType::Wood);
        assert_eq!(fresh.stats().backend_loads, 1);
    }
}

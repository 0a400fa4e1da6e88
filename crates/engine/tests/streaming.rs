//! End-to-end tests: streamer loads through the chunk store into the world
//! and collision system, edits are written back to disk on unload.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use worldcore_engine::collision::CollisionSystem;
use worldcore_engine::store::{ChunkStore, StoreConfig};
use worldcore_engine::streamer::{StreamerConfig, WorldStreamer};
use worldcore_engine::world::World;
use worldcore_engine::world::block::BlockType;
use worldcore_engine::world::chunk::{ChunkKey, Lod};
use worldcore_engine::world::generator::{GeneratorConfig, WorldGenerator};
use worldcore_engine::world::position::{ChunkPos, LocalBlockPos, Vec3};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("worldcore_stream_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn generator() -> Arc<WorldGenerator> {
    Arc::new(WorldGenerator::new(GeneratorConfig {
        max_terrain_height: 32,
        ..GeneratorConfig::default()
    }))
}

struct Rig {
    store: Arc<ChunkStore>,
    world: Arc<World>,
    collision: Arc<CollisionSystem>,
    streamer: Arc<WorldStreamer>,
}

fn rig(store_config: StoreConfig, streamer_config: StreamerConfig) -> Rig {
    let store = Arc::new(ChunkStore::new(store_config, generator()).unwrap());
    let world = Arc::new(World::new());
    let collision = Arc::new(CollisionSystem::new());
    let streamer = Arc::new(WorldStreamer::new(
        streamer_config,
        Arc::clone(&store),
        Arc::clone(&world),
        Arc::clone(&collision),
    ));
    streamer.start();
    Rig { store, world, collision, streamer }
}

async fn eventually(mut pred: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pred()
}

#[tokio::test]
async fn loaded_chunks_appear_in_world_and_collision() {
    let r = rig(StoreConfig::default(), StreamerConfig::default());
    let handle = r.streamer.request_chunk(2, -1, Lod::High).await.unwrap();

    let pos = ChunkPos::new(2, -1);
    assert!(r.world.has_chunk(pos));
    assert!(r.collision.has_chunk(pos));
    assert!(Arc::ptr_eq(&handle, &r.world.get_chunk(pos).unwrap()));
    assert!(r.store.in_memory(&ChunkKey::new(2, -1, Lod::High)));

    r.streamer.stop().await;
}

#[tokio::test]
async fn lod_follows_distance_from_viewer() {
    let r = rig(
        StoreConfig::default(),
        StreamerConfig { load_radius: 4, ..StreamerConfig::default() },
    );
    r.streamer.update_view_position(7, Vec3::new(8.0, 20.0, 8.0));
    assert!(eventually(|| r.streamer.stats().loaded == 81).await);

    let lod_of = |x, z| r.streamer.loaded_handle(x, z).map(|(k, _)| k.lod);
    assert_eq!(lod_of(0, 0), Some(Lod::High));
    assert_eq!(lod_of(4, 0), Some(Lod::Medium));
    assert_eq!(r.world.chunk_count(), 81);

    r.streamer.stop().await;
}

#[tokio::test]
async fn edits_survive_unload_and_store_restart() {
    let dir = temp_dir("edits");
    let store_config = StoreConfig {
        disk_path: Some(dir.clone()),
        async_save: false,
        ..StoreConfig::default()
    };
    let r = rig(store_config.clone(), StreamerConfig::default());
    r.streamer.request_chunk(0, 0, Lod::High).await.unwrap();

    let edited = r.world.set_block(3, 0, 3, BlockType::Wood).unwrap();
    r.collision.register_chunk(&edited.read().unwrap());
    assert!(r.collision.check_collision(Vec3::new(3.5, 0.5, 3.5), 0.0, None).collided);

    assert!(r.streamer.unload_chunk(0, 0));
    assert!(eventually(|| !r.streamer.is_loaded(0, 0)).await);
    assert!(!r.world.has_chunk(ChunkPos::new(0, 0)));
    assert!(!r.collision.has_chunk(ChunkPos::new(0, 0)));
    assert!(r.store.is_dirty(&ChunkKey::new(0, 0, Lod::High)));

    r.store.flush().unwrap();
    r.streamer.stop().await;
    drop(r);

    let reopened = ChunkStore::new(store_config, generator()).unwrap();
    let chunk = reopened.get(ChunkKey::new(0, 0, Lod::High));
    assert_eq!(chunk.read().unwrap().get_block(LocalBlockPos::new(3, 0, 3)), BlockType::Wood);
    assert_eq!(reopened.stats().disk_reads, 1);

    drop(reopened);
    let _ = std::fs::remove_dir_all(&dir);
}

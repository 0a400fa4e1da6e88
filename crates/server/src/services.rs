//! Everything the server shares, built once at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use worldcore_engine::collision::CollisionSystem;
use worldcore_engine::store::ChunkStore;
use worldcore_engine::streamer::WorldStreamer;
use worldcore_engine::world::World;
use worldcore_engine::world::generator::WorldGenerator;

use crate::config::{PersistenceBackend, ServerConfig};
use crate::dashboard::Metrics;
use crate::error::Fatal;
use crate::event_bus::EventBus;
use crate::game::Intent;
use crate::net::sessions::{SessionLimits, SessionManager};
use crate::persistence::chunks::PersistenceChunks;
use crate::persistence::{FileStore, MemoryStore, Persistence, PersistenceHandle, PersistenceWorker};
use crate::player_registry::PlayerRegistry;

/// Capacity of the inbound intent queue drained by the game loop.
pub const INTENT_QUEUE_CAPACITY: usize = 16_384;
const PERSISTENCE_QUEUE_CAPACITY: usize = 4096;

pub struct Services {
    pub config: ServerConfig,
    pub metrics: Arc<Metrics>,
    pub sessions: SessionManager,
    pub registry: PlayerRegistry,
    pub events: EventBus,
    pub persistence: PersistenceHandle,
    pub store: Arc<ChunkStore>,
    pub streamer: Arc<WorldStreamer>,
    pub world: Arc<World>,
    pub collision: Arc<CollisionSystem>,
    /// Submission side of the game loop's queue.
    pub intents: mpsc::Sender<Intent>,
}

impl Services {
    /// Open persistence and the chunk store and wire everything together.
    /// Must run inside a tokio runtime.
    pub fn build(config: ServerConfig) -> Result<(Arc<Services>, mpsc::Receiver<Intent>), Fatal> {
        let metrics = Arc::new(Metrics::new());
        let adapter = open_persistence(&config).map_err(Fatal::Persistence)?;
        let (persistence, _worker) = PersistenceWorker::spawn(
            Arc::clone(&adapter),
            Duration::from_millis(config.persistence.timeout_ms.max(1)),
            PERSISTENCE_QUEUE_CAPACITY,
            Arc::clone(&metrics),
        );

        let generator = Arc::new(WorldGenerator::new(config.generator_config()));
        let store = ChunkStore::new(config.store_config(), generator)
            .context("failed to open chunk cache")
            .map_err(Fatal::Persistence)?;
        store.set_backend(Arc::new(PersistenceChunks::new(adapter)));
        let store = Arc::new(store);

        let world = Arc::new(World::new());
        let collision = Arc::new(CollisionSystem::new());
        let streamer = Arc::new(WorldStreamer::new(
            config.streamer_config(),
            Arc::clone(&store),
            Arc::clone(&world),
            Arc::clone(&collision),
        ));

        let limits = SessionLimits {
            max_connections: config.server.max_connections,
            write_queue_capacity: config.server.write_queue_capacity,
            rate_per_second: config.game.rate_limit_per_second,
            burst: config.game.rate_limit_burst,
        };
        let sessions = SessionManager::new(limits, Arc::clone(&metrics));
        let (intents, rx) = mpsc::channel(INTENT_QUEUE_CAPACITY);

        let services = Services {
            config,
            metrics,
            sessions,
            registry: PlayerRegistry::new(),
            events: EventBus::new(),
            persistence,
            store,
            streamer,
            world,
            collision,
            intents,
        };
        Ok((Arc::new(services), rx))
    }
}

fn open_persistence(config: &ServerConfig) -> anyhow::Result<Arc<dyn Persistence>> {
    let p = &config.persistence;
    let spawn = config.game.spawn_point;
    Ok(match p.backend {
        PersistenceBackend::Memory => {
            tracing::info!("Using in-memory persistence");
            Arc::new(MemoryStore::new(p.auto_register, spawn))
        }
        PersistenceBackend::File => {
            tracing::info!("Using file persistence at {}", p.data_dir.display());
            Arc::new(FileStore::open(&p.data_dir, p.auto_register, spawn)?)
        }
    })
}

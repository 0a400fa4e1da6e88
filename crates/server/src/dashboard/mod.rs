//! Operator dashboard.
//!
//! Counters live in [`Metrics`] and are bumped with relaxed atomics from the
//! game loop and connection tasks. The web server in [`server`] runs on its
//! own tasks and only reads: it never touches game state.

pub mod metrics;
pub mod server;

pub use metrics::Metrics;

use metrics::{ChunkGauges, MetricsSnapshot};

use crate::services::Services;

/// Sample the chunk-side gauges owned by the store and streamer.
pub fn chunk_gauges(services: &Services) -> ChunkGauges {
    let store = services.store.stats();
    let streamer = services.streamer.stats();
    ChunkGauges {
        loaded: streamer.loaded as u64,
        loads: streamer.loads_completed,
        cache_hits: store.hits,
        cache_misses: store.misses,
        disk_write_errors: store.disk_write_errors,
    }
}

pub fn snapshot(services: &Services) -> MetricsSnapshot {
    services.metrics.snapshot(chunk_gauges(services))
}

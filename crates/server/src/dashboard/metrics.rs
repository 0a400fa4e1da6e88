//! Lock-free server counters.
//!
//! The game loop, connection tasks and persistence worker update these with
//! relaxed atomics. The dashboard reads them at its own pace.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

pub struct Metrics {
    // Monotonic counters
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    rate_limited: AtomicU64,
    protocol_errors: AtomicU64,
    ticks: AtomicU64,
    overrun_ticks: AtomicU64,
    persistence_failures: AtomicU64,
    dropped_writes: AtomicU64,

    // Tick duration histogram
    hist_under_1ms: AtomicU64,
    hist_1_4ms: AtomicU64,
    hist_4_16ms: AtomicU64,
    hist_16_50ms: AtomicU64,
    hist_over_50ms: AtomicU64,

    // Gauges
    sessions_connected: AtomicU64,
    players_online: AtomicU64,
    entities: AtomicU64,
    npcs: AtomicU64,

    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            overrun_ticks: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
            hist_under_1ms: AtomicU64::new(0),
            hist_1_4ms: AtomicU64::new(0),
            hist_4_16ms: AtomicU64::new(0),
            hist_16_50ms: AtomicU64::new(0),
            hist_over_50ms: AtomicU64::new(0),
            sessions_connected: AtomicU64::new(0),
            players_online: AtomicU64::new(0),
            entities: AtomicU64::new(0),
            npcs: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn frame_in(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Relaxed);
    }

    pub fn frame_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Relaxed);
    }

    pub fn persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Relaxed);
    }

    /// A frame that could not be queued because a session's write queue was full.
    pub fn dropped_write(&self) {
        self.dropped_writes.fetch_add(1, Relaxed);
    }

    /// Called once per game-loop tick with the time the tick took.
    pub fn record_tick(&self, duration: Duration, budget: Duration) {
        self.ticks.fetch_add(1, Relaxed);
        if duration > budget {
            self.overrun_ticks.fetch_add(1, Relaxed);
        }
        let us = duration.as_micros() as u64;
        let bucket = match us {
            0..=999 => &self.hist_under_1ms,
            1_000..=3_999 => &self.hist_1_4ms,
            4_000..=15_999 => &self.hist_4_16ms,
            16_000..=49_999 => &self.hist_16_50ms,
            _ => &self.hist_over_50ms,
        };
        bucket.fetch_add(1, Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_connected.fetch_add(1, Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_connected.fetch_sub(1, Relaxed);
    }

    pub fn set_population(&self, players: usize, entities: usize, npcs: usize) {
        self.players_online.store(players as u64, Relaxed);
        self.entities.store(entities as u64, Relaxed);
        self.npcs.store(npcs as u64, Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Relaxed)
    }

    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Relaxed)
    }

    /// Read all counters into a serializable snapshot.
    pub fn snapshot(&self, chunks: ChunkGauges) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            frames_in: self.frames_in.load(Relaxed),
            frames_out: self.frames_out.load(Relaxed),
            bytes_in: self.bytes_in.load(Relaxed),
            bytes_out: self.bytes_out.load(Relaxed),
            rate_limited: self.rate_limited.load(Relaxed),
            protocol_errors: self.protocol_errors.load(Relaxed),
            ticks: self.ticks.load(Relaxed),
            overrun_ticks: self.overrun_ticks.load(Relaxed),
            persistence_failures: self.persistence_failures.load(Relaxed),
            dropped_writes: self.dropped_writes.load(Relaxed),
            sessions: self.sessions_connected.load(Relaxed),
            players: self.players_online.load(Relaxed),
            entities: self.entities.load(Relaxed),
            npcs: self.npcs.load(Relaxed),
            chunks,
            tick_hist: [
                self.hist_under_1ms.load(Relaxed),
                self.hist_1_4ms.load(Relaxed),
                self.hist_4_16ms.load(Relaxed),
                self.hist_16_50ms.load(Relaxed),
                self.hist_over_50ms.load(Relaxed),
            ],
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk-side numbers owned by the store and streamer, sampled at snapshot time.
#[derive(Clone, Copy, Default, Debug, Serialize)]
pub struct ChunkGauges {
    pub loaded: u64,
    pub loads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_write_errors: u64,
}

#[derive(Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub rate_limited: u64,
    pub protocol_errors: u64,
    pub ticks: u64,
    pub overrun_ticks: u64,
    pub persistence_failures: u64,
    pub dropped_writes: u64,
    pub sessions: u64,
    pub players: u64,
    pub entities: u64,
    pub npcs: u64,
    pub chunks: ChunkGauges,
    /// `[<1ms, 1-4ms, 4-16ms, 16-50ms, >50ms]`
    pub tick_hist: [u64; 5],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_histogram_buckets_by_duration() {
        let m = Metrics::new();
        let budget = Duration::from_millis(16);
        for ms in [0, 2, 10, 20, 80] {
            m.record_tick(Duration::from_millis(ms), budget);
        }
        let snap = m.snapshot(ChunkGauges::default());
        assert_eq!(snap.tick_hist, [1, 1, 1, 1, 1]);
        assert_eq!(snap.ticks, 5);
        assert_eq!(snap.overrun_ticks, 2);
    }

    #[test]
    fn gauges_follow_sessions() {
        let m = Metrics::new();
        m.session_opened();
        m.session_opened();
        m.session_closed();
        m.frame_in(10);
        m.frame_out(25);
        let snap = m.snapshot(ChunkGauges::default());
        assert_eq!(snap.sessions, 1);
        assert_eq!((snap.bytes_in, snap.bytes_out), (10, 25));
    }
}

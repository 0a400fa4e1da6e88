//! Asynchronous, priority-ordered chunk streaming around viewer positions.
//!
//! Loader tasks pop the cheapest request (`distance² + lod_weight * ordinal`)
//! and fetch it from the [`ChunkStore`] on the blocking pool. Unloader tasks
//! release chunks that every viewer has moved away from. Loaded chunks are
//! mirrored into the [`World`] and the [`CollisionSystem`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;

use crate::collision::CollisionSystem;
use crate::store::ChunkStore;
use crate::world::chunk::{ChunkKey, Lod};
use crate::world::lod::LodManager;
use crate::world::position::{ChunkPos, Vec3};
use crate::world::{ChunkHandle, World};

pub type ViewerId = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("chunk request cancelled")]
    Cancelled,
    #[error("streamer is shut down")]
    Shutdown,
    #[error("chunk load failed: {0}")]
    Load(String),
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub loader_workers: usize,
    pub unloader_workers: usize,
    pub queue_capacity: usize,
    pub load_distance: f32,
    pub unload_distance: f32,
    /// Half-width, in chunks, of the square window scanned around a viewer.
    pub load_radius: i32,
    pub lod_weight: f64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            loader_workers: 4,
            unloader_workers: 2,
            queue_capacity: 1000,
            load_distance: 300.0,
            unload_distance: 350.0,
            load_radius: 5,
            lod_weight: 1_000_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StreamerStats {
    pub loaded: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub viewers: usize,
    pub loads_completed: u64,
    pub loads_failed: u64,
    pub unloads: u64,
    pub dropped_requests: u64,
    pub avg_load_ms: f64,
}

/// Queue ordering: lower priority value first, then earlier request.
#[derive(Debug, Clone, Copy)]
struct QueueSlot {
    priority: f64,
    seq: u64,
}

impl PartialEq for QueueSlot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for QueueSlot {}

impl PartialOrd for QueueSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadRequest {
    pos: ChunkPos,
    lod: Lod,
    requested_at: Instant,
}

type Waiter = oneshot::Sender<Result<ChunkHandle, StreamError>>;

struct Loaded {
    key: ChunkKey,
    handle: ChunkHandle,
}

#[derive(Default)]
struct StreamerState {
    running: bool,
    seq: u64,
    queue: BTreeMap<QueueSlot, LoadRequest>,
    pending: HashMap<ChunkPos, QueueSlot>,
    in_flight: HashMap<ChunkPos, Lod>,
    cancelled: HashSet<ChunkPos>,
    waiters: HashMap<ChunkPos, Vec<(Lod, Waiter)>>,
    loaded: HashMap<ChunkPos, Loaded>,
    viewers: HashMap<ViewerId, Vec3>,
    unload_queue: VecDeque<(ChunkPos, bool)>,
    unload_queued: HashSet<ChunkPos>,
}

impl StreamerState {
    fn nearest_viewer_distance(&self, pos: ChunkPos) -> Option<f32> {
        self.viewers
            .values()
            .map(|v| pos.world_center(v.y).distance_xz(*v))
            .min_by(f32::total_cmp)
    }

    fn fail_waiters(&mut self, pos: ChunkPos, error: StreamError) {
        if let Some(list) = self.waiters.remove(&pos) {
            for (_, tx) in list {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}

#[derive(Default)]
struct StreamerCounters {
    loads_completed: AtomicU64,
    loads_failed: AtomicU64,
    unloads: AtomicU64,
    dropped_requests: AtomicU64,
    total_load_micros: AtomicU64,
}

/// Future returned by [`WorldStreamer::request_chunk`].
pub struct ChunkRequest {
    inner: RequestInner,
}

enum RequestInner {
    Ready(Option<Result<ChunkHandle, StreamError>>),
    Waiting(oneshot::Receiver<Result<ChunkHandle, StreamError>>),
}

impl Future for ChunkRequest {
    type Output = Result<ChunkHandle, StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            RequestInner::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(StreamError::Cancelled))),
            RequestInner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(StreamError::Shutdown))),
        }
    }
}

pub struct WorldStreamer {
    config: StreamerConfig,
    store: Arc<ChunkStore>,
    world: Arc<World>,
    collision: Arc<CollisionSystem>,
    lod: LodManager,
    state: Mutex<StreamerState>,
    counters: StreamerCounters,
    load_signal: Notify,
    unload_signal: Notify,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorldStreamer {
    pub fn new(
        config: StreamerConfig,
        store: Arc<ChunkStore>,
        world: Arc<World>,
        collision: Arc<CollisionSystem>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            world,
            collision,
            lod: LodManager::default(),
            state: Mutex::new(StreamerState::default()),
            counters: StreamerCounters::default(),
            load_signal: Notify::new(),
            unload_signal: Notify::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    pub fn lod_manager(&self) -> &LodManager {
        &self.lod
    }

    /// Spawn loader and unloader tasks on the current tokio runtime.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("streamer state poisoned");
            if state.running {
                return;
            }
            state.running = true;
        }
        self.shutdown.send_replace(false);
        let mut tasks = self.tasks.lock().expect("streamer tasks poisoned");
        for i in 0..self.config.loader_workers {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move { this.loader_loop(i).await }));
        }
        for i in 0..self.config.unloader_workers {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move { this.unloader_loop(i).await }));
        }
        tracing::info!(
            "World streamer started ({} loaders, {} unloaders)",
            self.config.loader_workers,
            self.config.unloader_workers
        );
    }

    /// Stop workers. Pending requests resolve with [`StreamError::Shutdown`].
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().expect("streamer state poisoned");
            if !state.running {
                return;
            }
            state.running = false;
            state.queue.clear();
            state.pending.clear();
            let positions: Vec<ChunkPos> = state.waiters.keys().copied().collect();
            for pos in positions {
                state.fail_waiters(pos, StreamError::Shutdown);
            }
        }
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().expect("streamer tasks poisoned").drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Streamer task ended abnormally: {}", e);
            }
        }
        tracing::info!("World streamer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("streamer state poisoned").running
    }

    // ── Requests ────────────────────────────────────────────────────────

    /// Load `(x, z)` at `lod`. Concurrent requests for the same column share
    /// the resulting handle.
    pub fn request_chunk(&self, x: i32, z: i32, lod: Lod) -> ChunkRequest {
        let pos = ChunkPos::new(x, z);
        let mut state = self.state.lock().expect("streamer state poisoned");
        if !state.running {
            return ChunkRequest { inner: RequestInner::Ready(Some(Err(StreamError::Shutdown))) };
        }
        if let Some(loaded) = state.loaded.get(&pos) {
            if loaded.key.lod == lod {
                return ChunkRequest { inner: RequestInner::Ready(Some(Ok(Arc::clone(&loaded.handle)))) };
            }
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.entry(pos).or_default().push((lod, tx));
        state.cancelled.remove(&pos);
        let distance = state.nearest_viewer_distance(pos).unwrap_or(0.0);
        self.enqueue_locked(&mut state, pos, lod, distance);
        ChunkRequest { inner: RequestInner::Waiting(rx) }
    }

    /// Drop a queued request and fail its waiters with [`StreamError::Cancelled`].
    /// A load already in progress still completes into the store cache.
    pub fn cancel_request(&self, x: i32, z: i32) -> bool {
        let pos = ChunkPos::new(x, z);
        let mut state = self.state.lock().expect("streamer state poisoned");
        let had_waiters = state.waiters.contains_key(&pos);
        state.fail_waiters(pos, StreamError::Cancelled);
        let was_queued = match state.pending.remove(&pos) {
            Some(slot) => state.queue.remove(&slot).is_some(),
            None => false,
        };
        if state.in_flight.contains_key(&pos) {
            state.cancelled.insert(pos);
        }
        was_queued || had_waiters
    }

    /// Queue a load unless the same LOD is already loaded, queued or loading.
    /// A queued request is re-prioritized when the new priority is better.
    fn enqueue_locked(&self, state: &mut StreamerState, pos: ChunkPos, lod: Lod, distance: f32) {
        if state.loaded.get(&pos).is_some_and(|l| l.key.lod == lod) {
            return;
        }
        if state.in_flight.get(&pos) == Some(&lod) {
            return;
        }
        let priority = (distance as f64) * (distance as f64) + self.config.lod_weight * lod.ordinal() as f64;
        if let Some(slot) = state.pending.get(&pos).copied() {
            let same_lod = state.queue.get(&slot).is_some_and(|r| r.lod == lod);
            if same_lod && slot.priority <= priority {
                return;
            }
            if let Some(mut request) = state.queue.remove(&slot) {
                state.pending.remove(&pos);
                request.lod = lod;
                let slot = QueueSlot { priority: priority.min(slot.priority), seq: slot.seq };
                state.queue.insert(slot, request);
                state.pending.insert(pos, slot);
            }
            return;
        }

        if state.queue.len() >= self.config.queue_capacity.max(1) {
            let worst = state.queue.keys().next_back().copied();
            match worst {
                Some(worst) if worst.priority > priority => {
                    if let Some(dropped) = state.queue.remove(&worst) {
                        state.pending.remove(&dropped.pos);
                        state.fail_waiters(dropped.pos, StreamError::Cancelled);
                        tracing::debug!("Load queue full, dropped ({}, {})", dropped.pos.x, dropped.pos.z);
                    }
                }
                _ => {
                    self.counters.dropped_requests.fetch_add(1, Ordering::Relaxed);
                    state.fail_waiters(pos, StreamError::Cancelled);
                    return;
                }
            }
            self.counters.dropped_requests.fetch_add(1, Ordering::Relaxed);
        }

        state.seq += 1;
        let slot = QueueSlot { priority, seq: state.seq };
        state.queue.insert(slot, LoadRequest { pos, lod, requested_at: Instant::now() });
        state.pending.insert(pos, slot);
        self.load_signal.notify_one();
    }

    // ── Viewers ─────────────────────────────────────────────────────────

    /// Record a viewer's position, queue loads in its window and schedule
    /// unloads for chunks no viewer is near any more.
    pub fn update_view_position(&self, viewer: ViewerId, pos: Vec3) {
        let mut state = self.state.lock().expect("streamer state poisoned");
        state.viewers.insert(viewer, pos);
        if !state.running {
            return;
        }
        let center = pos.chunk();
        let r = self.config.load_radius.max(0);
        let mut wanted: Vec<(f32, ChunkPos)> = Vec::new();
        for dx in -r..=r {
            for dz in -r..=r {
                let cpos = ChunkPos::new(center.x + dx, center.z + dz);
                let Some(d) = state.nearest_viewer_distance(cpos) else { continue };
                if d <= self.config.load_distance {
                    wanted.push((d, cpos));
                }
            }
        }
        wanted.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (d, cpos) in wanted {
            let lod = self.lod.select(cpos, d);
            self.enqueue_locked(&mut state, cpos, lod, d);
        }
        self.schedule_unloads_locked(&mut state);
    }

    pub fn remove_viewer(&self, viewer: ViewerId) -> bool {
        let mut state = self.state.lock().expect("streamer state poisoned");
        let removed = state.viewers.remove(&viewer).is_some();
        if removed {
            self.schedule_unloads_locked(&mut state);
        }
        removed
    }

    fn schedule_unloads_locked(&self, state: &mut StreamerState) {
        let far: Vec<ChunkPos> = state
            .loaded
            .keys()
            .copied()
            .filter(|&p| {
                state
                    .nearest_viewer_distance(p)
                    .is_none_or(|d| d > self.config.unload_distance)
            })
            .collect();
        for pos in far {
            if state.unload_queued.insert(pos) {
                state.unload_queue.push_back((pos, false));
                self.unload_signal.notify_one();
            }
        }
    }

    /// Schedule an unload regardless of viewer distance.
    pub fn unload_chunk(&self, x: i32, z: i32) -> bool {
        let pos = ChunkPos::new(x, z);
        let mut state = self.state.lock().expect("streamer state poisoned");
        if !state.loaded.contains_key(&pos) {
            return false;
        }
        state.unload_queued.insert(pos);
        state.unload_queue.push_back((pos, true));
        self.unload_signal.notify_one();
        true
    }

    // ── Workers ─────────────────────────────────────────────────────────

    async fn loader_loop(self: Arc<Self>, worker: usize) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::debug!("Chunk loader {} started", worker);
        loop {
            let next = {
                let mut state = self.state.lock().expect("streamer state poisoned");
                if !state.running {
                    break;
                }
                match state.queue.pop_first() {
                    Some((_, request)) => {
                        state.pending.remove(&request.pos);
                        state.in_flight.insert(request.pos, request.lod);
                        if !state.queue.is_empty() {
                            self.load_signal.notify_one();
                        }
                        Some(request)
                    }
                    None => None,
                }
            };

            let request = match next {
                Some(request) => request,
                None => {
                    tokio::select! {
                        _ = self.load_signal.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
            };

            let key = ChunkKey::new(request.pos.x, request.pos.z, request.lod);
            let store = Arc::clone(&self.store);
            let started = Instant::now();
            match tokio::task::spawn_blocking(move || store.acquire(key)).await {
                Ok(handle) => self.complete_load(key, handle, started, request.requested_at),
                Err(e) => self.fail_load(request.pos, StreamError::Load(e.to_string())),
            }
        }
        tracing::debug!("Chunk loader {} stopped", worker);
    }

    fn complete_load(&self, key: ChunkKey, handle: ChunkHandle, started: Instant, requested_at: Instant) {
        let pos = key.pos();
        let elapsed = started.elapsed();
        self.counters.loads_completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_load_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        let mut state = self.state.lock().expect("streamer state poisoned");
        state.in_flight.remove(&pos);
        if state.cancelled.remove(&pos) && !state.waiters.contains_key(&pos) {
            drop(state);
            self.store.release(key);
            return;
        }

        {
            let chunk = handle.read().expect("chunk poisoned");
            self.collision.register_chunk(&chunk);
        }
        self.world.insert_chunk(Arc::clone(&handle));
        let previous = state.loaded.insert(pos, Loaded { key, handle: Arc::clone(&handle) });
        if let Some(prev) = previous {
            if prev.key != key {
                self.store.release(prev.key);
            } else {
                // Same build loaded twice: keep a single pool reference.
                self.store.release(key);
            }
        }
        state.unload_queued.remove(&pos);

        // Resolve waiters for this LOD; re-queue anyone who asked for another.
        let mut retry: Option<Lod> = None;
        if let Some(list) = state.waiters.remove(&pos) {
            let mut remaining = Vec::new();
            for (lod, tx) in list {
                if lod == key.lod {
                    let _ = tx.send(Ok(Arc::clone(&handle)));
                } else {
                    retry.get_or_insert(lod);
                    remaining.push((lod, tx));
                }
            }
            if !remaining.is_empty() {
                state.waiters.insert(pos, remaining);
            }
        }
        if let Some(lod) = retry {
            let distance = state.nearest_viewer_distance(pos).unwrap_or(0.0);
            self.enqueue_locked(&mut state, pos, lod, distance);
        }
        tracing::debug!(
            "Loaded chunk {} in {:?} ({:?} after request)",
            key,
            elapsed,
            requested_at.elapsed()
        );
    }

    fn fail_load(&self, pos: ChunkPos, error: StreamError) {
        self.counters.loads_failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Chunk ({}, {}) failed to load: {}", pos.x, pos.z, error);
        let mut state = self.state.lock().expect("streamer state poisoned");
        state.in_flight.remove(&pos);
        state.cancelled.remove(&pos);
        state.fail_waiters(pos, error);
    }

    async fn unloader_loop(self: Arc<Self>, worker: usize) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::debug!("Chunk unloader {} started", worker);
        loop {
            let next = {
                let mut state = self.state.lock().expect("streamer state poisoned");
                if !state.running {
                    break;
                }
                let next = state.unload_queue.pop_front();
                if next.is_some() && !state.unload_queue.is_empty() {
                    self.unload_signal.notify_one();
                }
                next
            };
            match next {
                Some((pos, force)) => self.unload_now(pos, force),
                None => {
                    tokio::select! {
                        _ = self.unload_signal.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        tracing::debug!("Chunk unloader {} stopped", worker);
    }

    fn unload_now(&self, pos: ChunkPos, force: bool) {
        let loaded = {
            let mut state = self.state.lock().expect("streamer state poisoned");
            state.unload_queued.remove(&pos);
            // A viewer may have come back since this was queued.
            if !force
                && state
                    .nearest_viewer_distance(pos)
                    .is_some_and(|d| d <= self.config.unload_distance)
            {
                return;
            }
            match state.loaded.remove(&pos) {
                Some(l) => l,
                None => return,
            }
        };
        let modified = loaded.handle.read().expect("chunk poisoned").is_modified();
        if modified {
            self.store.mark_dirty(loaded.key);
        }
        self.world.remove_chunk(pos);
        self.collision.unregister_chunk(pos);
        self.lod.forget(pos);
        self.store.release(loaded.key);
        self.counters.unloads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Unloaded chunk {}", loaded.key);
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn loaded_chunks(&self) -> Vec<ChunkKey> {
        let state = self.state.lock().expect("streamer state poisoned");
        let mut keys: Vec<ChunkKey> = state.loaded.values().map(|l| l.key).collect();
        keys.sort_unstable();
        keys
    }

    pub fn is_loaded(&self, x: i32, z: i32) -> bool {
        self.state
            .lock()
            .expect("streamer state poisoned")
            .loaded
            .contains_key(&ChunkPos::new(x, z))
    }

    pub fn loaded_handle(&self, x: i32, z: i32) -> Option<(ChunkKey, ChunkHandle)> {
        let state = self.state.lock().expect("streamer state poisoned");
        state
            .loaded
            .get(&ChunkPos::new(x, z))
            .map(|l| (l.key, Arc::clone(&l.handle)))
    }

    pub fn viewers(&self) -> Vec<(ViewerId, Vec3)> {
        let state = self.state.lock().expect("streamer state poisoned");
        state.viewers.iter().map(|(&id, &p)| (id, p)).collect()
    }

    pub fn stats(&self) -> StreamerStats {
        let state = self.state.lock().expect("streamer state poisoned");
        let completed = self.counters.loads_completed.load(Ordering::Relaxed);
        let micros = self.counters.total_load_micros.load(Ordering::Relaxed);
        StreamerStats {
            loaded: state.loaded.len(),
            pending: state.queue.len(),
            in_flight: state.in_flight.len(),
            viewers: state.viewers.len(),
            loads_completed: completed,
            loads_failed: self.counters.loads_failed.load(Ordering::Relaxed),
            unloads: self.counters.unloads.load(Ordering::Relaxed),
            dropped_requests: self.counters.dropped_requests.load(Ordering::Relaxed),
            avg_load_ms: if completed == 0 {
                0.0
            } else {
                micros as f64 / completed as f64 / 1000.0
            },
        }
    }
}

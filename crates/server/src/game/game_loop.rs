//! The fixed-rate simulation loop.
//!
//! One task owns [`GameState`]. Each tick drains queued intents, advances
//! the world by a clamped `dt`, replicates the result and runs housekeeping.
//! Shutdown is a tick-driven state too: once a [`Intent::BeginShutdown`]
//! arrives the loop keeps running until every session has left or the grace
//! window expires, then saves everything and returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use worldcore_engine::store::CacheError;

use super::{GameState, Intent};
use crate::entity::ai;
use crate::protocol::dispatcher::Dispatcher;
use crate::services::Services;

/// Upper bound on intents applied in one tick; the rest wait for the next.
pub const MAX_INTENTS_PER_TICK: usize = 4096;

pub struct GameLoop {
    state: GameState,
    dispatcher: Dispatcher,
    intents: mpsc::Receiver<Intent>,
    shutdown_deadline: Option<Instant>,
}

impl GameLoop {
    pub fn new(services: Arc<Services>, intents: mpsc::Receiver<Intent>) -> Self {
        GameLoop { state: GameState::new(services), dispatcher: Dispatcher::new(), intents, shutdown_deadline: None }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Run until graceful shutdown completes.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let services = Arc::clone(&self.state.services);
        let budget = services.config.tick_interval();
        let max_dt = Duration::from_millis(services.config.game.max_dt_ms.max(1));
        let mut interval = tokio::time::interval(budget);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Game loop running at {:?} per tick", budget);

        let mut last = Instant::now();
        loop {
            interval.tick().await;
            let started = Instant::now();
            let dt = started.duration_since(last).min(max_dt);
            last = started;

            self.tick(dt.as_secs_f32());
            services.metrics.record_tick(started.elapsed(), budget);

            if self.shutdown_complete(Instant::now()) {
                break;
            }
        }
        self.finish().await;
        Ok(())
    }

    /// One simulation step of `dt` seconds.
    pub fn tick(&mut self, dt: f32) {
        self.tick_at(dt, Instant::now());
    }

    /// [`tick`](Self::tick) with an explicit wall clock for the heartbeat sweep.
    pub fn tick_at(&mut self, dt: f32, now: Instant) {
        self.drain_intents();

        let state = &mut self.state;
        state.clock += f64::from(dt);
        state.step_projectiles(dt);
        state.expire_items();

        let surface = state.surface_fn();
        let events = ai::tick(&mut state.entities, dt, &state.ai, &surface);
        state.resolve_ai_events(events);
        let spawned = state.mobs.tick(state.clock, &mut state.entities, &surface);
        if !spawned.is_empty() {
            tracing::debug!("Spawned {} mobs", spawned.len());
        }

        state.update_views();
        state.replicate();
        state.update_metrics();
        state.periodic_save();

        let sweep = state.services.sessions.sweep_heartbeats(now, state.services.config.heartbeat());
        if !sweep.timed_out.is_empty() {
            tracing::info!("Closed {} sessions on heartbeat timeout", sweep.timed_out.len());
        }
    }

    fn drain_intents(&mut self) {
        for _ in 0..MAX_INTENTS_PER_TICK {
            let Ok(intent) = self.intents.try_recv() else {
                break;
            };
            match intent {
                Intent::Frame { session_id, frame } => self.dispatcher.dispatch(&mut self.state, session_id, frame),
                Intent::LoginResult { session_id, username, result } => {
                    self.state.complete_login(session_id, &username, result);
                }
                Intent::Disconnected { session_id } => self.state.on_disconnect(session_id),
                Intent::BeginShutdown => self.begin_shutdown(),
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutdown_deadline.is_some() {
            return;
        }
        let grace = Duration::from_secs(self.state.services.config.game.shutdown_grace_seconds);
        let notified = self.state.services.sessions.begin_graceful_shutdown(grace);
        tracing::info!("Graceful shutdown started: {} sessions notified, {:?} grace", notified, grace);
        self.shutdown_deadline = Some(Instant::now() + grace);
    }

    pub fn shutdown_complete(&self, now: Instant) -> bool {
        match self.shutdown_deadline {
            Some(deadline) => now >= deadline || self.state.services.sessions.count() == 0,
            None => false,
        }
    }

    /// Force-close stragglers and persist players and chunks.
    async fn finish(mut self) {
        let services = Arc::clone(&self.state.services);
        let closed = services.sessions.force_close_all("server shutdown");
        if closed > 0 {
            tracing::info!("Force-closed {} sessions", closed);
        }
        // Disconnects that raced the deadline still need their players saved.
        self.drain_intents();

        let states = self.state.all_player_states();
        let count = states.len();
        for state in states {
            if let Err(e) = services.persistence.save_player_wait(state).await {
                tracing::error!("Final player save failed: {}", e);
            }
        }
        if let Err(e) = services.persistence.flush().await {
            tracing::error!("Persistence flush failed: {}", e);
        }
        tracing::info!("Saved {} players", count);

        services.streamer.stop().await;
        let store = Arc::clone(&services.store);
        let flushed = tokio::task::spawn_blocking(move || {
            let written = store.flush()?;
            store.shutdown()?;
            Ok::<usize, CacheError>(written)
        });
        match flushed.await {
            Ok(Ok(n)) => tracing::info!("Shutdown flush complete: {} chunks written", n),
            Ok(Err(e)) => tracing::error!("Shutdown chunk flush failed: {}", e),
            Err(e) => tracing::error!("Chunk flush task panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PersistenceBackend, ServerConfig};
    use crate::net::session::SessionState;
    use crate::protocol::Frame;
    use serde_json::{Value, json};

    fn quiet_loop() -> (GameLoop, Arc<Services>) {
        let mut config = ServerConfig::default();
        config.persistence.backend = PersistenceBackend::Memory;
        config.cache.disk_path = String::new();
        config.world.max_terrain_height = 8;
        config.game.spawn_zones = Vec::new();
        config.game.heartbeat_seconds = 1;
        config.game.shutdown_grace_seconds = 1;
        let (services, intents) = Services::build(config).unwrap();
        (GameLoop::new(Arc::clone(&services), intents), services)
    }

    fn frames(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(line.trim_end()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn tick_applies_queued_frames() {
        let (mut game, services) = quiet_loop();
        let (session, mut rx) = services.sessions.create("127.0.0.1:9".parse().unwrap()).unwrap();
        let frame = Frame::new("ping", json!({ "client_time": 3 }));
        services.intents.try_send(Intent::Frame { session_id: session.id(), frame }).unwrap();

        game.tick(0.01);
        let pong = frames(&mut rx).into_iter().find(|f| f["type"] == "pong").unwrap();
        assert_eq!(pong["latency"], 3);
        assert!(game.state().clock > 0.0);
    }

    #[tokio::test]
    async fn tick_closes_sessions_idle_past_the_heartbeat() {
        let (mut game, services) = quiet_loop();
        let (idle, _rx) = services.sessions.create("127.0.0.1:9".parse().unwrap()).unwrap();

        game.tick_at(0.01, Instant::now());
        assert_eq!(idle.state(), SessionState::Connected);

        game.tick_at(0.01, Instant::now() + Duration::from_secs(3));
        assert_eq!(idle.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn shutdown_completes_at_deadline_or_when_empty() {
        let (mut game, services) = quiet_loop();
        let (session, mut rx) = services.sessions.create("127.0.0.1:9".parse().unwrap()).unwrap();
        assert!(!game.shutdown_complete(Instant::now() + Duration::from_secs(60)));

        services.intents.try_send(Intent::BeginShutdown).unwrap();
        game.tick(0.01);
        let notice = frames(&mut rx).into_iter().find(|f| f["type"] == "shutdown_notice").unwrap();
        assert_eq!(notice["timeout_seconds"], 1);
        assert!(services.sessions.is_shutting_down());

        assert!(!game.shutdown_complete(Instant::now()));
        assert!(game.shutdown_complete(Instant::now() + Duration::from_secs(2)));

        services.sessions.remove(session.id());
        assert!(game.shutdown_complete(Instant::now()));
    }
}

//! Authoritative game state.
//!
//! [`GameState`] is owned by the game loop task. Connection tasks and the
//! persistence worker never touch it directly: they submit an [`Intent`] and
//! the loop applies it at the start of the next tick.

pub mod combat;
pub mod game_loop;
pub mod replication;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};
use worldcore_engine::world::position::{ChunkPos, Vec3};

use crate::entity::ai::AiConfig;
use crate::entity::loot::LootTables;
use crate::entity::mobs::MobController;
use crate::entity::{Entity, EntityBody, EntityId, EntityKind, EntityManager, Player, Stats};
use crate::error::ProtocolError;
use crate::event_bus::GameEvent;
use crate::net::session::{Session, SessionId, SessionState};
use crate::persistence::{PlayerId, PlayerState, WorkerError};
use crate::player_registry::PlayerInfo;
use crate::protocol::{Frame, error_envelope, now_millis, success};
use crate::services::Services;
use replication::Replication;

/// Movement speed of player characters, units per second.
const PLAYER_SPEED: f32 = 5.0;

/// Work submitted to the game loop from other tasks.
#[derive(Debug)]
pub enum Intent {
    Frame { session_id: SessionId, frame: Frame },
    LoginResult { session_id: SessionId, username: String, result: Result<Option<PlayerState>, WorkerError> },
    Disconnected { session_id: SessionId },
    BeginShutdown,
}

pub struct GameState {
    pub services: Arc<Services>,
    pub entities: EntityManager,
    pub mobs: MobController,
    pub loot: LootTables,
    pub ai: AiConfig,
    pub rng: StdRng,
    /// Simulated seconds since the loop started.
    pub clock: f64,
    /// Identifies this server run in the persisted event log.
    pub game_id: String,
    pub replication: Replication,
    pending_logins: HashSet<SessionId>,
    extras: HashMap<PlayerId, Value>,
    view_chunks: HashMap<EntityId, ChunkPos>,
    last_save: f64,
}

impl GameState {
    pub fn new(services: Arc<Services>) -> Self {
        let game = &services.config.game;
        let seed = services.config.world.seed;
        let state = GameState {
            entities: EntityManager::new(Arc::clone(&services.collision)),
            mobs: MobController::new(game.spawn_zones.clone(), seed),
            loot: LootTables::new(game.loot_tables.clone()),
            ai: AiConfig { flee_threat_threshold: game.flee_threat_threshold },
            rng: StdRng::seed_from_u64(seed.rotate_left(17) ^ 0x10_07),
            clock: 0.0,
            game_id: uuid::Uuid::new_v4().to_string(),
            replication: Replication::default(),
            pending_logins: HashSet::new(),
            extras: HashMap::new(),
            view_chunks: HashMap::new(),
            last_save: 0.0,
            services,
        };
        tracing::info!(
            "Game {} ready: {} spawn zones, {} loot tables",
            state.game_id,
            state.mobs.status().len(),
            state.loot.len()
        );
        state
    }

    /// Ground height lookup that does not borrow `self`.
    pub fn surface_fn(&self) -> impl Fn(f32, f32) -> Option<f32> + use<> {
        let world = Arc::clone(&self.services.world);
        move |x, z| world.surface_height(x, z)
    }

    pub fn publish(&self, event: GameEvent) {
        self.services.events.publish(event);
    }

    pub fn log_event(&self, player_id: PlayerId, kind: &str, data: Value) {
        self.services.persistence.append_event(&self.game_id, player_id, kind, data);
    }

    /// The caller's player entity.
    pub fn player_entity(&self, session: &Session) -> Result<EntityId, ProtocolError> {
        session
            .entity_id()
            .filter(|id| self.entities.contains(*id))
            .ok_or_else(ProtocolError::not_authenticated)
    }

    pub fn session_of(&self, entity: EntityId) -> Option<SessionId> {
        self.entities.get(entity)?.as_player().map(|p| p.session_id)
    }

    /// Queue a message for the player controlling `entity`, if any.
    pub fn send_to_entity(&self, entity: EntityId, msg: &Value) -> bool {
        match self.session_of(entity) {
            Some(sid) => self.services.sessions.send_to(sid, msg),
            None => false,
        }
    }

    // ── Login / logout ──────────────────────────────────────────────────

    pub fn login_pending(&self, session_id: SessionId) -> bool {
        self.pending_logins.contains(&session_id)
    }

    /// Authenticate off the loop; the result comes back as [`Intent::LoginResult`].
    pub fn begin_login(&mut self, session_id: SessionId, username: String, password: String) {
        self.pending_logins.insert(session_id);
        let persistence = self.services.persistence.clone();
        let intents = self.services.intents.clone();
        tokio::spawn(async move {
            let result = persistence.authenticate(&username, &password).await;
            let _ = intents.send(Intent::LoginResult { session_id, username, result }).await;
        });
    }

    pub fn complete_login(
        &mut self,
        session_id: SessionId,
        username: &str,
        result: Result<Option<PlayerState>, WorkerError>,
    ) {
        if !self.pending_logins.remove(&session_id) {
            return;
        }
        let Some(session) = self.services.sessions.get(session_id) else {
            return;
        };
        let state = match result {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::info!("Rejected login for '{}' from {}", username, session.remote());
                session.send(&error_envelope(&ProtocolError::unauthorized("Invalid username or password")));
                session.record_violation();
                return;
            }
            Err(e) => {
                tracing::warn!("Login for '{}' failed: {}", username, e);
                session.send(&error_envelope(&ProtocolError::internal("Login temporarily unavailable")));
                return;
            }
        };
        if self.services.sessions.is_shutting_down() {
            session.send(&error_envelope(&ProtocolError::forbidden("Server is shutting down")));
            return;
        }
        if matches!(session.state(), SessionState::Closing | SessionState::Closed) {
            tracing::debug!("Dropping login for '{}': session {} is closing", username, session_id);
            return;
        }

        // A second login for the same account takes over; the live record is
        // fresher than what persistence returned.
        let mut state = state;
        if let Some(previous) = self.services.registry.get(state.player_id)
            && previous.session_id != session_id
        {
            if let Some(carried) = self.despawn_player(previous.session_id, "relogin") {
                state = carried;
            }
            if let Some(old) = self.services.sessions.get(previous.session_id) {
                old.send(&json!({
                    "type": "disconnect",
                    "reason": "Logged in from another location",
                    "timestamp": now_millis(),
                }));
                self.services.sessions.deauthenticate(old.id());
                old.close("logged in from another location");
            }
        }

        let entity_id = self.spawn_player(&session, &state);
        let player_id = state.player_id;
        if !self.services.sessions.authenticate(session_id, player_id, entity_id) {
            tracing::debug!("Session {} closed before login for '{}' completed", session_id, username);
            self.entities.destroy(entity_id);
            self.extras.remove(&player_id);
            return;
        }
        let position = self.entities.get(entity_id).map_or(state.position, Entity::position);
        self.services.registry.register(PlayerInfo {
            player_id,
            session_id,
            entity_id,
            username: state.username.clone(),
            position,
            logged_in_at: Instant::now(),
        });
        self.services.streamer.update_view_position(entity_id, position);
        self.view_chunks.insert(entity_id, position.chunk());

        session.send(&success(
            "logged_in",
            Some(json!({
                "player_id": player_id,
                "entity_id": entity_id,
                "username": state.username,
                "position": { "x": position.x, "y": position.y, "z": position.z },
                "stats": {
                    "health": state.health,
                    "max_health": state.max_health,
                    "attack": state.attack,
                    "defense": state.defense,
                    "level": state.level,
                    "experience": state.experience,
                },
                "gold": state.gold,
                "inventory": state.inventory,
            })),
        ));
        self.services.sessions.broadcast_filter(
            |s| s.is_authenticated() && s.id() != session_id,
            &json!({ "type": "player_joined", "player_id": player_id, "entity_id": entity_id, "username": state.username }),
        );
        tracing::info!("Player '{}' ({}) logged in as entity {}", state.username, player_id, entity_id);
        self.publish(GameEvent::PlayerLogin { player_id, entity_id, username: state.username.clone() });
        self.log_event(player_id, "login", json!({ "entity_id": entity_id, "session_id": session_id }));
    }

    fn spawn_player(&mut self, session: &Session, state: &PlayerState) -> EntityId {
        let game = &self.services.config.game;
        let position = if state.position.is_finite() { state.position } else { game.spawn_point };
        let max_health = state.max_health.max(1.0);
        let health = if state.health > 0.0 { state.health.min(max_health) } else { max_health };
        let player = Player {
            session_id: session.id(),
            player_id: state.player_id,
            username: state.username.clone(),
            stats: Stats {
                health,
                max_health,
                attack: state.attack,
                defense: state.defense,
                speed: PLAYER_SPEED,
                level: state.level.max(1),
                experience: state.experience,
            },
            gold: state.gold,
            inventory: state.inventory.clone(),
            last_input_seq: 0,
        };
        self.extras.insert(state.player_id, state.extra.clone());
        self.entities.create(position, game.player_radius, EntityBody::Player(player))
    }

    /// Current persisted form of a player entity.
    pub fn player_state(&self, entity: EntityId) -> Option<PlayerState> {
        let e = self.entities.get(entity)?;
        let p = e.as_player()?;
        Some(PlayerState {
            player_id: p.player_id,
            username: p.username.clone(),
            position: e.position(),
            health: p.stats.health,
            max_health: p.stats.max_health,
            level: p.stats.level,
            experience: p.stats.experience,
            attack: p.stats.attack,
            defense: p.stats.defense,
            gold: p.gold,
            inventory: p.inventory.clone(),
            extra: self.extras.get(&p.player_id).cloned().unwrap_or(Value::Null),
        })
    }

    pub fn all_player_states(&self) -> Vec<PlayerState> {
        self.entities.players().filter_map(|(h, _)| self.player_state(h.id)).collect()
    }

    /// Remove the player entity driven by `session_id`, queue its save and
    /// return the saved state.
    pub fn despawn_player(&mut self, session_id: SessionId, reason: &str) -> Option<PlayerState> {
        let entity_id = self.entities.player_for_session(session_id)?;
        let state = self.player_state(entity_id)?;
        for familiar in self.entities.by_owner(entity_id) {
            self.entities.destroy(familiar);
        }
        self.entities.destroy(entity_id);
        self.forget_entity(entity_id);
        self.services.registry.deregister(state.player_id, session_id);
        self.services.streamer.remove_viewer(entity_id);
        self.view_chunks.remove(&entity_id);
        self.extras.remove(&state.player_id);

        self.services.persistence.save_player(state.clone());
        self.log_event(state.player_id, "logout", json!({ "reason": reason, "entity_id": entity_id }));
        self.publish(GameEvent::PlayerLogout { player_id: state.player_id, entity_id });
        tracing::info!("Player '{}' left ({})", state.username, reason);
        Some(state)
    }

    pub fn on_disconnect(&mut self, session_id: SessionId) {
        self.pending_logins.remove(&session_id);
        self.despawn_player(session_id, "disconnect");
        self.replication.forget_session(session_id);
    }

    /// Drop `id` from every NPC's threat map and target.
    pub fn forget_entity(&mut self, id: EntityId) {
        for npc_id in self.entities.ids_of_kind(EntityKind::Npc) {
            if let Some(npc) = self.entities.get_mut(npc_id).and_then(Entity::as_npc_mut) {
                npc.forget(id);
            }
        }
    }

    // ── Per-tick housekeeping ───────────────────────────────────────────

    /// Tell the streamer about players that entered a new chunk.
    pub fn update_views(&mut self) {
        let moved: Vec<(EntityId, Vec3)> = self
            .entities
            .players()
            .filter(|(h, _)| self.view_chunks.get(&h.id) != Some(&h.chunk))
            .map(|(h, _)| (h.id, h.position))
            .collect();
        for (id, pos) in moved {
            self.services.streamer.update_view_position(id, pos);
            self.view_chunks.insert(id, pos.chunk());
        }
    }

    pub fn replicate(&mut self) {
        let radius = self.services.config.game.interest_radius;
        let viewers: Vec<(SessionId, EntityId, Vec3)> = self
            .entities
            .players()
            .map(|(h, p)| (p.session_id, h.id, h.position))
            .collect();
        let out = self.replication.collect(&self.entities, &viewers, radius);
        for (session_id, messages) in out {
            if let Some(session) = self.services.sessions.get(session_id) {
                for msg in &messages {
                    session.send(msg);
                }
            }
        }
    }

    pub fn update_metrics(&self) {
        let counts = self.entities.count_by_kind();
        self.services.metrics.set_population(counts.players, self.entities.len(), counts.npcs);
    }

    /// Every `player_save_seconds`, queue a save of each online player and
    /// flush edited chunks on the blocking pool.
    pub fn periodic_save(&mut self) {
        let period = self.services.config.game.player_save_seconds.max(1) as f64;
        if self.clock - self.last_save < period {
            return;
        }
        self.last_save = self.clock;
        let states = self.all_player_states();
        let queued = states.into_iter().filter(|s| self.services.persistence.save_player(s.clone())).count();
        tracing::debug!("Queued periodic save of {} players", queued);

        let store = Arc::clone(&self.services.store);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.flush() {
                tracing::warn!("Periodic chunk flush failed: {}", e);
            }
        });
    }
}

//! Routes decoded frames to their handlers.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::handlers;
use super::{Frame, error_envelope};
use crate::error::ProtocolError;
use crate::game::GameState;
use crate::net::session::{Session, SessionId};

pub type HandlerResult = Result<(), ProtocolError>;
pub type Handler = fn(&mut GameState, &Arc<Session>, &Map<String, Value>) -> HandlerResult;

#[derive(Clone, Copy)]
struct Route {
    handler: Handler,
    /// Callable before login.
    public: bool,
}

pub struct Dispatcher {
    routes: HashMap<&'static str, Route>,
}

impl Dispatcher {
    /// An empty table.
    pub fn empty() -> Self {
        Self { routes: HashMap::new() }
    }

    /// The full handler table.
    pub fn new() -> Self {
        let mut d = Self::empty();
        d.register_public("login", handlers::login);
        d.register_public("logout", handlers::logout);
        d.register_public("ping", handlers::ping);
        d.register_public("pong", handlers::pong);
        d.register_public("who", handlers::who);
        d.register_public("get_time", handlers::get_time);

        d.register("player_position_update", handlers::position_update);
        d.register("move", handlers::position_update);
        d.register("attack", handlers::attack);
        d.register("interact", handlers::interact);
        d.register("chat", handlers::chat);
        d.register("world_chunk_request", handlers::world_chunk_request);
        d.register("npc_interaction", handlers::npc_interaction);
        d.register("familiar_command", handlers::familiar_command);
        d.register("collision_check", handlers::collision_check);
        d.register("entity_spawn_request", handlers::entity_spawn_request);
        d.register("nearby_entities", handlers::nearby_entities);
        d.register("block_update", handlers::block_update);
        d.register("join_group", handlers::join_group);
        d.register("leave_group", handlers::leave_group);
        d
    }

    pub fn register(&mut self, kind: &'static str, handler: Handler) {
        self.routes.insert(kind, Route { handler, public: false });
    }

    pub fn register_public(&mut self, kind: &'static str, handler: Handler) {
        self.routes.insert(kind, Route { handler, public: true });
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.routes.contains_key(kind)
    }

    /// Run the handler for `frame`. Errors are sent back as an `error`
    /// envelope and count toward the session's violation limit.
    pub fn dispatch(&self, game: &mut GameState, session_id: SessionId, frame: Frame) {
        let Some(session) = game.services.sessions.get(session_id) else {
            return;
        };
        match self.route(game, &session, &frame) {
            Ok(()) => session.clear_violations(),
            Err(err) => {
                tracing::debug!("Session {} '{}' failed: {}", session_id, frame.kind, err);
                game.services.metrics.protocol_error();
                session.send(&error_envelope(&err));
                session.record_violation();
            }
        }
    }

    fn route(&self, game: &mut GameState, session: &Arc<Session>, frame: &Frame) -> HandlerResult {
        let route = self
            .routes
            .get(frame.kind.as_str())
            .ok_or_else(|| ProtocolError::bad_request(format!("Unknown message type: {}", frame.kind)))?;
        if !route.public && !session.is_authenticated() {
            return Err(ProtocolError::not_authenticated());
        }
        (route.handler)(game, session, &frame.body)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

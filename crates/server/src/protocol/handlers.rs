//! One function per client message type.
//!
//! Handlers run on the game loop with exclusive access to [`GameState`]. They
//! answer through the session's write queue and return a [`ProtocolError`] for
//! anything the client did wrong; the dispatcher turns that into an `error`
//! envelope.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use worldcore_engine::collision::BodyKind;
use worldcore_engine::world::block::BlockType;
use worldcore_engine::world::chunk::{Lod, WorldChunk};
use worldcore_engine::world::position::{LocalBlockPos, Vec3};

use super::dispatcher::HandlerResult;
use super::{
    error_envelope, i32_field, i64_field, now_millis, opt_f32_field, opt_u64_field, position_fields,
    str_field, success, u64_field, vec3_object,
};
use crate::entity::npc::{FAMILIAR_LIMIT, FamiliarCommand, Npc, NpcState, NpcType};
use crate::entity::{Entity, EntityBody, EntityId, EntityKind, Projectile};
use crate::error::ProtocolError;
use crate::event_bus::GameEvent;
use crate::game::GameState;
use crate::game::combat::MELEE_RANGE;
use crate::net::session::Session;

const MAX_USERNAME_LEN: usize = 32;
const MAX_CHAT_LEN: usize = 256;
/// How close a player must stand to talk to an NPC.
const TALK_RANGE: f32 = 5.0;
/// Farthest point from the player where something may be spawned.
const SPAWN_RANGE: f32 = 10.0;
const BLOCK_REACH: f32 = 10.0;
const PROJECTILE_SPEED: f32 = 20.0;
const PROJECTILE_LIFETIME: f32 = 3.0;
const PROJECTILE_RADIUS: f32 = 0.1;
const MAX_QUERY_RADIUS: f32 = 100.0;
const DEFAULT_PATROL_RADIUS: f32 = 8.0;
const RESOLVE_ITERATIONS: usize = 4;

// ── Session ─────────────────────────────────────────────────────────────

pub fn login(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    if session.is_authenticated() {
        return Err(ProtocolError::bad_request("Already logged in"));
    }
    if game.services.sessions.is_shutting_down() {
        return Err(ProtocolError::forbidden("Server is shutting down"));
    }
    let username = str_field(body, "username")?.trim();
    let password = str_field(body, "password")?;
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        return Err(ProtocolError::bad_request("Username must be 1 to 32 characters"));
    }
    if game.login_pending(session.id()) {
        return Err(ProtocolError::bad_request("Login already in progress"));
    }
    game.begin_login(session.id(), username.to_string(), password.to_string());
    Ok(())
}

pub fn logout(game: &mut GameState, session: &Arc<Session>, _body: &Map<String, Value>) -> HandlerResult {
    if !session.is_authenticated() {
        return Err(ProtocolError::bad_request("Not logged in"));
    }
    game.despawn_player(session.id(), "logout");
    game.replication.forget_session(session.id());
    game.services.sessions.deauthenticate(session.id());
    session.send(&success("logged_out", None));
    Ok(())
}

pub fn ping(_game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let client_time = body.get("client_time").cloned().unwrap_or(Value::Null);
    session.send(&json!({ "type": "pong", "server_time": now_millis(), "latency": client_time }));
    Ok(())
}

/// Activity was already recorded when the frame arrived.
pub fn pong(_game: &mut GameState, _session: &Arc<Session>, _body: &Map<String, Value>) -> HandlerResult {
    Ok(())
}

pub fn who(game: &mut GameState, session: &Arc<Session>, _body: &Map<String, Value>) -> HandlerResult {
    let players = game.services.registry.snapshot();
    session.send(&json!({
        "type": "who_response",
        "online_count": players.len(),
        "players": players,
        "timestamp": now_millis(),
    }));
    Ok(())
}

pub fn get_time(game: &mut GameState, session: &Arc<Session>, _body: &Map<String, Value>) -> HandlerResult {
    session.send(&json!({ "type": "time", "server_time": now_millis(), "game_time": game.clock }));
    Ok(())
}

// ── Movement ────────────────────────────────────────────────────────────

/// `player_position_update` and its `move` alias.
pub fn position_update(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let mut target = position_fields(body)?;
    let yaw = opt_f32_field(body, "yaw")?;
    let pitch = opt_f32_field(body, "pitch")?;
    let seq = opt_u64_field(body, "seq")?;

    let current = game.entities.get(id).map(Entity::position).ok_or_else(ProtocolError::not_authenticated)?;
    let cfg = &game.services.config.game;
    if target.distance(current) > cfg.max_move_per_frame {
        return Err(ProtocolError::bad_request("Movement too large"));
    }
    let radius = cfg.player_radius;
    let interest = cfg.interest_radius;
    if let Some(ground) = game.services.world.surface_height(target.x, target.z) {
        target.y = target.y.max(ground);
    }

    let (resolved, contact) = game.services.collision.resolve(target, radius, Some(id), RESOLVE_ITERATIONS);
    game.entities.move_entity(id, resolved);
    if let Some(entity) = game.entities.get_mut(id) {
        if yaw.is_some() || pitch.is_some() {
            let r = entity.header.rotation;
            entity.header.rotation = Vec3::new(yaw.unwrap_or(r.x), pitch.unwrap_or(r.y), r.z);
        }
        if let (Some(seq), Some(p)) = (seq, entity.as_player_mut()) {
            p.last_input_seq = p.last_input_seq.max(seq);
        }
    }
    game.entities.touch(id);
    if let Some((player_id, _)) = session.player() {
        game.services.registry.update_position(player_id, resolved);
    }

    if let Some(c) = contact.filter(|c| c.collided && c.kind != Some(BodyKind::Trigger)) {
        session.send(&json!({
            "type": "collision_event",
            "entity_id": id,
            "position": resolved,
            "normal": c.normal,
            "penetration": c.penetration,
            "collided_with": c.collided_with,
            "kind": c.kind,
            "timestamp": now_millis(),
        }));
    }

    let rotation = game.entities.get(id).map_or(Vec3::ZERO, |e| e.header.rotation);
    game.services.sessions.broadcast_to_nearby(
        &game.entities,
        resolved,
        interest,
        &json!({
            "type": "player_moved",
            "entity_id": id,
            "x": resolved.x,
            "y": resolved.y,
            "z": resolved.z,
            "rotation": { "yaw": rotation.x, "pitch": rotation.y },
            "seq": seq,
            "timestamp": now_millis(),
        }),
        None,
    );
    game.publish(GameEvent::PlayerMove { entity_id: id, position: resolved });
    game.auto_collect(id);
    Ok(())
}

// ── Combat & interaction ────────────────────────────────────────────────

pub fn attack(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let target_id = u64_field(body, "target_id")?;
    if target_id == id {
        return Err(ProtocolError::bad_request("Cannot attack yourself"));
    }
    let (pos, damage) = {
        let me = game.entities.get(id).ok_or_else(ProtocolError::not_authenticated)?;
        (me.position(), me.stats().map_or(0.0, |s| s.attack))
    };
    let target = game.entities.get(target_id).ok_or_else(|| ProtocolError::not_found("Target not found"))?;
    match &target.body {
        EntityBody::Npc(npc) if npc.owner_id == Some(id) => {
            return Err(ProtocolError::bad_request("Cannot attack your own familiar"));
        }
        EntityBody::Npc(_) | EntityBody::Player(_) => {}
        _ => return Err(ProtocolError::bad_request("Target cannot be attacked")),
    }
    if !target.is_alive() {
        return Err(ProtocolError::bad_request("Target is already dead"));
    }
    if target.position().distance(pos) > MELEE_RANGE {
        return Err(ProtocolError::bad_request("Target out of range"));
    }
    game.strike(id, target_id, damage)
        .map(|_| ())
        .ok_or_else(|| ProtocolError::bad_request("Target cannot be attacked"))
}

pub fn interact(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let target_id = u64_field(body, "target_id")?;
    let kind = game
        .entities
        .get(target_id)
        .map(Entity::kind)
        .ok_or_else(|| ProtocolError::not_found("Target not found"))?;
    match kind {
        EntityKind::Item => {
            let reply = game.collect_item(id, target_id)?;
            session.send(&reply);
            Ok(())
        }
        EntityKind::Npc => talk_to(game, session, id, target_id),
        _ => Err(ProtocolError::bad_request("Nothing to interact with")),
    }
}

pub fn npc_interaction(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let npc_id = u64_field(body, "npc_id")?;
    talk_to(game, session, id, npc_id)
}

fn talk_to(game: &mut GameState, session: &Session, player: EntityId, npc_id: EntityId) -> HandlerResult {
    let pos = game.entities.get(player).map(Entity::position).ok_or_else(ProtocolError::not_authenticated)?;
    let entity = game.entities.get(npc_id).ok_or_else(|| ProtocolError::not_found("NPC not found"))?;
    let npc = entity.as_npc().ok_or_else(|| ProtocolError::bad_request("Target is not an NPC"))?;
    if entity.position().distance(pos) > TALK_RANGE {
        return Err(ProtocolError::bad_request("NPC out of range"));
    }
    if npc.npc_type.is_hostile() {
        return Err(ProtocolError::bad_request("NPC is hostile"));
    }
    let (greeting, services) =
        npc.npc_type.dialogue().ok_or_else(|| ProtocolError::bad_request("NPC has nothing to say"))?;
    session.send(&json!({
        "type": "npc_dialogue",
        "npc_id": npc_id,
        "npc_type": npc.npc_type.as_str(),
        "greeting": greeting,
        "services": services,
    }));
    Ok(())
}

pub fn familiar_command(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let familiar_id = u64_field(body, "familiar_id")?;
    let name = str_field(body, "command")?.to_ascii_lowercase();

    let entity = game.entities.get(familiar_id).ok_or_else(|| ProtocolError::not_found("Familiar not found"))?;
    let here = entity.position();
    let npc = entity
        .as_npc()
        .filter(|n| n.npc_type.is_familiar())
        .ok_or_else(|| ProtocolError::bad_request("Not a familiar"))?;
    if npc.owner_id != Some(id) {
        return Err(ProtocolError::forbidden("Familiar not owned by you"));
    }

    let command = match name.as_str() {
        "follow" => FamiliarCommand::Follow,
        "attack" => {
            let target = u64_field(body, "target_id")?;
            if target == id || !game.entities.get(target).is_some_and(Entity::is_alive) {
                return Err(ProtocolError::not_found("Target not found"));
            }
            FamiliarCommand::Attack { target }
        }
        "patrol" => {
            let center = vec3_object(body, "center")?.unwrap_or(here);
            let radius = opt_f32_field(body, "radius")?.unwrap_or(DEFAULT_PATROL_RADIUS).clamp(1.0, 50.0);
            FamiliarCommand::Patrol { center, radius }
        }
        "idle" | "stay" => FamiliarCommand::Idle,
        other => return Err(ProtocolError::bad_request(format!("Unknown familiar command: {}", other))),
    };

    if let Some(npc) = game.entities.get_mut(familiar_id).and_then(Entity::as_npc_mut) {
        npc.command = Some(command);
        match command {
            FamiliarCommand::Follow => {
                npc.target_id = None;
                npc.state = NpcState::Follow;
            }
            FamiliarCommand::Attack { target } => {
                npc.target_id = Some(target);
                npc.state = NpcState::Chase;
            }
            FamiliarCommand::Patrol { center, radius } => {
                npc.target_id = None;
                npc.patrol_center = center;
                npc.patrol_radius = radius;
                npc.state = NpcState::Patrol;
            }
            FamiliarCommand::Idle => {
                npc.target_id = None;
                npc.state = NpcState::Idle;
            }
        }
    }
    game.entities.touch(familiar_id);
    session.send(&success("command_accepted", Some(json!({ "familiar_id": familiar_id, "command": name }))));
    Ok(())
}

pub fn chat(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let message: String = str_field(body, "message")?.trim().chars().take(MAX_CHAT_LEN).collect();
    if message.is_empty() {
        return Err(ProtocolError::bad_request("Empty chat message"));
    }
    let username = game
        .entities
        .get(id)
        .and_then(Entity::as_player)
        .map(|p| p.username.clone())
        .unwrap_or_default();
    game.services.sessions.broadcast_to_group(
        crate::net::sessions::GROUP_AUTHENTICATED,
        &json!({
            "type": "chat_message",
            "entity_id": id,
            "username": username,
            "message": message,
            "timestamp": now_millis(),
        }),
    );
    game.publish(GameEvent::Chat { entity_id: id, username, message });
    Ok(())
}

// ── World ───────────────────────────────────────────────────────────────

pub fn world_chunk_request(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let x = i32_field(body, "chunkX")?;
    let z = i32_field(body, "chunkZ")?;
    let raw = i64_field(body, "lod")?;
    let lod = u8::try_from(raw)
        .ok()
        .and_then(Lod::from_ordinal)
        .ok_or_else(|| ProtocolError::bad_request(format!("Invalid lod {}", raw)))?;

    let request = game.services.streamer.request_chunk(x, z, lod);
    let session = Arc::clone(session);
    tokio::spawn(async move {
        match request.await {
            Ok(handle) => {
                let reply = {
                    let chunk = handle.read().expect("chunk poisoned");
                    chunk_response(&chunk, x, z, lod)
                };
                session.send(&reply);
            }
            Err(e) => {
                tracing::debug!("Chunk ({}, {}) request from session {} failed: {}", x, z, session.id(), e);
                session.send(&error_envelope(&ProtocolError::not_found(format!(
                    "Chunk ({}, {}) unavailable: {}",
                    x, z, e
                ))));
            }
        }
    });
    Ok(())
}

/// The streamer may answer with a finer LOD than asked for; the reply echoes
/// the request.
fn chunk_response(chunk: &WorldChunk, x: i32, z: i32, lod: Lod) -> Value {
    let mesh = chunk.mesh();
    json!({
        "type": "world_chunk_response",
        "chunkX": x,
        "chunkZ": z,
        "lod": lod.ordinal(),
        "vertices": mesh.flat_positions(),
        "triangles": mesh.flat_indices(),
        "biome": chunk.biome().as_i32(),
    })
}

pub fn collision_check(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let pos = position_fields(body)?;
    let radius = opt_f32_field(body, "radius")?.unwrap_or(game.services.config.game.player_radius);
    if !(0.0..=MAX_QUERY_RADIUS).contains(&radius) {
        return Err(ProtocolError::bad_request("Radius out of range"));
    }
    let result = game.services.collision.check_collision(pos, radius, Some(id));
    let result = serde_json::to_value(result).map_err(|e| ProtocolError::internal(e.to_string()))?;
    session.send(&json!({ "type": "collision_result", "position": pos, "radius": radius, "result": result }));
    Ok(())
}

pub fn block_update(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let (x, y, z) = (i64_field(body, "x")?, i64_field(body, "y")?, i64_field(body, "z")?);
    let block = match body.get("block") {
        Some(Value::String(name)) => BlockType::from_name(&name.to_ascii_lowercase()),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|raw| u8::try_from(raw).ok())
            .map(BlockType::from_u8)
            .filter(|b| n.as_u64() == Some(u64::from(b.as_u8()))),
        _ => return Err(ProtocolError::missing_field("block")),
    }
    .ok_or_else(|| ProtocolError::bad_request("Unknown block type"))?;

    let pos = game.entities.get(id).map(Entity::position).ok_or_else(ProtocolError::not_authenticated)?;
    let center = Vec3::new(x as f32 + 0.5, y as f32 + 0.5, z as f32 + 0.5);
    if center.distance(pos) > BLOCK_REACH {
        return Err(ProtocolError::bad_request("Block out of reach"));
    }
    let Some((chunk_pos, _)) = LocalBlockPos::from_world(x, y, z) else {
        return Err(ProtocolError::bad_request("Block position out of range"));
    };
    let handle = game
        .services
        .world
        .set_block(x, y, z, block)
        .ok_or_else(|| ProtocolError::not_found("Chunk not loaded"))?;
    {
        let chunk = handle.read().expect("chunk poisoned");
        game.services.collision.register_chunk(&chunk);
        game.services.store.mark_dirty(chunk.key());
    }
    tracing::debug!("Entity {} set block ({}, {}, {}) in {:?} to {:?}", id, x, y, z, chunk_pos, block);

    let radius = game.services.config.game.interest_radius;
    game.services.sessions.broadcast_to_nearby(
        &game.entities,
        center,
        radius,
        &json!({
            "type": "block_changed",
            "x": x,
            "y": y,
            "z": z,
            "block": block.as_u8(),
            "entity_id": id,
            "timestamp": now_millis(),
        }),
        None,
    );
    session.send(&success("block_updated", Some(json!({ "x": x, "y": y, "z": z, "block": block.as_u8() }))));
    Ok(())
}

// ── Entities ────────────────────────────────────────────────────────────

pub fn entity_spawn_request(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let kind = str_field(body, "kind")?.to_ascii_lowercase();
    let mut pos = position_fields(body)?;
    let (origin, attack) = {
        let me = game.entities.get(id).ok_or_else(ProtocolError::not_authenticated)?;
        (me.position(), me.stats().map_or(0.0, |s| s.attack))
    };
    if pos.distance(origin) > SPAWN_RANGE {
        return Err(ProtocolError::bad_request("Spawn position out of range"));
    }

    let spawned = match kind.as_str() {
        "npc" | "familiar" => {
            let npc_type: NpcType = str_field(body, "npc_type")?.parse().map_err(ProtocolError::bad_request)?;
            if npc_type.is_hostile() || (kind == "familiar" && !npc_type.is_familiar()) {
                return Err(ProtocolError::bad_request("forbidden spawn type"));
            }
            if let Some(ground) = game.services.world.surface_height(pos.x, pos.z) {
                pos.y = pos.y.max(ground);
            }
            let npc = if npc_type.is_familiar() {
                if game.entities.by_owner(id).len() >= FAMILIAR_LIMIT {
                    return Err(ProtocolError::bad_request("Familiar limit reached"));
                }
                Npc::familiar(npc_type, id, pos)
            } else {
                Npc::new(npc_type, 1, pos)
            };
            game.entities.create(pos, npc_type.radius(), EntityBody::Npc(npc))
        }
        "projectile" => {
            let start = origin + Vec3::UP;
            let dir = (pos - start).normalized();
            if dir.length_sq() == 0.0 {
                return Err(ProtocolError::bad_request("Projectile needs a direction"));
            }
            let projectile =
                EntityBody::Projectile(Projectile { owner_id: id, damage: attack, lifetime: PROJECTILE_LIFETIME });
            let pid = game.entities.create(start, PROJECTILE_RADIUS, projectile);
            if let Some(e) = game.entities.get_mut(pid) {
                e.header.velocity = dir * PROJECTILE_SPEED;
            }
            pid
        }
        _ => return Err(ProtocolError::bad_request("forbidden spawn type")),
    };
    tracing::debug!("Entity {} spawned {} {}", id, kind, spawned);
    session.send(&success("entity_spawned", Some(json!({ "entity_id": spawned, "kind": kind }))));
    Ok(())
}

pub fn nearby_entities(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let id = game.player_entity(session)?;
    let radius = match opt_f32_field(body, "radius")? {
        Some(r) if r < 0.0 => return Err(ProtocolError::bad_request("Radius out of range")),
        Some(r) => r.min(MAX_QUERY_RADIUS),
        None => game.services.config.game.interest_radius,
    };
    let pos = game.entities.get(id).map(Entity::position).ok_or_else(ProtocolError::not_authenticated)?;
    let entities: Vec<Value> = game
        .entities
        .in_radius(pos, radius, None)
        .into_iter()
        .filter(|e| *e != id)
        .filter_map(|e| game.entities.snapshot(e))
        .collect();
    session.send(&json!({
        "type": "nearby_entities",
        "radius": radius,
        "count": entities.len(),
        "entities": entities,
    }));
    Ok(())
}

// ── Groups ──────────────────────────────────────────────────────────────

pub fn join_group(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let group = str_field(body, "group")?;
    game.services.sessions.join_group(session.id(), group)?;
    session.send(&success("joined_group", Some(json!({ "group": group }))));
    Ok(())
}

pub fn leave_group(game: &mut GameState, session: &Arc<Session>, body: &Map<String, Value>) -> HandlerResult {
    let group = str_field(body, "group")?;
    game.services.sessions.leave_group(session.id(), group)?;
    session.send(&success("left_group", Some(json!({ "group": group }))));
    Ok(())
}

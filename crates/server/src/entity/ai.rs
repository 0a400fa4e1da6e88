//! Per-tick NPC behaviour.
//!
//! Each NPC is evaluated against a read-only view of the entity set, then its
//! new state and position are written back. Attacks are returned as events so
//! the caller can resolve damage against whichever entity kind was hit.

use worldcore_engine::world::position::Vec3;

use super::npc::{FamiliarCommand, Npc, NpcState};
use super::{EntityId, EntityKind, EntityManager};

pub const IDLE_PATROL_SECS: f32 = 5.0;
pub const ATTACK_COOLDOWN_SECS: f32 = 1.0;
pub const FLEE_HEALTH_FRACTION: f32 = 0.3;
/// A familiar closer than this to its owner stops following.
const FOLLOW_DISTANCE: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AiConfig {
    pub flee_threat_threshold: f32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self { flee_threat_threshold: 50.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AiEvent {
    Attack { attacker: EntityId, target: EntityId, damage: f32 },
}

/// Next-state values computed from a read-only view.
struct Brain {
    state: NpcState,
    target: Option<EntityId>,
    command: Option<FamiliarCommand>,
    idle_time: f32,
    cooldown: f32,
    patrol_angle: f32,
    velocity: Vec3,
    calm: bool,
}

/// Advance every NPC by `dt` seconds.
pub fn tick(
    entities: &mut EntityManager,
    dt: f32,
    config: &AiConfig,
    surface: impl Fn(f32, f32) -> Option<f32>,
) -> Vec<AiEvent> {
    let mut events = Vec::new();
    for id in entities.ids_of_kind(EntityKind::Npc) {
        let Some(entity) = entities.get(id) else {
            continue;
        };
        let Some(npc) = entity.as_npc() else {
            continue;
        };
        if npc.stats.is_dead() {
            continue;
        }
        let pos = entity.position();
        let brain = think(id, npc, pos, dt, config, entities, &mut events);

        let mut new_pos = pos + brain.velocity * dt;
        if let Some(ground) = surface(new_pos.x, new_pos.z) {
            new_pos.y = ground;
        }

        let Some(entity) = entities.get_mut(id) else {
            continue;
        };
        entity.header.velocity = brain.velocity;
        if brain.velocity.x != 0.0 || brain.velocity.z != 0.0 {
            entity.header.rotation.x = brain.velocity.x.atan2(brain.velocity.z).to_degrees();
        }
        let Some(npc) = entity.as_npc_mut() else {
            continue;
        };
        let changed = npc.state != brain.state || npc.target_id != brain.target;
        npc.state = brain.state;
        npc.target_id = brain.target;
        npc.command = brain.command;
        npc.idle_time = brain.idle_time;
        npc.attack_cooldown = brain.cooldown;
        npc.patrol_angle = brain.patrol_angle;
        if brain.calm {
            npc.threat_map.clear();
        }
        if changed {
            entities.touch(id);
        }
        entities.move_entity(id, new_pos);
    }
    events
}

fn alive_position(entities: &EntityManager, id: EntityId) -> Option<Vec3> {
    entities
        .get(id)
        .filter(|e| e.is_alive() && matches!(e.kind(), EntityKind::Player | EntityKind::Npc))
        .map(|e| e.position())
}

fn nearest_player(entities: &EntityManager, pos: Vec3, range: f32) -> Option<EntityId> {
    entities
        .in_radius(pos, range, Some(EntityKind::Player))
        .into_iter()
        .filter_map(|id| alive_position(entities, id).map(|p| (id, p.distance_sq(pos))))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id)
}

fn toward(from: Vec3, to: Vec3, speed: f32) -> Vec3 {
    Vec3::new(to.x - from.x, 0.0, to.z - from.z).normalized() * speed
}

fn think(
    id: EntityId,
    npc: &Npc,
    pos: Vec3,
    dt: f32,
    config: &AiConfig,
    entities: &EntityManager,
    events: &mut Vec<AiEvent>,
) -> Brain {
    let mut b = Brain {
        state: npc.state,
        target: npc.target_id,
        command: npc.command,
        idle_time: npc.idle_time,
        cooldown: (npc.attack_cooldown - dt).max(0.0),
        patrol_angle: npc.patrol_angle,
        velocity: Vec3::ZERO,
        calm: false,
    };
    let speed = npc.stats.speed;
    let hostile = npc.npc_type.is_hostile();

    if npc.stats.health_fraction() < FLEE_HEALTH_FRACTION && npc.total_threat() > config.flee_threat_threshold {
        b.state = NpcState::Flee;
    }

    let mut patrol = (npc.patrol_center, npc.patrol_radius);
    if b.state != NpcState::Flee
        && let (Some(owner), Some(command)) = (npc.owner_id, b.command)
    {
        match command {
            FamiliarCommand::Follow => {
                b.target = None;
                b.state = NpcState::Follow;
                match alive_position(entities, owner) {
                    Some(owner_pos) if owner_pos.distance_xz(pos) > FOLLOW_DISTANCE => {
                        b.velocity = toward(pos, owner_pos, speed);
                    }
                    Some(_) => {}
                    None => b.state = NpcState::Idle,
                }
                return b;
            }
            FamiliarCommand::Attack { target } => {
                b.target = Some(target);
                if !matches!(b.state, NpcState::Chase | NpcState::Combat) {
                    b.state = NpcState::Chase;
                }
            }
            FamiliarCommand::Patrol { center, radius } => {
                b.state = NpcState::Patrol;
                patrol = (center, radius);
            }
            FamiliarCommand::Idle => {
                b.state = NpcState::Idle;
                b.target = None;
                return b;
            }
        }
    }

    match b.state {
        NpcState::Idle | NpcState::Follow => {
            b.idle_time += dt;
            if let Some(seen) = hostile.then(|| nearest_player(entities, pos, npc.detection_range)).flatten() {
                b.target = Some(seen);
                b.state = NpcState::Chase;
                b.idle_time = 0.0;
            } else if b.idle_time > IDLE_PATROL_SECS {
                b.state = NpcState::Patrol;
                b.idle_time = 0.0;
            } else {
                b.state = NpcState::Idle;
            }
        }
        NpcState::Patrol => {
            if let Some(seen) = hostile.then(|| nearest_player(entities, pos, npc.detection_range)).flatten() {
                b.target = Some(seen);
                b.state = NpcState::Chase;
            } else {
                let (center, radius) = patrol;
                let radius = radius.max(1.0);
                b.patrol_angle = (b.patrol_angle + speed * dt / radius) % std::f32::consts::TAU;
                let goal = Vec3::new(
                    center.x + radius * b.patrol_angle.cos(),
                    pos.y,
                    center.z + radius * b.patrol_angle.sin(),
                );
                b.velocity = toward(pos, goal, speed);
            }
        }
        NpcState::Chase | NpcState::Combat => {
            match b.target.and_then(|t| alive_position(entities, t)) {
                None => lose_target(&mut b, npc),
                Some(tp) => {
                    let d = tp.distance_xz(pos);
                    if d > npc.detection_range * 2.0 {
                        lose_target(&mut b, npc);
                    } else if d > npc.attack_range {
                        b.state = NpcState::Chase;
                        b.velocity = toward(pos, tp, speed);
                    } else {
                        b.state = NpcState::Combat;
                        if b.cooldown <= 0.0
                            && let Some(target) = b.target
                        {
                            events.push(AiEvent::Attack { attacker: id, target, damage: npc.stats.attack });
                            b.cooldown = ATTACK_COOLDOWN_SECS;
                        }
                    }
                }
            }
        }
        NpcState::Flee => {
            let threat = npc.top_threat().or(b.target).and_then(|t| alive_position(entities, t));
            match threat {
                Some(tp) if tp.distance_xz(pos) <= npc.detection_range * 2.0 => {
                    let away = Vec3::new(pos.x - tp.x, 0.0, pos.z - tp.z);
                    let dir = if away.length_sq() > 0.0 { away } else { Vec3::new(1.0, 0.0, 0.0) };
                    b.velocity = dir.normalized() * speed;
                }
                _ => {
                    b.state = NpcState::Idle;
                    b.target = None;
                    b.idle_time = 0.0;
                    b.calm = true;
                }
            }
        }
    }
    b
}

fn lose_target(b: &mut Brain, npc: &Npc) {
    b.target = None;
    b.idle_time = 0.0;
    if npc.owner_id.is_some() && matches!(b.command, Some(FamiliarCommand::Attack { .. })) {
        b.command = Some(FamiliarCommand::Follow);
        b.state = NpcState::Follow;
    } else {
        b.state = NpcState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::npc::NpcType;
    use crate::entity::{EntityBody, Player, Stats};
    use std::sync::Arc;
    use worldcore_engine::collision::CollisionSystem;

    fn manager() -> EntityManager {
        EntityManager::new(Arc::new(CollisionSystem::new()))
    }

    fn player(m: &mut EntityManager, pos: Vec3) -> EntityId {
        m.create(
            pos,
            0.5,
            EntityBody::Player(Player {
                session_id: 1,
                player_id: 1,
                username: "p".into(),
                stats: Stats {
                    health: 100.0,
                    max_health: 100.0,
                    attack: 10.0,
                    defense: 5.0,
                    speed: 5.0,
                    level: 1,
                    experience: 0,
                },
                gold: 0,
                inventory: Vec::new(),
                last_input_seq: 0,
            }),
        )
    }

    fn npc(m: &mut EntityManager, kind: NpcType, pos: Vec3) -> EntityId {
        m.create(pos, 0.5, EntityBody::Npc(Npc::new(kind, 1, pos)))
    }

    fn state(m: &EntityManager, id: EntityId) -> NpcState {
        m.get(id).unwrap().as_npc().unwrap().state
    }

    #[test]
    fn idle_npc_starts_patrolling_after_five_seconds() {
        let mut m = manager();
        let v = npc(&mut m, NpcType::Villager, Vec3::ZERO);
        for _ in 0..4 {
            tick(&mut m, 1.0, &AiConfig::default(), |_, _| None);
        }
        assert_eq!(state(&m, v), NpcState::Idle);
        tick(&mut m, 1.5, &AiConfig::default(), |_, _| None);
        assert_eq!(state(&m, v), NpcState::Patrol);
        tick(&mut m, 0.1, &AiConfig::default(), |_, _| None);
        assert_ne!(m.get(v).unwrap().position(), Vec3::ZERO);
    }

    #[test]
    fn hostile_chases_then_attacks_on_cooldown() {
        let mut m = manager();
        let p = player(&mut m, Vec3::new(5.0, 0.0, 0.0));
        let g = npc(&mut m, NpcType::Goblin, Vec3::ZERO);

        tick(&mut m, 0.1, &AiConfig::default(), |_, _| None);
        assert_eq!(state(&m, g), NpcState::Chase);

        let mut attacks = Vec::new();
        for _ in 0..40 {
            attacks.extend(tick(&mut m, 0.1, &AiConfig::default(), |_, _| None));
        }
        assert_eq!(state(&m, g), NpcState::Combat);
        assert!(m.get(g).unwrap().position().distance_xz(Vec3::new(5.0, 0.0, 0.0)) <= 1.5);
        assert!(!attacks.is_empty());
        assert!(attacks.iter().all(|AiEvent::Attack { attacker, target, .. }| *attacker == g && *target == p));
        // 4 s of simulated time with a 1 s cooldown allows at most 4 swings.
        assert!(attacks.len() <= 4);
    }

    #[test]
    fn badly_hurt_npc_flees_from_its_attacker() {
        let mut m = manager();
        let p = player(&mut m, Vec3::new(2.0, 0.0, 0.0));
        let o = npc(&mut m, NpcType::Orc, Vec3::ZERO);
        {
            let orc = m.get_mut(o).unwrap().as_npc_mut().unwrap();
            orc.stats.health = 20.0;
            orc.threat_map.insert(p, 130.0);
        }
        tick(&mut m, 0.5, &AiConfig::default(), |_, _| None);
        assert_eq!(state(&m, o), NpcState::Flee);
        assert!(m.get(o).unwrap().position().x < 0.0);
    }

    #[test]
    fn familiar_follows_owner_and_npcs_hug_terrain() {
        let mut m = manager();
        let owner = player(&mut m, Vec3::new(20.0, 0.0, 0.0));
        let wolf = m.create(Vec3::ZERO, 0.5, EntityBody::Npc(Npc::familiar(NpcType::Wolf, owner, Vec3::ZERO)));
        tick(&mut m, 1.0, &AiConfig::default(), |_, _| Some(7.0));
        let pos = m.get(wolf).unwrap().position();
        assert_eq!(state(&m, wolf), NpcState::Follow);
        assert!((pos.x - 5.0).abs() < 1e-4);
        assert_eq!(pos.y, 7.0);
    }

    #[test]
    fn familiar_returns_to_owner_when_attack_target_dies() {
        let mut m = manager();
        let owner = player(&mut m, Vec3::new(1.0, 0.0, 0.0));
        let slime = npc(&mut m, NpcType::Slime, Vec3::new(0.0, 0.0, 30.0));
        let mut cat = Npc::familiar(NpcType::Cat, owner, Vec3::ZERO);
        cat.command = Some(FamiliarCommand::Attack { target: slime });
        let cat = m.create(Vec3::ZERO, 0.4, EntityBody::Npc(cat));

        tick(&mut m, 0.1, &AiConfig::default(), |_, _| None);
        assert_eq!(state(&m, cat), NpcState::Chase);
        m.destroy(slime);
        tick(&mut m, 0.1, &AiConfig::default(), |_, _| None);
        let npc = m.get(cat).unwrap().as_npc().unwrap();
        assert_eq!(npc.state, NpcState::Follow);
        assert_eq!(npc.command, Some(FamiliarCommand::Follow));
    }
}

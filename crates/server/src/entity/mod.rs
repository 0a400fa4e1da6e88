//! Authoritative entity records.
//!
//! The [`EntityManager`] is the single owner of every entity. The spatial grid
//! and the collision system only ever see ids; both are kept in step by
//! [`EntityManager::create`], [`EntityManager::move_entity`] and
//! [`EntityManager::destroy`]. Only the game loop mutates this state.

pub mod ai;
pub mod loot;
pub mod mobs;
pub mod npc;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};
use worldcore_engine::collision::{BodyKind, CollisionSystem};
use worldcore_engine::spatial::{DEFAULT_CELL_SIZE, SpatialGrid};
use worldcore_engine::world::position::{ChunkPos, Vec3};

use crate::net::session::SessionId;
use crate::persistence::InventoryItem;
use loot::Rarity;
use npc::Npc;

pub use worldcore_engine::spatial::EntityId;

/// Seconds a dropped item stays on the ground.
pub const ITEM_LIFETIME_SECS: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Player,
    Npc,
    Item,
    Projectile,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Npc => "npc",
            EntityKind::Item => "item",
            EntityKind::Projectile => "projectile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
    pub health: f32,
    pub max_health: f32,
    pub attack: f32,
    pub defense: f32,
    pub speed: f32,
    pub level: u32,
    pub experience: u64,
}

impl Stats {
    pub fn is_dead(&self) -> bool {
        self.health <= 0.0
    }

    pub fn health_fraction(&self) -> f32 {
        if self.max_health <= 0.0 {
            0.0
        } else {
            self.health / self.max_health
        }
    }
}

/// Fields every entity carries.
#[derive(Debug, Clone)]
pub struct EntityHeader {
    pub id: EntityId,
    pub position: Vec3,
    /// Yaw, pitch and roll in degrees.
    pub rotation: Vec3,
    pub velocity: Vec3,
    pub radius: f32,
    pub chunk: ChunkPos,
    /// Bumped on every replicated change.
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct Player {
    pub session_id: SessionId,
    pub player_id: u64,
    pub username: String,
    pub stats: Stats,
    pub gold: u64,
    pub inventory: Vec<InventoryItem>,
    pub last_input_seq: u64,
}

impl Player {
    /// XP needed to go from the current level to the next.
    pub fn xp_to_next_level(&self) -> u64 {
        self.stats.level as u64 * 100
    }

    /// Add XP, applying as many level-ups as it pays for. Returns the number
    /// of levels gained.
    pub fn gain_experience(&mut self, xp: u64) -> u32 {
        self.stats.experience += xp;
        let mut gained = 0;
        while self.stats.experience >= self.xp_to_next_level() {
            self.stats.experience -= self.xp_to_next_level();
            self.stats.level += 1;
            self.stats.max_health += 10.0;
            self.stats.attack += 2.0;
            self.stats.health = self.stats.max_health;
            gained += 1;
        }
        gained
    }

    pub fn add_item(&mut self, item_id: &str, quantity: u32, rarity: Rarity) {
        match self
            .inventory
            .iter_mut()
            .find(|i| i.item_id == item_id && i.rarity == rarity)
        {
            Some(slot) => slot.quantity += quantity,
            None => self.inventory.push(InventoryItem { item_id: item_id.to_string(), quantity, rarity }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Item {
    pub item_id: String,
    pub quantity: u32,
    pub rarity: Rarity,
    /// Gold carried by the pickup, paid on collection.
    pub gold: u64,
    pub expires_at: f64,
}

#[derive(Debug, Clone)]
pub struct Projectile {
    pub owner_id: EntityId,
    pub damage: f32,
    /// Seconds left before the projectile disappears.
    pub lifetime: f32,
}

#[derive(Debug, Clone)]
pub enum EntityBody {
    Player(Player),
    Npc(Npc),
    Item(Item),
    Projectile(Projectile),
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub header: EntityHeader,
    pub body: EntityBody,
}

impl Entity {
    pub fn id(&self) -> EntityId {
        self.header.id
    }

    pub fn position(&self) -> Vec3 {
        self.header.position
    }

    pub fn kind(&self) -> EntityKind {
        match self.body {
            EntityBody::Player(_) => EntityKind::Player,
            EntityBody::Npc(_) => EntityKind::Npc,
            EntityBody::Item(_) => EntityKind::Item,
            EntityBody::Projectile(_) => EntityKind::Projectile,
        }
    }

    pub fn as_player(&self) -> Option<&Player> {
        match &self.body {
            EntityBody::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut Player> {
        match &mut self.body {
            EntityBody::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_npc(&self) -> Option<&Npc> {
        match &self.body {
            EntityBody::Npc(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_npc_mut(&mut self) -> Option<&mut Npc> {
        match &mut self.body {
            EntityBody::Npc(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_item(&self) -> Option<&Item> {
        match &self.body {
            EntityBody::Item(i) => Some(i),
            _ => None,
        }
    }

    pub fn stats(&self) -> Option<&Stats> {
        match &self.body {
            EntityBody::Player(p) => Some(&p.stats),
            EntityBody::Npc(n) => Some(&n.stats),
            _ => None,
        }
    }

    pub fn stats_mut(&mut self) -> Option<&mut Stats> {
        match &mut self.body {
            EntityBody::Player(p) => Some(&mut p.stats),
            EntityBody::Npc(n) => Some(&mut n.stats),
            _ => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.stats().is_none_or(|s| !s.is_dead())
    }

    /// Wire form used by `entity_update`, `nearby_entities` and spawn notices.
    pub fn snapshot(&self) -> Value {
        let h = &self.header;
        let mut v = json!({
            "id": h.id,
            "kind": self.kind().as_str(),
            "x": h.position.x,
            "y": h.position.y,
            "z": h.position.z,
            "rotation": { "yaw": h.rotation.x, "pitch": h.rotation.y, "roll": h.rotation.z },
            "velocity": { "x": h.velocity.x, "y": h.velocity.y, "z": h.velocity.z },
            "radius": h.radius,
            "version": h.version,
        });
        match &self.body {
            EntityBody::Player(p) => {
                v["player_id"] = json!(p.player_id);
                v["username"] = json!(p.username);
                v["health"] = json!(p.stats.health);
                v["max_health"] = json!(p.stats.max_health);
                v["level"] = json!(p.stats.level);
            }
            EntityBody::Npc(n) => {
                v["npc_type"] = json!(n.npc_type.as_str());
                v["state"] = json!(n.state.as_str());
                v["health"] = json!(n.stats.health);
                v["max_health"] = json!(n.stats.max_health);
                v["level"] = json!(n.stats.level);
                v["owner_id"] = json!(n.owner_id);
                v["hostile"] = json!(n.npc_type.is_hostile());
            }
            EntityBody::Item(i) => {
                v["item_id"] = json!(i.item_id);
                v["quantity"] = json!(i.quantity);
                v["rarity"] = json!(i.rarity);
                v["gold"] = json!(i.gold);
            }
            EntityBody::Projectile(p) => {
                v["owner_id"] = json!(p.owner_id);
            }
        }
        v
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub players: usize,
    pub npcs: usize,
    pub items: usize,
    pub projectiles: usize,
}

pub struct EntityManager {
    entities: IndexMap<EntityId, Entity>,
    next_id: EntityId,
    grid: SpatialGrid,
    collision: Arc<CollisionSystem>,
    by_chunk: HashMap<ChunkPos, HashSet<EntityId>>,
}

impl EntityManager {
    pub fn new(collision: Arc<CollisionSystem>) -> Self {
        Self::with_cell_size(collision, DEFAULT_CELL_SIZE)
    }

    pub fn with_cell_size(collision: Arc<CollisionSystem>, cell_size: f32) -> Self {
        Self {
            entities: IndexMap::new(),
            next_id: 1,
            grid: SpatialGrid::new(cell_size),
            collision,
            by_chunk: HashMap::new(),
        }
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    /// Register a new entity and mirror it into the grid and collision system.
    /// Ids start at 1 and are never reused.
    pub fn create(&mut self, position: Vec3, radius: f32, body: EntityBody) -> EntityId {
        let id = self.next_id;
        self.next_id += 1;
        let chunk = position.chunk();
        let entity = Entity {
            header: EntityHeader {
                id,
                position,
                rotation: Vec3::ZERO,
                velocity: Vec3::ZERO,
                radius,
                chunk,
                version: 1,
            },
            body,
        };
        if let Some(kind) = body_kind(&entity.body) {
            self.collision.register_entity(id, position, radius, kind);
        }
        self.grid.insert(id, position);
        self.by_chunk.entry(chunk).or_default().insert(id);
        self.entities.insert(id, entity);
        id
    }

    /// Remove an entity from the manager and every mirror.
    pub fn destroy(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.swap_remove(&id)?;
        self.grid.remove(id, entity.header.position);
        self.collision.unregister_entity(id);
        if let Some(set) = self.by_chunk.get_mut(&entity.header.chunk) {
            set.remove(&id);
            if set.is_empty() {
                self.by_chunk.remove(&entity.header.chunk);
            }
        }
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Mutable access. Callers that change replicated state must call
    /// [`touch`](Self::touch) afterwards.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Mark an entity changed so replication resends it.
    pub fn touch(&mut self, id: EntityId) {
        if let Some(e) = self.entities.get_mut(&id) {
            e.header.version += 1;
        }
    }

    /// Move an entity, updating its grid cell, collision sphere and chunk
    /// membership. Returns false for unknown ids.
    pub fn move_entity(&mut self, id: EntityId, new_pos: Vec3) -> bool {
        let Some(entity) = self.entities.get_mut(&id) else {
            return false;
        };
        let old_pos = entity.header.position;
        if old_pos == new_pos {
            return true;
        }
        entity.header.position = new_pos;
        entity.header.version += 1;
        let old_chunk = entity.header.chunk;
        let new_chunk = new_pos.chunk();
        entity.header.chunk = new_chunk;

        self.grid.move_entity(id, old_pos, new_pos);
        self.collision.update_entity(id, new_pos);
        if old_chunk != new_chunk {
            if let Some(set) = self.by_chunk.get_mut(&old_chunk) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_chunk.remove(&old_chunk);
                }
            }
            self.by_chunk.entry(new_chunk).or_default().insert(id);
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn ids_of_kind(&self, kind: EntityKind) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| e.kind() == kind)
            .map(Entity::id)
            .collect()
    }

    pub fn players(&self) -> impl Iterator<Item = (&EntityHeader, &Player)> {
        self.entities.values().filter_map(|e| match &e.body {
            EntityBody::Player(p) => Some((&e.header, p)),
            _ => None,
        })
    }

    /// NPCs owned by `owner_id` (familiars), ascending by id.
    pub fn by_owner(&self, owner_id: EntityId) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.as_npc().is_some_and(|n| n.owner_id == Some(owner_id)))
            .map(Entity::id)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn in_chunk(&self, x: i32, z: i32) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .by_chunk
            .get(&ChunkPos::new(x, z))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    /// Entities whose position lies within `r` of `pos`, optionally of one
    /// kind, ascending by id.
    pub fn in_radius(&self, pos: Vec3, r: f32, filter: Option<EntityKind>) -> Vec<EntityId> {
        self.grid
            .query_radius(pos, r)
            .into_iter()
            .filter(|id| {
                self.entities.get(id).is_some_and(|e| {
                    e.header.position.distance_sq(pos) <= r * r && filter.is_none_or(|k| e.kind() == k)
                })
            })
            .collect()
    }

    pub fn snapshot(&self, id: EntityId) -> Option<Value> {
        self.entities.get(&id).map(Entity::snapshot)
    }

    pub fn count_by_kind(&self) -> KindCounts {
        let mut counts = KindCounts::default();
        for e in self.entities.values() {
            match e.kind() {
                EntityKind::Player => counts.players += 1,
                EntityKind::Npc => counts.npcs += 1,
                EntityKind::Item => counts.items += 1,
                EntityKind::Projectile => counts.projectiles += 1,
            }
        }
        counts
    }

    /// The player entity bound to a session, if any.
    pub fn player_for_session(&self, session_id: SessionId) -> Option<EntityId> {
        self.players()
            .find(|(_, p)| p.session_id == session_id)
            .map(|(h, _)| h.id)
    }
}

fn body_kind(body: &EntityBody) -> Option<BodyKind> {
    match body {
        EntityBody::Player(_) | EntityBody::Npc(_) => Some(BodyKind::Entity),
        EntityBody::Item(_) => Some(BodyKind::Trigger),
        EntityBody::Projectile(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npc::NpcType;

    fn manager() -> EntityManager {
        EntityManager::new(Arc::new(CollisionSystem::new()))
    }

    fn item() -> EntityBody {
        EntityBody::Item(Item {
            item_id: "gold_coin".into(),
            quantity: 1,
            rarity: Rarity::Common,
            gold: 0,
            expires_at: ITEM_LIFETIME_SECS,
        })
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut m = manager();
        let a = m.create(Vec3::ZERO, 0.3, item());
        let b = m.create(Vec3::ZERO, 0.3, item());
        m.destroy(b);
        let c = m.create(Vec3::ZERO, 0.3, item());
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn mirrors_follow_moves_and_destroy() {
        let collision = Arc::new(CollisionSystem::new());
        let mut m = EntityManager::new(Arc::clone(&collision));
        let id = m.create(Vec3::new(1.0, 0.0, 1.0), 0.5, EntityBody::Npc(Npc::new(NpcType::Goblin, 1, Vec3::ZERO)));
        assert!(collision.has_entity(id));
        assert_eq!(m.in_chunk(0, 0), vec![id]);

        assert!(m.move_entity(id, Vec3::new(40.0, 0.0, 1.0)));
        assert_eq!(m.grid().cell_of(id), Some(m.grid().cell_key(Vec3::new(40.0, 0.0, 1.0))));
        assert!(m.in_chunk(0, 0).is_empty());
        assert_eq!(m.in_chunk(2, 0), vec![id]);
        assert_eq!(m.get(id).unwrap().header.version, 2);

        m.destroy(id);
        assert!(!collision.has_entity(id));
        assert!(m.grid().is_empty());
        assert!(m.in_chunk(2, 0).is_empty());
    }

    #[test]
    fn radius_query_filters_by_distance_and_kind() {
        let mut m = manager();
        let near = m.create(Vec3::new(2.0, 0.0, 0.0), 0.5, EntityBody::Npc(Npc::new(NpcType::Slime, 1, Vec3::ZERO)));
        let _far = m.create(Vec3::new(9.0, 0.0, 0.0), 0.5, EntityBody::Npc(Npc::new(NpcType::Slime, 1, Vec3::ZERO)));
        let loot = m.create(Vec3::new(1.0, 0.0, 0.0), 0.3, item());
        assert_eq!(m.in_radius(Vec3::ZERO, 5.0, None), vec![near, loot]);
        assert_eq!(m.in_radius(Vec3::ZERO, 5.0, Some(EntityKind::Npc)), vec![near]);
    }

    #[test]
    fn familiars_are_found_by_owner() {
        let mut m = manager();
        let mut wolf = Npc::new(NpcType::Wolf, 1, Vec3::ZERO);
        wolf.owner_id = Some(77);
        let w = m.create(Vec3::ZERO, 0.5, EntityBody::Npc(wolf));
        m.create(Vec3::ZERO, 0.5, EntityBody::Npc(Npc::new(NpcType::Cat, 1, Vec3::ZERO)));
        assert_eq!(m.by_owner(77), vec![w]);
        assert_eq!(m.count_by_kind().npcs, 2);
    }

    #[test]
    fn level_ups_consume_experience() {
        let mut p = Player {
            session_id: 1,
            player_id: 1,
            username: "u".into(),
            stats: Stats {
                health: 50.0,
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
        };
        // 100 for level 1 -> 2, 200 for 2 -> 3.
        assert_eq!(p.gain_experience(350), 2);
        assert_eq!(p.stats.level, 3);
        assert_eq!(p.stats.experience, 50);
        assert_eq!(p.stats.max_health, 120.0);
        assert_eq!(p.stats.attack, 14.0);
        assert_eq!(p.stats.health, 120.0);
    }
}

//! Spawn zones and the respawn queue.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use worldcore_engine::world::position::Vec3;

use super::npc::{Npc, NpcType};
use super::{EntityBody, EntityId, EntityManager};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnZoneConfig {
    pub name: String,
    pub center: Vec3,
    pub radius: f32,
    pub npc_type: NpcType,
    pub min_level: u32,
    pub max_level: u32,
    pub max_mobs: usize,
    pub respawn_seconds: f64,
    pub loot_table: String,
}

pub fn default_zones() -> Vec<SpawnZoneConfig> {
    vec![
        SpawnZoneConfig {
            name: "goblin_camp".into(),
            center: Vec3::new(100.0, 0.0, 100.0),
            radius: 50.0,
            npc_type: NpcType::Goblin,
            min_level: 1,
            max_level: 5,
            max_mobs: 8,
            respawn_seconds: 30.0,
            loot_table: "goblin".into(),
        },
        SpawnZoneConfig {
            name: "slime_meadow".into(),
            center: Vec3::new(-80.0, 0.0, 60.0),
            radius: 40.0,
            npc_type: NpcType::Slime,
            min_level: 1,
            max_level: 3,
            max_mobs: 10,
            respawn_seconds: 20.0,
            loot_table: "slime".into(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRespawn {
    pub zone: usize,
    /// Game-clock second at which the mob may spawn.
    pub deadline: f64,
    pub npc_type: NpcType,
    pub level: u32,
}

#[derive(Debug)]
struct ZoneState {
    config: SpawnZoneConfig,
    live: HashSet<EntityId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub name: String,
    pub live: usize,
    pub pending: usize,
    pub max_mobs: usize,
}

pub struct MobController {
    zones: Vec<ZoneState>,
    pending: Vec<PendingRespawn>,
    rng: StdRng,
}

impl MobController {
    pub fn new(zones: Vec<SpawnZoneConfig>, seed: u64) -> Self {
        Self {
            zones: zones.into_iter().map(|config| ZoneState { config, live: HashSet::new() }).collect(),
            pending: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn zone(&self, idx: usize) -> Option<&SpawnZoneConfig> {
        self.zones.get(idx).map(|z| &z.config)
    }

    pub fn pending(&self) -> &[PendingRespawn] {
        &self.pending
    }

    pub fn status(&self) -> Vec<ZoneStatus> {
        self.zones
            .iter()
            .enumerate()
            .map(|(i, z)| ZoneStatus {
                name: z.config.name.clone(),
                live: z.live.len(),
                pending: self.pending.iter().filter(|p| p.zone == i).count(),
                max_mobs: z.config.max_mobs,
            })
            .collect()
    }

    /// Schedule the respawn of a zone mob that just died.
    pub fn on_death(&mut self, zone: usize, id: EntityId, now: f64) {
        let Some(state) = self.zones.get_mut(zone) else {
            return;
        };
        if !state.live.remove(&id) {
            return;
        }
        let level = roll_level(&state.config, &mut self.rng);
        self.pending.push(PendingRespawn {
            zone,
            deadline: now + state.config.respawn_seconds,
            npc_type: state.config.npc_type,
            level,
        });
    }

    /// Top zones up to `max_mobs` and spawn every respawn whose deadline has
    /// passed. `surface` gives the ground height at (x, z) when known.
    pub fn tick(
        &mut self,
        now: f64,
        entities: &mut EntityManager,
        surface: impl Fn(f32, f32) -> Option<f32>,
    ) -> Vec<EntityId> {
        for (i, state) in self.zones.iter_mut().enumerate() {
            // Mobs removed without dying (e.g. destroyed by an admin path).
            state.live.retain(|id| entities.contains(*id));
            let queued = self.pending.iter().filter(|p| p.zone == i).count();
            let missing = state.config.max_mobs.saturating_sub(state.live.len() + queued);
            for _ in 0..missing {
                let level = roll_level(&state.config, &mut self.rng);
                self.pending.push(PendingRespawn { zone: i, deadline: now, npc_type: state.config.npc_type, level });
            }
        }

        let mut due = Vec::new();
        self.pending.retain(|p| {
            if p.deadline <= now {
                due.push(p.clone());
                false
            } else {
                true
            }
        });

        let mut spawned = Vec::with_capacity(due.len());
        for p in due {
            let Some(state) = self.zones.get_mut(p.zone) else {
                continue;
            };
            let pos = random_point_in_disk(state.config.center, state.config.radius, &mut self.rng);
            let y = surface(pos.x, pos.z).unwrap_or(state.config.center.y);
            let pos = Vec3::new(pos.x, y, pos.z);
            let mut npc = Npc::new(p.npc_type, p.level, pos);
            npc.zone = Some(p.zone);
            npc.patrol_radius = (state.config.radius / 4.0).max(2.0);
            let id = entities.create(pos, p.npc_type.radius(), EntityBody::Npc(npc));
            state.live.insert(id);
            spawned.push(id);
        }
        if !spawned.is_empty() {
            tracing::debug!("Spawned {} mobs", spawned.len());
        }
        spawned
    }
}

fn roll_level(config: &SpawnZoneConfig, rng: &mut StdRng) -> u32 {
    let lo = config.min_level.max(1);
    rng.random_range(lo..=config.max_level.max(lo))
}

fn random_point_in_disk(center: Vec3, radius: f32, rng: &mut StdRng) -> Vec3 {
    let angle = rng.random_range(0.0..std::f32::consts::TAU);
    let r = radius.max(0.0) * rng.random::<f32>().sqrt();
    Vec3::new(center.x + r * angle.cos(), center.y, center.z + r * angle.sin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use worldcore_engine::collision::CollisionSystem;

    fn zone(max: usize) -> SpawnZoneConfig {
        SpawnZoneConfig {
            name: "pen".into(),
            center: Vec3::new(10.0, 0.0, 10.0),
            radius: 5.0,
            npc_type: NpcType::Goblin,
            min_level: 2,
            max_level: 4,
            max_mobs: max,
            respawn_seconds: 30.0,
            loot_table: "goblin".into(),
        }
    }

    #[test]
    fn first_tick_fills_every_zone_inside_its_disk() {
        let mut entities = EntityManager::new(Arc::new(CollisionSystem::new()));
        let mut mobs = MobController::new(vec![zone(4)], 1);
        let spawned = mobs.tick(0.0, &mut entities, |_, _| Some(12.0));
        assert_eq!(spawned.len(), 4);
        for id in spawned {
            let e = entities.get(id).unwrap();
            let npc = e.as_npc().unwrap();
            assert!((2..=4).contains(&npc.stats.level));
            assert_eq!(npc.zone, Some(0));
            assert_eq!(e.position().y, 12.0);
            assert!(e.position().distance_xz(Vec3::new(10.0, 0.0, 10.0)) <= 5.0 + 1e-4);
        }
        assert!(mobs.tick(1.0, &mut entities, |_, _| None).is_empty());
    }

    #[test]
    fn death_schedules_respawn_after_zone_delay() {
        let mut entities = EntityManager::new(Arc::new(CollisionSystem::new()));
        let mut mobs = MobController::new(vec![zone(1)], 9);
        let first = mobs.tick(0.0, &mut entities, |_, _| None)[0];

        entities.destroy(first);
        mobs.on_death(0, first, 5.0);
        assert_eq!(mobs.pending()[0].deadline, 35.0);

        assert!(mobs.tick(34.9, &mut entities, |_, _| None).is_empty());
        let again = mobs.tick(35.0, &mut entities, |_, _| None);
        assert_eq!(again.len(), 1);
        assert_ne!(again[0], first);
        assert_eq!(mobs.status()[0].live, 1);
    }
}

//! Damage, death, loot, experience and the item/projectile world step.

use rand::Rng;
use serde_json::{Value, json};
use worldcore_engine::world::position::Vec3;

use super::GameState;
use crate::entity::ai::AiEvent;
use crate::entity::loot::Rarity;
use crate::entity::{Entity, EntityBody, EntityId, EntityKind, ITEM_LIFETIME_SECS, Item};
use crate::error::ProtocolError;
use crate::event_bus::GameEvent;
use crate::persistence::PlayerPatch;
use crate::protocol::now_millis;

/// Reach for melee attacks and item pickup.
pub const MELEE_RANGE: f32 = 3.0;
pub const PICKUP_RANGE: f32 = 3.0;
const ITEM_RADIUS: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageOutcome {
    pub dealt: f32,
    pub health: f32,
    pub dead: bool,
}

impl GameState {
    /// Apply one hit without resolving death. `None` if the target cannot be
    /// damaged.
    pub fn apply_damage(&mut self, attacker: EntityId, target: EntityId, amount: f32) -> Option<DamageOutcome> {
        if attacker == target {
            return None;
        }
        let entity = self.entities.get_mut(target)?;
        if !entity.is_alive() {
            return None;
        }
        let outcome = match &mut entity.body {
            EntityBody::Npc(npc) => {
                let dealt = npc.take_damage(amount, Some(attacker));
                DamageOutcome { dealt, health: npc.stats.health, dead: npc.stats.is_dead() }
            }
            EntityBody::Player(p) => {
                let dealt = (amount - p.stats.defense).max(1.0);
                p.stats.health = (p.stats.health - dealt).max(0.0);
                DamageOutcome { dealt, health: p.stats.health, dead: p.stats.is_dead() }
            }
            EntityBody::Item(_) | EntityBody::Projectile(_) => return None,
        };
        self.entities.touch(target);
        Some(outcome)
    }

    /// Damage `target`, report a `combat_event` to the attacker and to players
    /// near the target, then resolve death.
    pub fn strike(&mut self, attacker: EntityId, target: EntityId, amount: f32) -> Option<DamageOutcome> {
        let outcome = self.apply_damage(attacker, target, amount)?;
        let target_pos = self.entities.get(target).map(Entity::position)?;
        let event = json!({
            "type": "combat_event",
            "attacker_id": attacker,
            "target_id": target,
            "damage": outcome.dealt,
            "target_health": outcome.health,
            "isDead": outcome.dead,
            "timestamp": now_millis(),
        });
        let attacker_session = self.session_of(attacker);
        if let Some(sid) = attacker_session {
            self.services.sessions.send_to(sid, &event);
        }
        let radius = self.services.config.game.interest_radius;
        self.services
            .sessions
            .broadcast_to_nearby(&self.entities, target_pos, radius, &event, attacker_session);

        if self.entities.get(attacker).is_some_and(|e| e.kind() == EntityKind::Player) {
            self.publish(GameEvent::PlayerAttack { attacker, target, damage: outcome.dealt });
        }
        if outcome.dead {
            self.kill(target, attacker);
        }
        Some(outcome)
    }

    pub fn resolve_ai_events(&mut self, events: Vec<AiEvent>) {
        for event in events {
            match event {
                AiEvent::Attack { attacker, target, damage } => {
                    self.strike(attacker, target, damage);
                }
            }
        }
    }

    fn kill(&mut self, target: EntityId, killer: EntityId) {
        match self.entities.get(target).map(Entity::kind) {
            Some(EntityKind::Npc) => self.npc_died(target, killer),
            Some(EntityKind::Player) => self.player_died(target, killer),
            _ => {}
        }
    }

    /// Familiar kills are credited to the familiar's owner.
    fn credited_player(&self, killer: EntityId) -> Option<EntityId> {
        let e = self.entities.get(killer)?;
        match &e.body {
            EntityBody::Player(_) => Some(killer),
            EntityBody::Npc(n) => n.owner_id.filter(|o| self.entities.get(*o).is_some_and(|e| e.kind() == EntityKind::Player)),
            _ => None,
        }
    }

    fn npc_died(&mut self, id: EntityId, killer: EntityId) {
        let credited = self.credited_player(killer);
        let Some(entity) = self.entities.destroy(id) else {
            return;
        };
        let pos = entity.position();
        let EntityBody::Npc(npc) = entity.body else {
            return;
        };
        self.forget_entity(id);
        if let Some(zone) = npc.zone {
            self.mobs.on_death(zone, id, self.clock);
        }
        tracing::debug!("{} {} died at {:?}", npc.npc_type.as_str(), id, pos);
        if npc.npc_type.is_familiar() {
            return;
        }

        let killer_level = credited
            .and_then(|p| self.entities.get(p))
            .and_then(|e| e.stats())
            .map_or(npc.stats.level, |s| s.level);
        let table_id = npc
            .zone
            .and_then(|z| self.mobs.zone(z))
            .map_or_else(|| npc.npc_type.as_str().to_string(), |z| z.loot_table.clone());
        let mut dropped = Vec::new();
        let mut gold = 0;
        if let Some(table) = self.loot.get(&table_id) {
            let roll = table.generate(killer_level, 1.0, &[], &mut self.rng);
            gold = roll.gold;
            for drop in roll.items {
                dropped.push(self.drop_item(pos, &drop.item_id, drop.quantity, drop.rarity, 0));
            }
            if roll.gold > 0 {
                dropped.push(self.drop_item(pos, "gold", 0, Rarity::Common, roll.gold));
            }
        }

        if let Some(player) = credited {
            let items: Vec<Value> = dropped.iter().filter_map(|id| self.entities.snapshot(*id)).collect();
            self.send_to_entity(
                player,
                &json!({ "type": "loot_dropped", "mob_id": id, "items": items, "gold": gold }),
            );
            self.award_experience(player, npc.xp_reward);
            self.publish(GameEvent::MobKilled {
                mob: id,
                npc_type: npc.npc_type.as_str().to_string(),
                killer: player,
                xp: npc.xp_reward,
            });
            if let Some(pid) = self.entities.get(player).and_then(Entity::as_player).map(|p| p.player_id) {
                self.log_event(
                    pid,
                    "mob_killed",
                    json!({ "npc_type": npc.npc_type.as_str(), "level": npc.stats.level, "xp": npc.xp_reward }),
                );
            }
        }
    }

    /// Spawn a pickup scattered around `center`.
    fn drop_item(&mut self, center: Vec3, item_id: &str, quantity: u32, rarity: Rarity, gold: u64) -> EntityId {
        let angle: f32 = self.rng.random_range(0.0..std::f32::consts::TAU);
        let dist: f32 = self.rng.random_range(0.5..1.5);
        let mut pos = center + Vec3::new(angle.cos() * dist, 0.0, angle.sin() * dist);
        if let Some(ground) = self.services.world.surface_height(pos.x, pos.z) {
            pos.y = ground;
        }
        let item = Item {
            item_id: item_id.to_string(),
            quantity,
            rarity,
            gold,
            expires_at: self.clock + ITEM_LIFETIME_SECS,
        };
        self.entities.create(pos, ITEM_RADIUS, EntityBody::Item(item))
    }

    fn player_died(&mut self, id: EntityId, killer: EntityId) {
        let spawn = self.services.config.game.spawn_point;
        let Some(player) = self.entities.get_mut(id).and_then(Entity::as_player_mut) else {
            return;
        };
        player.stats.health = player.stats.max_health;
        let (player_id, session_id, health) = (player.player_id, player.session_id, player.stats.health);
        self.forget_entity(id);

        self.services.sessions.broadcast_to_group(
            crate::net::sessions::GROUP_AUTHENTICATED,
            &json!({ "type": "player_death", "entity_id": id, "player_id": player_id, "killer_id": killer, "timestamp": now_millis() }),
        );
        self.publish(GameEvent::PlayerDeath { entity_id: id, killer: Some(killer) });
        self.log_event(player_id, "death", json!({ "killer": killer }));

        self.entities.move_entity(id, spawn);
        self.entities.touch(id);
        self.services.registry.update_position(player_id, spawn);
        self.services.sessions.send_to(
            session_id,
            &json!({ "type": "player_respawn", "entity_id": id, "x": spawn.x, "y": spawn.y, "z": spawn.z, "health": health }),
        );
        self.publish(GameEvent::PlayerRespawn { entity_id: id, position: spawn });
    }

    pub fn award_experience(&mut self, player: EntityId, xp: u64) {
        let Some(p) = self.entities.get_mut(player).and_then(Entity::as_player_mut) else {
            return;
        };
        let gained = p.gain_experience(xp);
        let (player_id, stats) = (p.player_id, p.stats);
        self.entities.touch(player);
        self.send_to_entity(
            player,
            &json!({ "type": "experience_gained", "xp": xp, "experience": stats.experience, "level": stats.level }),
        );
        if gained > 0 {
            self.send_to_entity(
                player,
                &json!({
                    "type": "level_up",
                    "entity_id": player,
                    "level": stats.level,
                    "max_health": stats.max_health,
                    "attack": stats.attack,
                }),
            );
            self.publish(GameEvent::PlayerLevelUp { entity_id: player, level: stats.level });
            self.log_event(player_id, "level_up", json!({ "level": stats.level }));
        }
        self.services.persistence.update_player(
            player_id,
            PlayerPatch { level: Some(stats.level), experience: Some(stats.experience), ..PlayerPatch::default() },
        );
    }

    /// Move an item into a player's inventory. Returns the `item_collected` reply.
    pub fn collect_item(&mut self, player: EntityId, item: EntityId) -> Result<Value, ProtocolError> {
        let player_pos = self.entities.get(player).map(Entity::position).ok_or_else(ProtocolError::not_authenticated)?;
        let target = self.entities.get(item).ok_or_else(|| ProtocolError::not_found("Item not found"))?;
        if target.as_item().is_none() {
            return Err(ProtocolError::bad_request("Target is not an item"));
        }
        if target.position().distance(player_pos) > PICKUP_RANGE {
            return Err(ProtocolError::bad_request("Item out of range"));
        }
        let Some(Entity { body: EntityBody::Item(loot), .. }) = self.entities.destroy(item) else {
            return Err(ProtocolError::not_found("Item not found"));
        };
        let Some(p) = self.entities.get_mut(player).and_then(Entity::as_player_mut) else {
            return Err(ProtocolError::not_authenticated());
        };
        p.gold += loot.gold;
        if loot.quantity > 0 {
            p.add_item(&loot.item_id, loot.quantity, loot.rarity);
        }
        let total_gold = p.gold;
        self.entities.touch(player);
        self.publish(GameEvent::ItemCollected {
            entity_id: player,
            item_id: loot.item_id.clone(),
            quantity: loot.quantity,
            rarity: loot.rarity,
        });
        Ok(json!({
            "type": "item_collected",
            "item_entity_id": item,
            "item_id": loot.item_id,
            "quantity": loot.quantity,
            "rarity": loot.rarity,
            "gold": loot.gold,
            "total_gold": total_gold,
        }))
    }

    /// Pick up every item the player is standing on.
    pub fn auto_collect(&mut self, player: EntityId) {
        let Some(pos) = self.entities.get(player).map(Entity::position) else {
            return;
        };
        let radius = self.services.config.game.player_radius;
        for item in self.services.collision.triggers_at(pos, radius) {
            if let Ok(reply) = self.collect_item(player, item) {
                self.send_to_entity(player, &reply);
            }
        }
    }

    pub fn expire_items(&mut self) {
        let now = self.clock;
        let expired: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|e| e.as_item().is_some_and(|i| i.expires_at <= now))
            .map(Entity::id)
            .collect();
        for id in expired {
            self.entities.destroy(id);
        }
    }

    /// Advance projectiles, resolving hits by raycast along the step.
    pub fn step_projectiles(&mut self, dt: f32) {
        for id in self.entities.ids_of_kind(EntityKind::Projectile) {
            let Some(e) = self.entities.get(id) else {
                continue;
            };
            let EntityBody::Projectile(proj) = &e.body else {
                continue;
            };
            let (owner, damage, lifetime) = (proj.owner_id, proj.damage, proj.lifetime - dt);
            let (pos, velocity) = (e.position(), e.header.velocity);
            let step = velocity * dt;

            let hit = self.services.collision.raycast_excluding(pos, velocity, step.length(), Some(owner));
            if hit.hit {
                self.entities.destroy(id);
                if let Some(target) = hit.entity_id {
                    self.strike(owner, target, damage);
                }
                continue;
            }
            if lifetime <= 0.0 {
                self.entities.destroy(id);
                continue;
            }
            if let Some(EntityBody::Projectile(p)) = self.entities.get_mut(id).map(|e| &mut e.body) {
                p.lifetime = lifetime;
            }
            self.entities.move_entity(id, pos + step);
        }
    }
}

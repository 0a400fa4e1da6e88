//! Game event bus for scripting hosts and other observers.
//!
//! The game loop publishes a [`GameEvent`] for every notable state change to a
//! shared `tokio::sync::broadcast` channel. Publishing never blocks: with no
//! subscribers the send fails silently, and slow subscribers lag rather than
//! stall the loop.

use serde::Serialize;
use tokio::sync::broadcast;
use worldcore_engine::world::position::Vec3;

use crate::entity::EntityId;
use crate::entity::loot::Rarity;
use crate::persistence::PlayerId;

/// Capacity of the broadcast channel. A subscriber further behind than this
/// sees `RecvError::Lagged`.
pub const BUS_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEvent {
    PlayerLogin { player_id: PlayerId, entity_id: EntityId, username: String },
    PlayerLogout { player_id: PlayerId, entity_id: EntityId },
    PlayerMove { entity_id: EntityId, position: Vec3 },
    PlayerAttack { attacker: EntityId, target: EntityId, damage: f32 },
    PlayerLevelUp { entity_id: EntityId, level: u32 },
    PlayerDeath { entity_id: EntityId, killer: Option<EntityId> },
    PlayerRespawn { entity_id: EntityId, position: Vec3 },
    MobKilled { mob: EntityId, npc_type: String, killer: EntityId, xp: u64 },
    ItemCollected { entity_id: EntityId, item_id: String, quantity: u32, rarity: Rarity },
    Chat { entity_id: EntityId, username: String, message: String },
    Custom { name: String, data: serde_json::Value },
}

impl GameEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::PlayerLogin { .. } => "player_login",
            GameEvent::PlayerLogout { .. } => "player_logout",
            GameEvent::PlayerMove { .. } => "player_move",
            GameEvent::PlayerAttack { .. } => "player_attack",
            GameEvent::PlayerLevelUp { .. } => "player_level_up",
            GameEvent::PlayerDeath { .. } => "player_death",
            GameEvent::PlayerRespawn { .. } => "player_respawn",
            GameEvent::MobKilled { .. } => "mob_killed",
            GameEvent::ItemCollected { .. } => "item_collected",
            GameEvent::Chat { .. } => "chat",
            GameEvent::Custom { .. } => "custom",
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<GameEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: GameEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        bus.publish(GameEvent::Custom { name: "dropped".into(), data: serde_json::Value::Null });
        let mut rx = bus.subscribe();
        bus.publish(GameEvent::PlayerLevelUp { entity_id: 4, level: 2 });
        bus.publish(GameEvent::Chat { entity_id: 4, username: "ann".into(), message: "hi".into() });
        assert_eq!(rx.recv().await.unwrap().name(), "player_level_up");
        assert_eq!(rx.recv().await.unwrap().name(), "chat");
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let v = serde_json::to_value(GameEvent::PlayerLevelUp { entity_id: 4, level: 2 }).unwrap();
        assert_eq!(v["event"], "player_level_up");
        assert_eq!(v["level"], 2);
    }
}

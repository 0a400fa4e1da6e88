//! Registry of logged-in players.
//!
//! The game loop is the only writer. Readers outside the loop (the dashboard,
//! `who` replies, duplicate-login checks) take a brief read lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use serde::Serialize;
use worldcore_engine::world::position::Vec3;

use crate::entity::EntityId;
use crate::net::session::SessionId;
use crate::persistence::PlayerId;

#[derive(Clone, Debug, Serialize)]
pub struct PlayerInfo {
    pub player_id: PlayerId,
    pub session_id: SessionId,
    pub entity_id: EntityId,
    pub username: String,
    pub position: Vec3,
    #[serde(skip)]
    pub logged_in_at: Instant,
}

/// Uses `std::sync::RwLock` because every operation is brief and the access
/// pattern is read-heavy.
pub struct PlayerRegistry {
    players: RwLock<HashMap<PlayerId, PlayerInfo>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self { players: RwLock::new(HashMap::new()) }
    }

    /// Register a player. Returns the previous record for the same player id,
    /// which the caller must disconnect.
    pub fn register(&self, info: PlayerInfo) -> Option<PlayerInfo> {
        self.players
            .write()
            .expect("player registry poisoned")
            .insert(info.player_id, info)
    }

    pub fn update_position(&self, player_id: PlayerId, position: Vec3) {
        if let Some(info) = self
            .players
            .write()
            .expect("player registry poisoned")
            .get_mut(&player_id)
        {
            info.position = position;
        }
    }

    /// Remove a player, but only if the record still belongs to `session_id`.
    /// A newer login from another session keeps its record.
    pub fn deregister(&self, player_id: PlayerId, session_id: SessionId) -> Option<PlayerInfo> {
        let mut players = self.players.write().expect("player registry poisoned");
        if players.get(&player_id).is_some_and(|p| p.session_id == session_id) {
            players.remove(&player_id)
        } else {
            None
        }
    }

    pub fn get(&self, player_id: PlayerId) -> Option<PlayerInfo> {
        self.players.read().expect("player registry poisoned").get(&player_id).cloned()
    }

    pub fn is_online(&self, player_id: PlayerId) -> bool {
        self.players.read().expect("player registry poisoned").contains_key(&player_id)
    }

    /// All online players, sorted by username.
    pub fn snapshot(&self) -> Vec<PlayerInfo> {
        let mut out: Vec<PlayerInfo> = self
            .players
            .read()
            .expect("player registry poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.username.cmp(&b.username));
        out
    }

    pub fn player_count(&self) -> usize {
        self.players.read().expect("player registry poisoned").len()
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(player_id: PlayerId, session_id: SessionId, name: &str) -> PlayerInfo {
        PlayerInfo {
            player_id,
            session_id,
            entity_id: player_id * 10,
            username: name.into(),
            position: Vec3::ZERO,
            logged_in_at: Instant::now(),
        }
    }

    #[test]
    fn relogin_replaces_and_reports_previous_session() {
        let reg = PlayerRegistry::new();
        assert!(reg.register(info(1, 100, "ann")).is_none());
        let previous = reg.register(info(1, 200, "ann")).unwrap();
        assert_eq!(previous.session_id, 100);

        // The stale session's logout must not remove the new record.
        assert!(reg.deregister(1, 100).is_none());
        assert!(reg.is_online(1));
        assert!(reg.deregister(1, 200).is_some());
        assert_eq!(reg.player_count(), 0);
    }

    #[test]
    fn snapshot_sorted_by_name() {
        let reg = PlayerRegistry::new();
        reg.register(info(2, 1, "zed"));
        reg.register(info(1, 2, "amy"));
        reg.update_position(2, Vec3::new(1.0, 2.0, 3.0));
        let names: Vec<String> = reg.snapshot().into_iter().map(|p| p.username).collect();
        assert_eq!(names, vec!["amy", "zed"]);
        assert_eq!(reg.get(2).unwrap().position, Vec3::new(1.0, 2.0, 3.0));
    }
}

//! Player, event and chunk persistence.
//!
//! The game consumes only the [`Persistence`] trait. Calls are synchronous and
//! may block, so the game loop never calls an adapter directly: everything goes
//! through the [`worker::PersistenceWorker`], which runs each call on the
//! blocking pool under a timeout.

pub mod chunks;
pub mod file;
pub mod memory;
pub mod worker;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use worldcore_engine::world::position::Vec3;

use crate::entity::loot::Rarity;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use worker::{PersistenceHandle, PersistenceWorker, WorkerError};

pub type PlayerId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item_id: String,
    pub quantity: u32,
    pub rarity: Rarity,
}

/// Canonical per-player columns. `extra` is an opaque extension blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub player_id: PlayerId,
    pub username: String,
    pub position: Vec3,
    pub health: f32,
    pub max_health: f32,
    pub level: u32,
    pub experience: u64,
    pub attack: f32,
    pub defense: f32,
    pub gold: u64,
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
    #[serde(default)]
    pub extra: Value,
}

impl PlayerState {
    /// A fresh level-1 character standing at `spawn`.
    pub fn new(player_id: PlayerId, username: &str, spawn: Vec3) -> Self {
        PlayerState {
            player_id,
            username: username.to_string(),
            position: spawn,
            health: 100.0,
            max_health: 100.0,
            level: 1,
            experience: 0,
            attack: 10.0,
            defense: 5.0,
            gold: 0,
            inventory: Vec::new(),
            extra: Value::Null,
        }
    }
}

/// Partial update for [`Persistence::update_player`]. `None` leaves a column alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerPatch {
    pub position: Option<Vec3>,
    pub health: Option<f32>,
    pub level: Option<u32>,
    pub experience: Option<u64>,
    pub gold: Option<u64>,
}

impl PlayerPatch {
    pub fn apply(&self, state: &mut PlayerState) {
        if let Some(p) = self.position {
            state.position = p;
        }
        if let Some(h) = self.health {
            state.health = h;
        }
        if let Some(l) = self.level {
            state.level = l;
        }
        if let Some(xp) = self.experience {
            state.experience = xp;
        }
        if let Some(g) = self.gold {
            state.gold = g;
        }
    }
}

/// Storage interface consumed by the game.
///
/// Implementations must be safe to call from several blocking-pool threads,
/// though the worker only ever issues one call at a time.
pub trait Persistence: Send + Sync {
    /// The account's player state if the credentials match. With
    /// auto-registration, an unknown username creates the account.
    fn authenticate(&self, username: &str, password: &str) -> Result<Option<PlayerState>>;

    fn get_player(&self, player_id: PlayerId) -> Result<Option<PlayerState>>;

    fn save_player(&self, state: &PlayerState) -> Result<()>;

    /// Apply `patch` to a stored player. Returns false if the player is unknown.
    fn update_player(&self, player_id: PlayerId, patch: &PlayerPatch) -> Result<bool> {
        let Some(mut state) = self.get_player(player_id)? else {
            return Ok(false);
        };
        patch.apply(&mut state);
        self.save_player(&state)?;
        Ok(true)
    }

    fn append_event(&self, game_id: &str, player_id: PlayerId, kind: &str, data: &Value) -> Result<()>;

    fn load_chunk(&self, x: i32, z: i32, lod: u8) -> Result<Option<Vec<u8>>>;

    fn save_chunk(&self, x: i32, z: i32, lod: u8, bytes: &[u8]) -> Result<()>;
}

/// 64-bit FNV-1a over `username:password`, hex encoded. A development
/// stand-in for a real password hash; the file backend is not for production.
pub(crate) fn credential_digest(username: &str, password: &str) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = OFFSET;
    for b in username.bytes().chain(std::iter::once(b':')).chain(password.bytes()) {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    hex::encode(h.to_be_bytes())
}

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use serde_json::Value;
use worldcore_engine::world::position::Vec3;

use super::{Persistence, PlayerId, PlayerState};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub game_id: String,
    pub player_id: PlayerId,
    pub kind: String,
    pub data: Value,
}

#[derive(Default)]
struct Inner {
    /// username -> (password, player id)
    accounts: HashMap<String, (String, PlayerId)>,
    players: HashMap<PlayerId, PlayerState>,
    events: Vec<StoredEvent>,
    chunks: HashMap<(i32, i32, u8), Vec<u8>>,
    next_id: PlayerId,
}

/// In-process backend used by tests and `persistence.backend = "memory"`.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    auto_register: bool,
    spawn: Vec3,
    /// When set, every write fails. Simulates an unavailable database.
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new(auto_register: bool, spawn: Vec3) -> Self {
        Self {
            inner: Mutex::new(Inner { next_id: 1, ..Inner::default() }),
            auto_register,
            spawn,
            failing: AtomicBool::new(false),
        }
    }

    /// Create an account explicitly. Returns the new player id, or `None` if
    /// the username is taken.
    pub fn register(&self, username: &str, password: &str) -> Option<PlayerId> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner.accounts.contains_key(username) {
            return None;
        }
        Some(create_account(&mut inner, username, password, self.spawn))
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.inner.lock().expect("memory store poisoned").events.clone()
    }

    pub fn player_count(&self) -> usize {
        self.inner.lock().expect("memory store poisoned").players.len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            bail!("memory store unavailable");
        }
        Ok(())
    }
}

fn create_account(inner: &mut Inner, username: &str, password: &str, spawn: Vec3) -> PlayerId {
    let id = inner.next_id;
    inner.next_id += 1;
    inner.accounts.insert(username.to_string(), (password.to_string(), id));
    inner.players.insert(id, PlayerState::new(id, username, spawn));
    id
}

impl Persistence for MemoryStore {
    fn authenticate(&self, username: &str, password: &str) -> Result<Option<PlayerState>> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let existing = inner.accounts.get(username).cloned();
        let id = match existing {
            Some((stored, id)) if stored == password => id,
            Some(_) => return Ok(None),
            None if self.auto_register => create_account(&mut inner, username, password, self.spawn),
            None => return Ok(None),
        };
        Ok(inner.players.get(&id).cloned())
    }

    fn get_player(&self, player_id: PlayerId) -> Result<Option<PlayerState>> {
        Ok(self.inner.lock().expect("memory store poisoned").players.get(&player_id).cloned())
    }

    fn save_player(&self, state: &PlayerState) -> Result<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .expect("memory store poisoned")
            .players
            .insert(state.player_id, state.clone());
        Ok(())
    }

    fn append_event(&self, game_id: &str, player_id: PlayerId, kind: &str, data: &Value) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().expect("memory store poisoned").events.push(StoredEvent {
            game_id: game_id.to_string(),
            player_id,
            kind: kind.to_string(),
            data: data.clone(),
        });
        Ok(())
    }

    fn load_chunk(&self, x: i32, z: i32, lod: u8) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().expect("memory store poisoned").chunks.get(&(x, z, lod)).cloned())
    }

    fn save_chunk(&self, x: i32, z: i32, lod: u8, bytes: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .expect("memory store poisoned")
            .chunks
            .insert((x, z, lod), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PlayerPatch;

    #[test]
    fn auto_register_then_password_check() {
        let store = MemoryStore::new(true, Vec3::ZERO);
        let first = store.authenticate("ann", "pw").unwrap().unwrap();
        assert_eq!(first.player_id, 1);
        assert_eq!(store.authenticate("ann", "pw").unwrap().unwrap().player_id, 1);
        assert!(store.authenticate("ann", "nope").unwrap().is_none());
    }

    #[test]
    fn unknown_user_rejected_without_auto_register() {
        let store = MemoryStore::new(false, Vec3::ZERO);
        assert!(store.authenticate("ghost", "pw").unwrap().is_none());
        let id = store.register("ghost", "pw").unwrap();
        assert!(store.register("ghost", "other").is_none());
        assert_eq!(store.authenticate("ghost", "pw").unwrap().unwrap().player_id, id);
    }

    #[test]
    fn update_player_goes_through_default_impl() {
        let store = MemoryStore::new(true, Vec3::ZERO);
        let id = store.authenticate("ann", "pw").unwrap().unwrap().player_id;
        assert!(store.update_player(id, &PlayerPatch { level: Some(4), ..PlayerPatch::default() }).unwrap());
        assert_eq!(store.get_player(id).unwrap().unwrap().level, 4);
        assert!(!store.update_player(99, &PlayerPatch::default()).unwrap());
    }

    #[test]
    fn failing_store_rejects_writes() {
        let store = MemoryStore::new(true, Vec3::ZERO);
        let state = store.authenticate("ann", "pw").unwrap().unwrap();
        store.set_failing(true);
        assert!(store.save_player(&state).is_err());
        assert!(store.append_event("g", 1, "login", &Value::Null).is_err());
        store.set_failing(false);
        store.save_chunk(1, 2, 0, b"abc").unwrap();
        assert_eq!(store.load_chunk(1, 2, 0).unwrap().as_deref(), Some(&b"abc"[..]));
    }
}

//! JSON-file development backend.
//!
//! Layout under the data directory:
//! `accounts.json`, `players/<id>.json`, `events/<game_id>.jsonl` and
//! `chunks/<x>_<z>_<lod>.bin`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use worldcore_engine::world::position::Vec3;

use super::{Persistence, PlayerId, PlayerState, credential_digest};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    player_id: PlayerId,
    password_hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Accounts {
    next_id: PlayerId,
    users: BTreeMap<String, Account>,
}

pub struct FileStore {
    root: PathBuf,
    accounts: Mutex<Accounts>,
    auto_register: bool,
    spawn: Vec3,
}

impl FileStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: &Path, auto_register: bool, spawn: Vec3) -> Result<Self> {
        for sub in ["players", "events", "chunks"] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("creating {}", root.join(sub).display()))?;
        }
        let path = root.join("accounts.json");
        let accounts = if path.exists() {
            let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Accounts { next_id: 1, users: BTreeMap::new() }
        };
        tracing::info!("File store at {} ({} accounts)", root.display(), accounts.users.len());
        Ok(Self { root: root.to_path_buf(), accounts: Mutex::new(accounts), auto_register, spawn })
    }

    fn player_path(&self, id: PlayerId) -> PathBuf {
        self.root.join("players").join(format!("{}.json", id))
    }

    fn chunk_path(&self, x: i32, z: i32, lod: u8) -> PathBuf {
        self.root.join("chunks").join(format!("{}_{}_{}.bin", x, z, lod))
    }

    fn save_accounts(&self, accounts: &Accounts) -> Result<()> {
        let path = self.root.join("accounts.json");
        let bytes = serde_json::to_vec_pretty(accounts).context("serializing accounts")?;
        write_atomic(&path, &bytes)
    }
}

/// Write through a temp file and rename so readers never see a torn file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {} into place", tmp.display()))
}

/// Game ids become file names; keep them to a safe alphabet.
fn sanitize(game_id: &str) -> String {
    let cleaned: String = game_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "default".into() } else { cleaned }
}

impl Persistence for FileStore {
    fn authenticate(&self, username: &str, password: &str) -> Result<Option<PlayerState>> {
        let digest = credential_digest(username, password);
        let mut accounts = self.accounts.lock().expect("accounts poisoned");
        let known = accounts.users.get(username).map(|a| (a.player_id, a.password_hash == digest));
        let id = match known {
            Some((id, true)) => id,
            Some((_, false)) => return Ok(None),
            None if self.auto_register => {
                let id = accounts.next_id;
                accounts.next_id += 1;
                accounts
                    .users
                    .insert(username.to_string(), Account { player_id: id, password_hash: digest });
                self.save_accounts(&accounts)?;
                let state = PlayerState::new(id, username, self.spawn);
                self.save_player(&state)?;
                tracing::info!("Registered account '{}' as player {}", username, id);
                return Ok(Some(state));
            }
            None => return Ok(None),
        };
        drop(accounts);
        match self.get_player(id)? {
            Some(state) => Ok(Some(state)),
            // Account without a player file: recreate the character.
            None => {
                let state = PlayerState::new(id, username, self.spawn);
                self.save_player(&state)?;
                Ok(Some(state))
            }
        }
    }

    fn get_player(&self, player_id: PlayerId) -> Result<Option<PlayerState>> {
        let path = self.player_path(player_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let state = serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(state))
    }

    fn save_player(&self, state: &PlayerState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state).context("serializing player")?;
        write_atomic(&self.player_path(state.player_id), &bytes)
    }

    fn append_event(&self, game_id: &str, player_id: PlayerId, kind: &str, data: &Value) -> Result<()> {
        let path = self.root.join("events").join(format!("{}.jsonl", sanitize(game_id)));
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
        let line = json!({ "timestamp": ts, "player_id": player_id, "type": kind, "data": data });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        writeln!(file, "{}", line).with_context(|| format!("appending to {}", path.display()))
    }

    fn load_chunk(&self, x: i32, z: i32, lod: u8) -> Result<Option<Vec<u8>>> {
        let path = self.chunk_path(x, z, lod);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path).map(Some).with_context(|| format!("reading {}", path.display()))
    }

    fn save_chunk(&self, x: i32, z: i32, lod: u8, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.chunk_path(x, z, lod), bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("worldcore_filestore_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn accounts_and_players_survive_reopen() {
        let dir = temp_dir("reopen");
        let spawn = Vec3::new(0.0, 70.0, 0.0);
        let id = {
            let store = FileStore::open(&dir, true, spawn).unwrap();
            let mut state = store.authenticate("ann", "pw").unwrap().unwrap();
            state.gold = 42;
            store.save_player(&state).unwrap();
            state.player_id
        };
        let store = FileStore::open(&dir, false, spawn).unwrap();
        let state = store.authenticate("ann", "pw").unwrap().unwrap();
        assert_eq!((state.player_id, state.gold), (id, 42));
        assert!(store.authenticate("ann", "wrong").unwrap().is_none());
        assert!(store.authenticate("bob", "pw").unwrap().is_none());

        let raw = fs::read_to_string(dir.join("accounts.json")).unwrap();
        assert!(!raw.contains("\"pw\""), "password stored in clear");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn events_append_as_json_lines() {
        let dir = temp_dir("events");
        let store = FileStore::open(&dir, true, Vec3::ZERO).unwrap();
        store.append_event("world/1", 3, "login", &json!({"ok": true})).unwrap();
        store.append_event("world/1", 3, "logout", &Value::Null).unwrap();
        let text = fs::read_to_string(dir.join("events/world_1.jsonl")).unwrap();
        let kinds: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["login", "logout"]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn chunk_blobs_round_trip() {
        let dir = temp_dir("chunks");
        let store = FileStore::open(&dir, true, Vec3::ZERO).unwrap();
        assert!(store.load_chunk(-1, 4, 0).unwrap().is_none());
        store.save_chunk(-1, 4, 0, b"{}").unwrap();
        assert!(dir.join("chunks/-1_4_0.bin").exists());
        assert_eq!(store.load_chunk(-1, 4, 0).unwrap().unwrap(), b"{}");
        let _ = fs::remove_dir_all(&dir);
    }
}

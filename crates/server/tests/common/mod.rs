#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use worldcore_engine::world::position::Vec3;
use worldcore_server::config::{PersistenceBackend, ServerConfig};

const READ_TIMEOUT: Duration = Duration::from_secs(20);

pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("worldcore_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Small, quiet world on an ephemeral port with in-memory persistence.
pub fn test_config(name: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.dashboard.enabled = false;
    config.persistence.backend = PersistenceBackend::Memory;
    config.persistence.data_dir = temp_dir(name);
    config.cache.disk_path = String::new();
    config.world.max_terrain_height = 8;
    config.world.load_radius = 1;
    config.world.view_distance = 48.0;
    config.world.chunk_unload_distance = 96.0;
    config.world.loader_workers = 2;
    config.world.unloader_workers = 1;
    config.game.tick_ms = 10;
    config.game.spawn_point = Vec3::new(10.0, 20.0, 10.0);
    config.game.spawn_zones = Vec::new();
    config.game.shutdown_grace_seconds = 1;
    config
}

pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Client { lines: BufReader::new(read).lines(), write }
    }

    pub async fn send(&mut self, msg: &Value) {
        let mut line = msg.to_string();
        line.push('\n');
        self.write.write_all(line.as_bytes()).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.unwrap();
    }

    /// Next frame, or `None` once the server closed the connection.
    pub async fn next(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .ok()??;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Skip frames until one of type `kind` arrives.
    pub async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let msg = self.next().await.unwrap_or_else(|| panic!("connection closed before '{}'", kind));
            if msg["type"] == kind {
                return msg;
            }
        }
    }

    /// Skip frames until the server closes the connection.
    pub async fn expect_closed(&mut self) {
        while self.next().await.is_some() {}
    }

    /// Log in and return the `data` of the `logged_in` reply.
    pub async fn login(&mut self, username: &str) -> Value {
        self.send(&json!({ "type": "login", "username": username, "password": "p" })).await;
        loop {
            let msg = self.expect("success").await;
            if msg["message"] == "logged_in" {
                return msg["data"].clone();
            }
        }
    }
}

//! Server configuration.
//!
//! Layered, lowest priority first: built-in defaults, the JSON config file,
//! `WORLDCORE_<SECTION>_<KEY>` environment variables, then CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use worldcore_engine::store::StoreConfig;
use worldcore_engine::store::cache::EvictionPolicy;
use worldcore_engine::streamer::StreamerConfig;
use worldcore_engine::world::generator::GeneratorConfig;
use worldcore_engine::world::position::Vec3;

use crate::entity::loot::{self, LootTable};
use crate::entity::mobs::{self, SpawnZoneConfig};

pub const DEFAULT_CONFIG_PATH: &str = "config/server_config.json";
const ENV_PREFIX: &str = "WORLDCORE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: NetSection,
    pub world: WorldSection,
    pub cache: CacheSection,
    pub game: GameSection,
    pub persistence: PersistenceSection,
    pub logging: LoggingSection,
    pub dashboard: DashboardSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSection {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub io_threads: usize,
    pub write_queue_capacity: usize,
    /// Longest inbound line accepted, newline excluded.
    pub max_frame_bytes: usize,
}

impl Default for NetSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_connections: 10_000,
            io_threads: 4,
            write_queue_capacity: 4096,
            max_frame_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSection {
    pub seed: u64,
    /// Load distance around each viewer, in world units.
    pub view_distance: f32,
    pub chunk_size: usize,
    pub max_active_chunks: usize,
    pub terrain_scale: f32,
    pub max_terrain_height: usize,
    pub water_level: f32,
    pub chunk_unload_distance: f32,
    pub load_radius: i32,
    pub loader_workers: usize,
    pub unloader_workers: usize,
    pub load_queue_capacity: usize,
    pub lod_priority_weight: f64,
}

impl Default for WorldSection {
    fn default() -> Self {
        Self {
            seed: 12345,
            view_distance: 300.0,
            chunk_size: 16,
            max_active_chunks: 2000,
            terrain_scale: 100.0,
            max_terrain_height: 64,
            water_level: 10.0,
            chunk_unload_distance: 350.0,
            load_radius: 5,
            loader_workers: 4,
            unloader_workers: 2,
            load_queue_capacity: 1000,
            lod_priority_weight: 1_000_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_memory_chunks: usize,
    pub max_memory_bytes: usize,
    /// Empty disables the disk tier.
    pub disk_path: String,
    pub max_disk_chunks: usize,
    pub eviction_policy: String,
    pub compression_level: u32,
    pub async_save: bool,
    pub save_batch_size: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_memory_chunks: 1000,
            max_memory_bytes: 512 * 1024 * 1024,
            disk_path: "data/chunk_cache".into(),
            max_disk_chunks: 10_000,
            eviction_policy: "LRU".into(),
            compression_level: 6,
            async_save: true,
            save_batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSection {
    pub heartbeat_seconds: u64,
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: u32,
    pub tick_ms: u64,
    pub max_dt_ms: u64,
    pub player_radius: f32,
    pub interest_radius: f32,
    pub player_save_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub flee_threat_threshold: f32,
    pub max_move_per_frame: f32,
    pub spawn_point: Vec3,
    #[serde(default = "mobs::default_zones")]
    pub spawn_zones: Vec<SpawnZoneConfig>,
    #[serde(default = "loot::default_tables")]
    pub loot_tables: Vec<LootTable>,
}

impl Default for GameSection {
    fn default() -> Self {
        Self {
            heartbeat_seconds: 30,
            rate_limit_per_second: 100.0,
            rate_limit_burst: 1000,
            tick_ms: 16,
            max_dt_ms: 100,
            player_radius: 0.5,
            interest_radius: 64.0,
            player_save_seconds: 60,
            shutdown_grace_seconds: 30,
            flee_threat_threshold: 50.0,
            max_move_per_frame: 10.0,
            spawn_point: Vec3::new(0.0, 70.0, 0.0),
            spawn_zones: mobs::default_zones(),
            loot_tables: loot::default_tables(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub data_dir: PathBuf,
    pub backend: PersistenceBackend,
    pub timeout_ms: u64,
    pub auto_register: bool,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            backend: PersistenceBackend::File,
            timeout_ms: 5000,
            auto_register: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self { enabled: true, port: 8000 }
    }
}

// ── Command line ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub bind: Option<String>,
    pub data: Option<PathBuf>,
    pub dashboard_port: Option<String>,
}

impl CliArgs {
    /// Parse `--config`, `--bind`, `--data` and `--dashboard-port`, each
    /// followed by its value. Unknown arguments are ignored.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Self {
        let args: Vec<String> = args.into_iter().collect();
        let value_of = |flag: &str| {
            args.iter()
                .skip_while(|a| a.as_str() != flag)
                .nth(1)
                .cloned()
        };
        Self {
            config: value_of("--config").map(PathBuf::from),
            bind: value_of("--bind"),
            data: value_of("--data").map(PathBuf::from),
            dashboard_port: value_of("--dashboard-port"),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────────

impl ServerConfig {
    /// Build the effective configuration from all sources and validate it.
    pub fn load<E>(cli: &CliArgs, env: E) -> Result<Self>
    where
        E: IntoIterator<Item = (String, String)>,
    {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config = config.with_env(env)?;
        config.apply_cli(cli)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply `WORLDCORE_<SECTION>_<KEY>` overrides. Values are parsed as JSON
    /// when possible and taken as strings otherwise.
    pub fn with_env<E>(self, env: E) -> Result<Self>
    where
        E: IntoIterator<Item = (String, String)>,
    {
        let mut tree = serde_json::to_value(&self).context("failed to serialize config")?;
        let mut touched = false;
        for (name, raw) in env {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else { continue };
            let rest = rest.to_ascii_lowercase();
            let Some((section, key)) = rest.split_once('_') else { continue };
            let Some(slot) = tree.get_mut(section).and_then(|s| s.get_mut(key)) else {
                tracing::warn!("Ignoring unknown config override {}", name);
                continue;
            };
            *slot = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
            touched = true;
        }
        if !touched {
            return Ok(self);
        }
        serde_json::from_value(tree).context("invalid value in WORLDCORE_* environment override")
    }

    fn apply_cli(&mut self, cli: &CliArgs) -> Result<()> {
        if let Some(bind) = &cli.bind {
            let (host, port) = bind
                .rsplit_once(':')
                .with_context(|| format!("--bind expects host:port, got '{}'", bind))?;
            self.server.host = host.to_string();
            self.server.port = port.parse().with_context(|| format!("invalid port in --bind '{}'", bind))?;
        }
        if let Some(data) = &cli.data {
            self.persistence.data_dir = data.clone();
            self.cache.disk_path = data.join("chunk_cache").to_string_lossy().into_owned();
        }
        if let Some(port) = &cli.dashboard_port {
            self.dashboard.port = port
                .parse()
                .with_context(|| format!("invalid --dashboard-port '{}'", port))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if self.server.max_frame_bytes == 0 {
            bail!("server.max_frame_bytes must be positive");
        }
        if self.cache.compression_level > 9 {
            bail!("cache.compression_level must be 0..=9, got {}", self.cache.compression_level);
        }
        if self.game.tick_ms == 0 {
            bail!("game.tick_ms must be positive");
        }
        if self.game.rate_limit_burst == 0 {
            bail!("game.rate_limit_burst must be positive");
        }
        if self.world.chunk_size != 16 {
            bail!("world.chunk_size must be 16, got {}", self.world.chunk_size);
        }
        if !(1..=256).contains(&self.world.max_terrain_height) {
            bail!("world.max_terrain_height must be 1..=256, got {}", self.world.max_terrain_height);
        }
        self.eviction_policy()?;
        Ok(())
    }

    pub fn eviction_policy(&self) -> Result<EvictionPolicy> {
        self.cache
            .eviction_policy
            .parse()
            .map_err(|_| anyhow::anyhow!("cache.eviction_policy must be LRU, LFU or FIFO, got '{}'", self.cache.eviction_policy))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.game.tick_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.game.heartbeat_seconds.max(1))
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            seed: self.world.seed,
            terrain_scale: self.world.terrain_scale,
            max_terrain_height: self.world.max_terrain_height,
            water_level: self.world.water_level,
            ..GeneratorConfig::default()
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_memory_chunks: self.cache.max_memory_chunks,
            max_memory_bytes: self.cache.max_memory_bytes,
            disk_path: (!self.cache.disk_path.is_empty()).then(|| PathBuf::from(&self.cache.disk_path)),
            max_disk_chunks: self.cache.max_disk_chunks,
            eviction_policy: self.eviction_policy().unwrap_or(EvictionPolicy::Lru),
            compression_level: self.cache.compression_level,
            async_save: self.cache.async_save,
            save_batch_size: self.cache.save_batch_size,
        }
    }

    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            loader_workers: self.world.loader_workers,
            unloader_workers: self.world.unloader_workers,
            queue_capacity: self.world.load_queue_capacity,
            load_distance: self.world.view_distance,
            unload_distance: self.world.chunk_unload_distance,
            load_radius: self.world.load_radius,
            lod_weight: self.world.lod_priority_weight,
        }
    }
}

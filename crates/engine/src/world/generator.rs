//! Deterministic procedural terrain.
//!
//! Heights and biomes are pure functions of the seed and world XZ, so any
//! chunk can be rebuilt at any time and neighbouring chunks always agree at
//! their borders.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::block::{Biome, BlockType};
use super::chunk::{Lod, WorldChunk};
use super::position::{BLOCK_SIZE, CHUNK_SIZE, ChunkPos};

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub seed: u64,
    /// Horizontal scale of the base noise, in world units.
    pub terrain_scale: f32,
    /// Vertical blocks per chunk column (H).
    pub max_terrain_height: usize,
    pub water_level: f32,
    pub octaves: u32,
    pub persistence: f32,
    pub lacunarity: f32,
    pub forest_threshold: f32,
    pub mountain_threshold: f32,
    pub desert_threshold: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: 12345,
            terrain_scale: 100.0,
            max_terrain_height: 64,
            water_level: 10.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            forest_threshold: 0.6,
            mountain_threshold: 0.8,
            desert_threshold: -0.3,
        }
    }
}

pub struct WorldGenerator {
    config: GeneratorConfig,
    perm: [u8; 512],
}

impl WorldGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let mut table: Vec<u8> = (0..=255u8).collect();
        let mut rng = StdRng::seed_from_u64(config.seed);
        table.shuffle(&mut rng);
        let mut perm = [0u8; 512];
        for i in 0..512 {
            perm[i] = table[i & 255];
        }
        Self { config, perm }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.config.seed
    }

    pub fn chunk_height(&self) -> usize {
        self.config.max_terrain_height
    }

    /// Build a chunk at the given LOD with geometry ready.
    pub fn generate(&self, pos: ChunkPos, lod: Lod) -> WorldChunk {
        let h_max = self.config.max_terrain_height;
        let mut chunk = WorldChunk::new(pos, h_max, lod);
        let water = self.config.water_level.max(0.0) as usize;

        let center_x = (pos.x * CHUNK_SIZE as i32) as f32 + CHUNK_SIZE as f32 / 2.0;
        let center_z = (pos.z * CHUNK_SIZE as i32) as f32 + CHUNK_SIZE as f32 / 2.0;
        let biome = self.biome_at(center_x, center_z);
        chunk.set_biome(biome);

        for lz in 0..CHUNK_SIZE {
            for lx in 0..CHUNK_SIZE {
                let wx = (pos.x * CHUNK_SIZE as i32 + lx as i32) as f32 * BLOCK_SIZE;
                let wz = (pos.z * CHUNK_SIZE as i32 + lz as i32) as f32 * BLOCK_SIZE;
                let surface = self.column_height(wx, wz);
                for y in 0..surface {
                    let block = if y + 1 == surface {
                        self.surface_block(biome, y)
                    } else if y + 4 >= surface {
                        BlockType::Dirt
                    } else {
                        BlockType::Stone
                    };
                    chunk.put_block(lx, y, lz, block);
                }
                for y in surface..=water.min(h_max - 1) {
                    chunk.put_block(lx, y, lz, BlockType::Water);
                }
                chunk.set_surface(lx, lz, surface as f32);
            }
        }

        if biome == Biome::Forest {
            self.plant_trees(&mut chunk);
        }

        chunk.rebuild();
        chunk
    }

    fn surface_block(&self, biome: Biome, y: usize) -> BlockType {
        match biome {
            Biome::Desert => BlockType::Sand,
            Biome::Mountain if y as f32 > self.config.water_level + 10.0 => BlockType::Snow,
            Biome::Plains | Biome::Forest => BlockType::Grass,
            Biome::Ocean | Biome::River => BlockType::Sand,
            _ => BlockType::Dirt,
        }
    }

    fn plant_trees(&self, chunk: &mut WorldChunk) {
        let pos = chunk.pos();
        for x in (2..CHUNK_SIZE - 2).step_by(3) {
            for z in (2..CHUNK_SIZE - 2).step_by(3) {
                let wx = pos.x as i64 * CHUNK_SIZE as i64 + x as i64;
                let wz = pos.z as i64 * CHUNK_SIZE as i64 + z as i64;
                let roll = self.hash2(wx, wz);
                if roll % 10 != 0 {
                    continue;
                }
                let base = chunk.surface_height(x, z) as usize;
                if (base as f32) <= self.config.water_level {
                    continue;
                }
                let trunk = 4 + (roll / 10 % 3) as usize;
                for dy in 0..trunk {
                    chunk.put_block(x, base + dy, z, BlockType::Wood);
                }
                let leaves = base + trunk - 2;
                for dx in -1i32..=1 {
                    for dz in -1i32..=1 {
                        for dy in 0..=2 {
                            let (lx, lz) = ((x as i32 + dx) as usize, (z as i32 + dz) as usize);
                            if (dx != 0 || dz != 0 || dy == 2) && lx < CHUNK_SIZE && lz < CHUNK_SIZE {
                                chunk.put_block(lx, leaves + dy, lz, BlockType::Leaves);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Integer surface height (number of filled blocks) of a world column.
    pub fn column_height(&self, x: f32, z: f32) -> usize {
        let h = self.terrain_height(x, z).floor() as i64;
        h.clamp(1, self.config.max_terrain_height as i64 - 1) as usize
    }

    /// Continuous terrain height in `[0, max_terrain_height]`.
    pub fn terrain_height(&self, x: f32, z: f32) -> f32 {
        let scale = self.config.terrain_scale.max(1.0);
        let base = self.fractal(x / scale, z / scale);
        let detail = self.noise(x / (scale * 0.5), z / (scale * 0.5)) * 0.2;
        let normalized = ((base + detail + 1.0) * 0.5).clamp(0.0, 1.0);
        normalized.powf(1.5) * self.config.max_terrain_height as f32
    }

    pub fn biome_at(&self, x: f32, z: f32) -> Biome {
        let temperature = self.fractal(x / 800.0, z / 800.0);
        let humidity = self.fractal(x / 700.0 + 31.7, z / 700.0 - 12.3);
        let height = self.terrain_height(x, z);

        if height < self.config.water_level {
            return if humidity > 0.7 { Biome::River } else { Biome::Ocean };
        }
        if height > self.config.mountain_threshold * self.config.max_terrain_height as f32 {
            return Biome::Mountain;
        }
        if temperature < self.config.desert_threshold {
            return Biome::Desert;
        }
        if humidity > self.config.forest_threshold {
            return Biome::Forest;
        }
        Biome::Plains
    }

    fn fractal(&self, x: f32, y: f32) -> f32 {
        let mut value = 0.0;
        let mut amplitude = 1.0;
        let mut frequency = 1.0;
        let mut norm = 0.0;
        for _ in 0..self.config.octaves.max(1) {
            value += self.noise(x * frequency, y * frequency) * amplitude;
            norm += amplitude;
            amplitude *= self.config.persistence;
            frequency *= self.config.lacunarity;
        }
        value / norm
    }

    /// 2D gradient noise in roughly `[-1, 1]`.
    fn noise(&self, x: f32, y: f32) -> f32 {
        let xi = x.floor();
        let yi = y.floor();
        let xf = x - xi;
        let yf = y - yi;
        let xi = (xi as i64 & 255) as usize;
        let yi = (yi as i64 & 255) as usize;

        let p = &self.perm;
        let aa = p[p[xi] as usize + yi];
        let ab = p[p[xi] as usize + yi + 1];
        let ba = p[p[xi + 1] as usize + yi];
        let bb = p[p[xi + 1] as usize + yi + 1];

        let u = fade(xf);
        let v = fade(yf);
        let x1 = lerp(grad(aa, xf, yf), grad(ba, xf - 1.0, yf), u);
        let x2 = lerp(grad(ab, xf, yf - 1.0), grad(bb, xf - 1.0, yf - 1.0), u);
        lerp(x1, x2, v) * std::f32::consts::SQRT_2
    }

    fn hash2(&self, x: i64, z: i64) -> u64 {
        let mut h = self.config.seed ^ 0x9E37_79B9_7F4A_7C15;
        for v in [x as u64, z as u64] {
            h ^= v.wrapping_add(0x9E37_79B9_7F4A_7C15).wrapping_add(h << 6).wrapping_add(h >> 2);
            h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        }
        h ^ (h >> 31)
    }
}

#[inline]
fn fade(t: f32) -> f32 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + t * (b - a)
}

#[inline]
fn grad(hash: u8, x: f32, y: f32) -> f32 {
    match hash & 7 {
        0 => x + y,
        1 => -x + y,
        2 => x - y,
        3 => -x - y,
        4 => x,
        5 => -x,
        6 => y,
        _ => -y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::position::LocalBlockPos;

    #[test]
    fn same_seed_same_chunk() {
        let a = WorldGenerator::new(GeneratorConfig::default());
        let b = WorldGenerator::new(GeneratorConfig::default());
        let ca = a.generate(ChunkPos::new(3, -2), Lod::High);
        let cb = b.generate(ChunkPos::new(3, -2), Lod::High);
        assert!(ca.same_content(&cb));
    }

    #[test]
    fn different_seeds_differ() {
        let a = WorldGenerator::new(GeneratorConfig::default());
        let b = WorldGenerator::new(GeneratorConfig { seed: 99, ..GeneratorConfig::default() });
        let ca = a.generate(ChunkPos::new(0, 0), Lod::High);
        let cb = b.generate(ChunkPos::new(0, 0), Lod::High);
        assert!(!ca.same_content(&cb));
    }

    #[test]
    fn heights_stay_inside_the_column() {
        let g = WorldGenerator::new(GeneratorConfig::default());
        for i in -50..50 {
            let h = g.column_height(i as f32 * 37.0, i as f32 * -11.0);
            assert!(h >= 1 && h < 64);
        }
    }

    #[test]
    fn heightmap_matches_generated_blocks() {
        let g = WorldGenerator::new(GeneratorConfig::default());
        let c = g.generate(ChunkPos::new(1, 1), Lod::High);
        let h = c.surface_height(5, 5) as u16;
        assert!(c.get_block(LocalBlockPos::new(5, h - 1, 5)).is_solid());
        assert!(c.get_block(LocalBlockPos::new(5, 0, 5)).is_solid());
    }

    #[test]
    fn noise_is_bounded() {
        let g = WorldGenerator::new(GeneratorConfig::default());
        for i in 0..1000 {
            let n = g.noise(i as f32 * 0.173, i as f32 * 0.311);
            assert!((-1.5..=1.5).contains(&n));
        }
    }
}

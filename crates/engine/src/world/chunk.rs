use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::block::{Biome, BlockType};
use super::mesh::{self, ChunkMesh, CollisionTriangle};
use super::position::{CHUNK_SIZE, ChunkPos, LocalBlockPos};

/// Cells in one horizontal layer of a chunk.
pub const LAYER_AREA: usize = CHUNK_SIZE * CHUNK_SIZE;

/// Level of detail a chunk is built at. Ordinal order runs from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Lod {
    #[default]
    High = 0,
    Medium = 1,
    Low = 2,
    Billboard = 3,
}

impl Lod {
    pub const ALL: [Lod; 4] = [Lod::High, Lod::Medium, Lod::Low, Lod::Billboard];

    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    pub const fn from_ordinal(raw: u8) -> Option<Lod> {
        match raw {
            0 => Some(Lod::High),
            1 => Some(Lod::Medium),
            2 => Some(Lod::Low),
            3 => Some(Lod::Billboard),
            _ => None,
        }
    }

    /// One step finer, saturating at HIGH.
    pub const fn finer(self) -> Lod {
        match self {
            Lod::High | Lod::Medium => Lod::High,
            Lod::Low => Lod::Medium,
            Lod::Billboard => Lod::Low,
        }
    }

    /// One step coarser, saturating at BILLBOARD.
    pub const fn coarser(self) -> Lod {
        match self {
            Lod::High => Lod::Medium,
            Lod::Medium => Lod::Low,
            Lod::Low | Lod::Billboard => Lod::Billboard,
        }
    }
}

/// Per-level build parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LodParams {
    pub simplification_factor: usize,
    pub has_collision: bool,
}

impl Lod {
    pub const fn params(self) -> LodParams {
        match self {
            Lod::High => LodParams { simplification_factor: 1, has_collision: true },
            Lod::Medium => LodParams { simplification_factor: 2, has_collision: true },
            Lod::Low => LodParams { simplification_factor: 4, has_collision: false },
            Lod::Billboard => LodParams { simplification_factor: 8, has_collision: false },
        }
    }
}

/// Identity of a cached chunk build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub x: i32,
    pub z: i32,
    pub lod: Lod,
}

impl ChunkKey {
    pub const fn new(x: i32, z: i32, lod: Lod) -> Self {
        Self { x, z, lod }
    }

    pub const fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }

    /// `chunk_{x:08x}_{z:08x}_{lod}.bin`, coordinates as two's-complement hex.
    pub fn file_name(&self) -> String {
        format!(
            "chunk_{:08x}_{:08x}_{}.bin",
            self.x as u32,
            self.z as u32,
            self.lod.ordinal()
        )
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.x, self.z, self.lod.ordinal())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkFormatError {
    #[error("malformed chunk json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("heightmap has {0} samples, expected 256")]
    Heightmap(usize),
    #[error("block array length {0} is not a non-zero multiple of 256")]
    Blocks(usize),
    #[error("unknown biome {0}")]
    Biome(i32),
}

/// Canonical persisted form. Derived geometry is never stored.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalChunk {
    chunk_x: i32,
    chunk_z: i32,
    biome: i32,
    heightmap: Vec<f32>,
    blocks: Vec<u8>,
}

/// A 16 x H x 16 column of blocks plus everything derived from it.
///
/// Blocks are stored flat with index `x + z*16 + y*256` so a horizontal layer
/// is contiguous.
#[derive(Debug, Clone)]
pub struct WorldChunk {
    pos: ChunkPos,
    lod: Lod,
    biome: Biome,
    height: usize,
    heightmap: Vec<f32>,
    blocks: Vec<u8>,
    mesh: ChunkMesh,
    collision: Vec<CollisionTriangle>,
    entities: HashSet<u64>,
    modified: bool,
}

impl WorldChunk {
    /// An all-air chunk of the given height. Geometry is empty until [`rebuild`](Self::rebuild).
    pub fn new(pos: ChunkPos, height: usize, lod: Lod) -> Self {
        let height = height.max(1);
        Self {
            pos,
            lod,
            biome: Biome::Plains,
            height,
            heightmap: vec![0.0; LAYER_AREA],
            blocks: vec![BlockType::Air.as_u8(); LAYER_AREA * height],
            mesh: ChunkMesh::default(),
            collision: Vec::new(),
            entities: HashSet::new(),
            modified: false,
        }
    }

    #[inline]
    fn index(x: usize, y: usize, z: usize) -> usize {
        x + z * CHUNK_SIZE + y * LAYER_AREA
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.pos.x, self.pos.z, self.lod)
    }

    pub fn lod(&self) -> Lod {
        self.lod
    }

    pub fn biome(&self) -> Biome {
        self.biome
    }

    pub fn set_biome(&mut self, biome: Biome) {
        self.biome = biome;
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn heightmap(&self) -> &[f32] {
        &self.heightmap
    }

    pub fn blocks(&self) -> &[u8] {
        &self.blocks
    }

    pub fn mesh(&self) -> &ChunkMesh {
        &self.mesh
    }

    pub fn collision_triangles(&self) -> &[CollisionTriangle] {
        &self.collision
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn clear_modified(&mut self) {
        self.modified = false;
    }

    pub fn get_block(&self, pos: LocalBlockPos) -> BlockType {
        let (x, y, z) = (pos.x as usize, pos.y as usize, pos.z as usize);
        if x >= CHUNK_SIZE || z >= CHUNK_SIZE || y >= self.height {
            return BlockType::Air;
        }
        BlockType::from_u8(self.blocks[Self::index(x, y, z)])
    }

    /// Used by generation. Does not flag the chunk as modified.
    pub(crate) fn put_block(&mut self, x: usize, y: usize, z: usize, block: BlockType) {
        if x < CHUNK_SIZE && z < CHUNK_SIZE && y < self.height {
            self.blocks[Self::index(x, y, z)] = block.as_u8();
        }
    }

    pub(crate) fn set_surface(&mut self, x: usize, z: usize, h: f32) {
        self.heightmap[x + z * CHUNK_SIZE] = h;
    }

    /// Player edit: writes the block, refreshes the column's heightmap sample and
    /// flags the chunk modified. Returns false for out-of-range positions.
    /// Geometry is stale until [`rebuild`](Self::rebuild) runs.
    pub fn set_block(&mut self, pos: LocalBlockPos, block: BlockType) -> bool {
        let (x, y, z) = (pos.x as usize, pos.y as usize, pos.z as usize);
        if x >= CHUNK_SIZE || z >= CHUNK_SIZE || y >= self.height {
            return false;
        }
        self.blocks[Self::index(x, y, z)] = block.as_u8();
        let top = (0..self.height)
            .rev()
            .find(|&yy| BlockType::from_u8(self.blocks[Self::index(x, yy, z)]).is_solid())
            .map(|yy| (yy + 1) as f32)
            .unwrap_or(0.0);
        self.heightmap[x + z * CHUNK_SIZE] = top;
        self.modified = true;
        true
    }

    /// Surface height at a local column.
    pub fn surface_height(&self, x: usize, z: usize) -> f32 {
        if x >= CHUNK_SIZE || z >= CHUNK_SIZE {
            return 0.0;
        }
        self.heightmap[x + z * CHUNK_SIZE]
    }

    /// Surface height at a world-space XZ position, 0 when outside this chunk.
    pub fn height_at(&self, world_x: f32, world_z: f32) -> f32 {
        let lx = world_x.floor() as i64 - self.pos.x as i64 * CHUNK_SIZE as i64;
        let lz = world_z.floor() as i64 - self.pos.z as i64 * CHUNK_SIZE as i64;
        if !(0..CHUNK_SIZE as i64).contains(&lx) || !(0..CHUNK_SIZE as i64).contains(&lz) {
            return 0.0;
        }
        self.surface_height(lx as usize, lz as usize)
    }

    /// Regenerate render geometry and collision triangles for the current LOD.
    pub fn rebuild(&mut self) {
        self.mesh = mesh::build_mesh(self);
        self.collision = if self.lod.params().has_collision {
            mesh::build_collision(self)
        } else {
            Vec::new()
        };
    }

    /// Same blocks, rebuilt at another LOD.
    pub fn with_lod(&self, lod: Lod) -> WorldChunk {
        let mut c = self.clone();
        c.lod = lod;
        c.rebuild();
        c
    }

    pub fn add_entity(&mut self, id: u64) {
        self.entities.insert(id);
    }

    pub fn remove_entity(&mut self, id: u64) {
        self.entities.remove(&id);
    }

    pub fn entities(&self) -> impl Iterator<Item = u64> + '_ {
        self.entities.iter().copied()
    }

    /// Memory accounting used by the chunk cache.
    pub fn estimated_size(&self) -> usize {
        self.mesh.vertices.len() * mesh::VERTEX_BYTES
            + self.mesh.triangles.len() * mesh::TRIANGLE_BYTES
            + self.blocks.len()
            + self.heightmap.len() * std::mem::size_of::<f32>()
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>, ChunkFormatError> {
        let canonical = CanonicalChunk {
            chunk_x: self.pos.x,
            chunk_z: self.pos.z,
            biome: self.biome.as_i32(),
            heightmap: self.heightmap.clone(),
            blocks: self.blocks.clone(),
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Parse the canonical form and rebuild geometry at `lod`.
    pub fn from_canonical_json(bytes: &[u8], lod: Lod) -> Result<WorldChunk, ChunkFormatError> {
        let c: CanonicalChunk = serde_json::from_slice(bytes)?;
        if c.heightmap.len() != LAYER_AREA {
            return Err(ChunkFormatError::Heightmap(c.heightmap.len()));
        }
        if c.blocks.is_empty() || c.blocks.len() % LAYER_AREA != 0 {
            return Err(ChunkFormatError::Blocks(c.blocks.len()));
        }
        let biome = Biome::from_i32(c.biome).ok_or(ChunkFormatError::Biome(c.biome))?;
        let mut chunk = WorldChunk {
            pos: ChunkPos::new(c.chunk_x, c.chunk_z),
            lod,
            biome,
            height: c.blocks.len() / LAYER_AREA,
            heightmap: c.heightmap,
            blocks: c.blocks,
            mesh: ChunkMesh::default(),
            collision: Vec::new(),
            entities: HashSet::new(),
            modified: false,
        };
        chunk.rebuild();
        Ok(chunk)
    }

    /// Compare the canonical fields only.
    pub fn same_content(&self, other: &WorldChunk) -> bool {
        self.pos == other.pos
            && self.biome == other.biome
            && self.blocks == other.blocks
            && self.heightmap.len() == other.heightmap.len()
            && self
                .heightmap
                .iter()
                .zip(&other.heightmap)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> WorldChunk {
        let mut c = WorldChunk::new(ChunkPos::new(-3, 7), 8, Lod::High);
        for x in 0..CHUNK_SIZE {
            for z in 0..CHUNK_SIZE {
                let h = 1 + (x + z) % 5;
                for y in 0..h {
                    c.put_block(x, y, z, BlockType::Stone);
                }
                c.set_surface(x, z, h as f32 + 0.25);
            }
        }
        c.set_biome(Biome::Desert);
        c.rebuild();
        c
    }

    #[test]
    fn canonical_round_trip_is_exact() {
        let c = sample_chunk();
        let bytes = c.to_canonical_json().unwrap();
        let back = WorldChunk::from_canonical_json(&bytes, Lod::High).unwrap();
        assert!(c.same_content(&back));
        assert_eq!(back.height(), 8);
        assert_eq!(back.mesh().triangles.len(), c.mesh().triangles.len());
    }

    #[test]
    fn canonical_form_uses_camel_case_keys() {
        let bytes = sample_chunk().to_canonical_json().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["chunkX"], -3);
        assert_eq!(v["chunkZ"], 7);
        assert_eq!(v["biome"], 3);
        assert_eq!(v["heightmap"].as_array().unwrap().len(), 256);
        assert_eq!(v["blocks"].as_array().unwrap().len(), 256 * 8);
    }

    #[test]
    fn rejects_bad_block_length() {
        let bad = br#"{"chunkX":0,"chunkZ":0,"biome":0,"heightmap":[],"blocks":[1,2,3]}"#;
        assert!(WorldChunk::from_canonical_json(bad, Lod::High).is_err());
    }

    #[test]
    fn set_block_updates_heightmap_and_flags_modified() {
        let mut c = sample_chunk();
        assert!(!c.is_modified());
        assert!(c.set_block(LocalBlockPos::new(0, 7, 0), BlockType::Wood));
        assert_eq!(c.surface_height(0, 0), 8.0);
        assert!(c.is_modified());
        assert!(!c.set_block(LocalBlockPos::new(0, 8, 0), BlockType::Wood));
    }

    #[test]
    fn file_name_encodes_negative_coordinates_in_hex() {
        let key = ChunkKey::new(-1, 2, Lod::Low);
        assert_eq!(key.file_name(), "chunk_ffffffff_00000002_2.bin");
    }

    #[test]
    fn estimated_size_counts_geometry_and_blocks() {
        let c = sample_chunk();
        let expected = c.mesh().vertices.len() * 44 + c.mesh().triangles.len() * 12 + 256 * 8 + 256 * 4;
        assert_eq!(c.estimated_size(), expected);
    }
}

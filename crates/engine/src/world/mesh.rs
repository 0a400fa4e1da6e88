//! Render and collision geometry derived from chunk blocks.
//!
//! HIGH builds face-culled block quads. MEDIUM and LOW sample the heightmap
//! on a coarser grid. BILLBOARD is a single upright quad. All positions are
//! in world space.

use serde::Serialize;

use super::block::BlockType;
use super::chunk::{Lod, WorldChunk};
use super::position::{CHUNK_SIZE, Vec3};

/// Bytes accounted per vertex (position, normal, colour, uv).
pub const VERTEX_BYTES: usize = 44;
/// Bytes accounted per triangle (three u32 indices).
pub const TRIANGLE_BYTES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Triangle {
    pub v0: u32,
    pub v1: u32,
    pub v2: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkMesh {
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<Triangle>,
}

/// A world-space triangle used by the collision system.
pub type CollisionTriangle = [Vec3; 3];

impl ChunkMesh {
    fn add_quad(&mut self, corners: [Vec3; 4], normal: Vec3) {
        let base = self.vertices.len() as u32;
        for position in corners {
            self.vertices.push(Vertex { position, normal });
        }
        self.triangles.push(Triangle { v0: base, v1: base + 1, v2: base + 2 });
        self.triangles.push(Triangle { v0: base, v1: base + 2, v2: base + 3 });
    }

    /// Triangles expanded to world-space corner triples.
    pub fn triangle_corners(&self) -> Vec<CollisionTriangle> {
        self.triangles
            .iter()
            .filter_map(|t| {
                Some([
                    self.vertices.get(t.v0 as usize)?.position,
                    self.vertices.get(t.v1 as usize)?.position,
                    self.vertices.get(t.v2 as usize)?.position,
                ])
            })
            .collect()
    }

    /// Flat `[x, y, z, ...]` positions for the wire.
    pub fn flat_positions(&self) -> Vec<f32> {
        self.vertices
            .iter()
            .flat_map(|v| [v.position.x, v.position.y, v.position.z])
            .collect()
    }

    /// Flat `[a, b, c, ...]` indices for the wire.
    pub fn flat_indices(&self) -> Vec<u32> {
        self.triangles.iter().flat_map(|t| [t.v0, t.v1, t.v2]).collect()
    }
}

pub(crate) fn build_mesh(chunk: &WorldChunk) -> ChunkMesh {
    match chunk.lod() {
        Lod::High => block_faces(chunk),
        Lod::Medium | Lod::Low => height_grid(chunk, chunk.lod().params().simplification_factor),
        Lod::Billboard => billboard(chunk),
    }
}

pub(crate) fn build_collision(chunk: &WorldChunk) -> Vec<CollisionTriangle> {
    chunk
        .mesh()
        .triangle_corners()
        .into_iter()
        .filter(|t| !is_degenerate(t))
        .collect()
}

/// Collinear or repeated corners.
pub fn is_degenerate(t: &CollisionTriangle) -> bool {
    (t[1] - t[0]).cross(t[2] - t[0]).length_sq() <= 1e-12
}

fn solid_at(chunk: &WorldChunk, x: i32, y: i32, z: i32) -> bool {
    if x < 0 || z < 0 || y < 0 || x >= CHUNK_SIZE as i32 || z >= CHUNK_SIZE as i32 {
        return false;
    }
    if y as usize >= chunk.height() {
        return false;
    }
    chunk
        .get_block(super::position::LocalBlockPos::new(x as u8, y as u16, z as u8))
        .is_solid()
}

fn block_faces(chunk: &WorldChunk) -> ChunkMesh {
    let mut mesh = ChunkMesh::default();
    let origin = chunk.pos().world_origin(0.0);
    for y in 0..chunk.height() as i32 {
        for z in 0..CHUNK_SIZE as i32 {
            for x in 0..CHUNK_SIZE as i32 {
                if !solid_at(chunk, x, y, z) {
                    continue;
                }
                let p = origin + Vec3::new(x as f32, y as f32, z as f32);
                let (x0, y0, z0) = (p.x, p.y, p.z);
                let (x1, y1, z1) = (p.x + 1.0, p.y + 1.0, p.z + 1.0);
                if !solid_at(chunk, x, y + 1, z) {
                    mesh.add_quad(
                        [Vec3::new(x0, y1, z0), Vec3::new(x0, y1, z1), Vec3::new(x1, y1, z1), Vec3::new(x1, y1, z0)],
                        Vec3::new(0.0, 1.0, 0.0),
                    );
                }
                if !solid_at(chunk, x, y - 1, z) {
                    mesh.add_quad(
                        [Vec3::new(x0, y0, z0), Vec3::new(x1, y0, z0), Vec3::new(x1, y0, z1), Vec3::new(x0, y0, z1)],
                        Vec3::new(0.0, -1.0, 0.0),
                    );
                }
                if !solid_at(chunk, x, y, z - 1) {
                    mesh.add_quad(
                        [Vec3::new(x0, y0, z0), Vec3::new(x0, y1, z0), Vec3::new(x1, y1, z0), Vec3::new(x1, y0, z0)],
                        Vec3::new(0.0, 0.0, -1.0),
                    );
                }
                if !solid_at(chunk, x, y, z + 1) {
                    mesh.add_quad(
                        [Vec3::new(x0, y0, z1), Vec3::new(x1, y0, z1), Vec3::new(x1, y1, z1), Vec3::new(x0, y1, z1)],
                        Vec3::new(0.0, 0.0, 1.0),
                    );
                }
                if !solid_at(chunk, x - 1, y, z) {
                    mesh.add_quad(
                        [Vec3::new(x0, y0, z0), Vec3::new(x0, y0, z1), Vec3::new(x0, y1, z1), Vec3::new(x0, y1, z0)],
                        Vec3::new(-1.0, 0.0, 0.0),
                    );
                }
                if !solid_at(chunk, x + 1, y, z) {
                    mesh.add_quad(
                        [Vec3::new(x1, y0, z0), Vec3::new(x1, y1, z0), Vec3::new(x1, y1, z1), Vec3::new(x1, y0, z1)],
                        Vec3::new(1.0, 0.0, 0.0),
                    );
                }
            }
        }
    }
    mesh
}

fn height_grid(chunk: &WorldChunk, step: usize) -> ChunkMesh {
    let mut mesh = ChunkMesh::default();
    let origin = chunk.pos().world_origin(0.0);
    let step = step.clamp(1, CHUNK_SIZE);
    let samples: Vec<usize> = (0..=CHUNK_SIZE).step_by(step).collect();
    let side = samples.len() as u32;

    for &gz in &samples {
        for &gx in &samples {
            let h = chunk.surface_height(gx.min(CHUNK_SIZE - 1), gz.min(CHUNK_SIZE - 1));
            mesh.vertices.push(Vertex {
                position: origin + Vec3::new(gx as f32, h, gz as f32),
                normal: Vec3::UP,
            });
        }
    }
    for row in 0..side.saturating_sub(1) {
        for col in 0..side.saturating_sub(1) {
            let a = row * side + col;
            let b = a + 1;
            let c = a + side;
            let d = c + 1;
            mesh.triangles.push(Triangle { v0: a, v1: c, v2: b });
            mesh.triangles.push(Triangle { v0: b, v1: c, v2: d });
        }
    }
    mesh
}

fn billboard(chunk: &WorldChunk) -> ChunkMesh {
    let mut mesh = ChunkMesh::default();
    let (lo, hi) = chunk
        .heightmap()
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &h| (lo.min(h), hi.max(h)));
    let lo = if lo.is_finite() { lo } else { 0.0 };
    let hi = if hi - lo < 1.0 { lo + 1.0 } else { hi };
    let c = chunk.pos().world_center(0.0);
    let half = CHUNK_SIZE as f32 / 4.0;
    mesh.add_quad(
        [
            Vec3::new(c.x - half, lo, c.z),
            Vec3::new(c.x + half, lo, c.z),
            Vec3::new(c.x + half, hi, c.z),
            Vec3::new(c.x - half, hi, c.z),
        ],
        Vec3::new(0.0, 0.0, 1.0),
    );
    mesh
}

/// Surface colour used when a client asks for tinted geometry.
pub fn block_color(block: BlockType) -> [f32; 3] {
    match block {
        BlockType::Grass => [0.2, 0.8, 0.3],
        BlockType::Dirt => [0.6, 0.4, 0.2],
        BlockType::Stone => [0.5, 0.5, 0.5],
        BlockType::Water => [0.2, 0.4, 0.8],
        BlockType::Sand => [0.9, 0.8, 0.5],
        BlockType::Snow => [0.95, 0.95, 0.95],
        BlockType::Wood => [0.5, 0.3, 0.1],
        BlockType::Leaves => [0.3, 0.7, 0.3],
        BlockType::Air => [1.0, 1.0, 1.0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::position::ChunkPos;

    fn single_block(lod: Lod) -> WorldChunk {
        let mut c = WorldChunk::new(ChunkPos::new(0, 0), 4, lod);
        c.put_block(3, 0, 3, BlockType::Stone);
        c.set_surface(3, 3, 1.0);
        c.rebuild();
        c
    }

    #[test]
    fn isolated_block_has_six_faces() {
        let c = single_block(Lod::High);
        assert_eq!(c.mesh().triangles.len(), 12);
        assert_eq!(c.mesh().vertices.len(), 24);
        assert_eq!(c.collision_triangles().len(), 12);
    }

    #[test]
    fn shared_faces_are_culled() {
        let mut c = WorldChunk::new(ChunkPos::new(0, 0), 4, Lod::High);
        c.put_block(3, 0, 3, BlockType::Stone);
        c.put_block(4, 0, 3, BlockType::Stone);
        c.rebuild();
        assert_eq!(c.mesh().triangles.len(), 20);
    }

    #[test]
    fn coarser_levels_shrink_the_mesh() {
        let medium = single_block(Lod::Medium);
        let low = single_block(Lod::Low);
        assert_eq!(medium.mesh().triangles.len(), 8 * 8 * 2);
        assert_eq!(low.mesh().triangles.len(), 4 * 4 * 2);
        assert!(!medium.collision_triangles().is_empty());
        assert!(low.collision_triangles().is_empty());
    }

    #[test]
    fn billboard_is_one_quad() {
        let c = single_block(Lod::Billboard);
        assert_eq!(c.mesh().triangles.len(), 2);
        assert!(c.mesh().triangle_corners().iter().all(|t| !is_degenerate(t)));
    }

    #[test]
    fn degenerate_detection() {
        let t = [Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0)];
        assert!(is_degenerate(&t));
    }
}

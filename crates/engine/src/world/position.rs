use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Blocks along each horizontal axis of a chunk.
pub const CHUNK_SIZE: usize = 16;
/// World units per block.
pub const BLOCK_SIZE: f32 = 1.0;
/// Horizontal extent of a chunk in world units.
pub const CHUNK_WIDTH: f32 = CHUNK_SIZE as f32 * BLOCK_SIZE;

/// A point or direction in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);
    pub const UP: Vec3 = Vec3::new(0.0, 1.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn dot(self, o: Vec3) -> f32 {
        self.x * o.x + self.y * o.y + self.z * o.z
    }

    #[inline]
    pub fn cross(self, o: Vec3) -> Vec3 {
        Vec3::new(
            self.y * o.z - self.z * o.y,
            self.z * o.x - self.x * o.z,
            self.x * o.y - self.y * o.x,
        )
    }

    #[inline]
    pub fn length_sq(self) -> f32 {
        self.dot(self)
    }

    #[inline]
    pub fn length(self) -> f32 {
        self.length_sq().sqrt()
    }

    /// Unit vector in the same direction, or zero for a zero-length input.
    pub fn normalized(self) -> Vec3 {
        let len = self.length();
        if len <= f32::EPSILON {
            Vec3::ZERO
        } else {
            self / len
        }
    }

    pub fn distance(self, o: Vec3) -> f32 {
        (self - o).length()
    }

    pub fn distance_sq(self, o: Vec3) -> f32 {
        (self - o).length_sq()
    }

    /// Horizontal (XZ-plane) distance.
    pub fn distance_xz(self, o: Vec3) -> f32 {
        let dx = self.x - o.x;
        let dz = self.z - o.z;
        (dx * dx + dz * dz).sqrt()
    }

    pub fn min(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x.min(o.x), self.y.min(o.y), self.z.min(o.z))
    }

    pub fn max(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x.max(o.x), self.y.max(o.y), self.z.max(o.z))
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// The chunk column containing this point.
    pub fn chunk(self) -> ChunkPos {
        ChunkPos::new(
            (self.x / CHUNK_WIDTH).floor() as i32,
            (self.z / CHUNK_WIDTH).floor() as i32,
        )
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, o: Vec3) {
        *self = *self + o;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl SubAssign for Vec3 {
    fn sub_assign(&mut self, o: Vec3) {
        *self = *self - o;
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;
    fn mul(self, s: f32) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Div<f32> for Vec3 {
    type Output = Vec3;
    fn div(self, s: f32) -> Vec3 {
        Vec3::new(self.x / s, self.y / s, self.z / s)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn closest_point(&self, p: Vec3) -> Vec3 {
        p.max(self.min).min(self.max)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Grow to include `p`.
    pub fn expand(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub const fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn contains(&self, p: Vec3) -> bool {
        self.center.distance_sq(p) <= self.radius * self.radius
    }

    pub fn bounds(&self) -> Aabb {
        let r = Vec3::new(self.radius, self.radius, self.radius);
        Aabb::new(self.center - r, self.center + r)
    }
}

/// Chunk column position (each chunk is 16x16 blocks horizontally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// World-space position of the chunk's corner at `y`.
    pub fn world_origin(&self, y: f32) -> Vec3 {
        Vec3::new(self.x as f32 * CHUNK_WIDTH, y, self.z as f32 * CHUNK_WIDTH)
    }

    /// World-space centre of the chunk column at `y`.
    pub fn world_center(&self, y: f32) -> Vec3 {
        Vec3::new(
            self.x as f32 * CHUNK_WIDTH + CHUNK_WIDTH / 2.0,
            y,
            self.z as f32 * CHUNK_WIDTH + CHUNK_WIDTH / 2.0,
        )
    }
}

/// Block position local to a chunk (x, z in 0..16, y in 0..height).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBlockPos {
    pub x: u8,
    pub y: u16,
    pub z: u8,
}

impl LocalBlockPos {
    pub const fn new(x: u8, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Split an absolute block coordinate into its chunk and local offset.
    pub fn from_world(x: i64, y: i64, z: i64) -> Option<(ChunkPos, LocalBlockPos)> {
        if y < 0 || y > u16::MAX as i64 {
            return None;
        }
        let chunk = ChunkPos::new((x >> 4) as i32, (z >> 4) as i32);
        Some((
            chunk,
            LocalBlockPos::new((x & 0xF) as u8, y as u16, (z & 0xF) as u8),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_of_negative_coordinates_floors() {
        assert_eq!(Vec3::new(-0.5, 0.0, 15.9).chunk(), ChunkPos::new(-1, 0));
        assert_eq!(Vec3::new(16.0, 0.0, -16.0).chunk(), ChunkPos::new(1, -1));
    }

    #[test]
    fn local_split_handles_negatives() {
        let (chunk, local) = LocalBlockPos::from_world(-1, 5, 17).unwrap();
        assert_eq!(chunk, ChunkPos::new(-1, 1));
        assert_eq!(local, LocalBlockPos::new(15, 5, 1));
        assert!(LocalBlockPos::from_world(0, -1, 0).is_none());
    }

    #[test]
    fn aabb_closest_point_clamps() {
        let b = Aabb::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(b.closest_point(Vec3::new(2.0, 0.5, -1.0)), Vec3::new(1.0, 0.5, 0.0));
        assert!(b.contains(Vec3::new(0.5, 0.5, 0.5)));
    }
}

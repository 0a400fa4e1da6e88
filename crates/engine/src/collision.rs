//! Narrow-phase collision and raycasting.
//!
//! Dynamic bodies (spheres or boxes, keyed by entity ID) sit in their own
//! [`SpatialGrid`] for broad-phase. Static geometry is registered per chunk
//! column as an AABB plus world-space triangles and a block occupancy mask
//! used for point queries.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::spatial::{EntityId, SpatialGrid};
use crate::world::chunk::{LAYER_AREA, WorldChunk};
use crate::world::mesh::{CollisionTriangle, is_degenerate};
use crate::world::position::{Aabb, CHUNK_SIZE, CHUNK_WIDTH, ChunkPos, Vec3};

const EPSILON: f32 = 1e-6;
/// Largest body radius assumed when widening broad-phase queries.
const MAX_BODY_EXTENT: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyKind {
    World,
    Entity,
    /// Reported on overlap, never pushes anything out.
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Sphere { radius: f32 },
    Box { half_extents: Vec3 },
}

impl Shape {
    fn extent(&self) -> f32 {
        match *self {
            Shape::Sphere { radius } => radius,
            Shape::Box { half_extents } => half_extents.length(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Body {
    center: Vec3,
    shape: Shape,
    kind: BodyKind,
}

struct StaticChunk {
    bounds: Aabb,
    triangles: Vec<CollisionTriangle>,
    /// Solid flags indexed like chunk blocks. Empty for raw triangle soups.
    solid: Vec<bool>,
    height: usize,
}

impl StaticChunk {
    fn solid_at(&self, pos: ChunkPos, p: Vec3) -> bool {
        if self.solid.is_empty() {
            return false;
        }
        let origin = pos.world_origin(0.0);
        let (lx, ly, lz) = (
            (p.x - origin.x).floor() as i64,
            p.y.floor() as i64,
            (p.z - origin.z).floor() as i64,
        );
        if !(0..CHUNK_SIZE as i64).contains(&lx)
            || !(0..CHUNK_SIZE as i64).contains(&lz)
            || !(0..self.height as i64).contains(&ly)
        {
            return false;
        }
        self.solid[lx as usize + lz as usize * CHUNK_SIZE + ly as usize * LAYER_AREA]
    }
}

/// Outcome of [`CollisionSystem::check_collision`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CollisionResult {
    pub collided: bool,
    /// Translation that separates the query sphere from the reported contact.
    pub resolution: Vec3,
    pub normal: Vec3,
    pub penetration: f32,
    pub collided_with: Option<EntityId>,
    pub chunk: Option<ChunkPos>,
    pub kind: Option<BodyKind>,
}

/// Outcome of [`CollisionSystem::raycast`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RaycastHit {
    pub hit: bool,
    pub point: Vec3,
    pub normal: Vec3,
    pub distance: f32,
    pub entity_id: Option<EntityId>,
    pub chunk: Option<ChunkPos>,
}

#[derive(Debug, Clone, Copy)]
struct Contact {
    normal: Vec3,
    penetration: f32,
    entity: Option<EntityId>,
    chunk: Option<ChunkPos>,
    kind: BodyKind,
}

impl Contact {
    /// Deeper first, then entities by ascending id, then chunks by position.
    fn beats(&self, other: &Contact) -> bool {
        if (self.penetration - other.penetration).abs() > EPSILON {
            return self.penetration > other.penetration;
        }
        match (self.entity, other.entity) {
            (Some(a), Some(b)) => a < b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => self.chunk < other.chunk,
        }
    }

    fn into_result(self) -> CollisionResult {
        let resolution = if self.kind == BodyKind::Trigger {
            Vec3::ZERO
        } else {
            self.normal * self.penetration
        };
        CollisionResult {
            collided: true,
            resolution,
            normal: self.normal,
            penetration: self.penetration,
            collided_with: self.entity,
            chunk: self.chunk,
            kind: Some(self.kind),
        }
    }
}

pub struct CollisionSystem {
    bodies: RwLock<HashMap<EntityId, Body>>,
    grid: SpatialGrid,
    chunks: RwLock<HashMap<ChunkPos, StaticChunk>>,
}

impl CollisionSystem {
    pub fn new() -> Self {
        Self {
            bodies: RwLock::new(HashMap::new()),
            grid: SpatialGrid::default(),
            chunks: RwLock::new(HashMap::new()),
        }
    }

    // ── Dynamic bodies ──────────────────────────────────────────────────

    pub fn register_entity(&self, id: EntityId, center: Vec3, radius: f32, kind: BodyKind) {
        self.register_shape(id, center, Shape::Sphere { radius: radius.max(0.0) }, kind);
    }

    pub fn register_box(&self, id: EntityId, center: Vec3, half_extents: Vec3, kind: BodyKind) {
        self.register_shape(id, center, Shape::Box { half_extents }, kind);
    }

    fn register_shape(&self, id: EntityId, center: Vec3, shape: Shape, kind: BodyKind) {
        self.bodies
            .write()
            .expect("collision bodies poisoned")
            .insert(id, Body { center, shape, kind });
        self.grid.insert(id, center);
    }

    /// Move a registered body. Returns false if `id` is unknown.
    pub fn update_entity(&self, id: EntityId, center: Vec3) -> bool {
        let mut bodies = self.bodies.write().expect("collision bodies poisoned");
        let Some(body) = bodies.get_mut(&id) else {
            return false;
        };
        let old = body.center;
        body.center = center;
        drop(bodies);
        self.grid.move_entity(id, old, center);
        true
    }

    pub fn unregister_entity(&self, id: EntityId) -> bool {
        let removed = self.bodies.write().expect("collision bodies poisoned").remove(&id);
        match removed {
            Some(body) => {
                self.grid.remove(id, body.center);
                true
            }
            None => false,
        }
    }

    pub fn has_entity(&self, id: EntityId) -> bool {
        self.bodies.read().expect("collision bodies poisoned").contains_key(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.bodies.read().expect("collision bodies poisoned").len()
    }

    // ── Static geometry ─────────────────────────────────────────────────

    /// Register (or replace) a chunk's collision triangles and block occupancy.
    pub fn register_chunk(&self, chunk: &WorldChunk) {
        let pos = chunk.pos();
        let origin = pos.world_origin(0.0);
        let bounds = Aabb::new(
            origin,
            origin + Vec3::new(CHUNK_WIDTH, chunk.height() as f32, CHUNK_WIDTH),
        );
        let solid = chunk
            .blocks()
            .iter()
            .map(|&b| crate::world::block::BlockType::from_u8(b).is_solid())
            .collect();
        let triangles = chunk
            .collision_triangles()
            .iter()
            .filter(|t| !is_degenerate(t))
            .copied()
            .collect();
        self.chunks.write().expect("collision chunks poisoned").insert(
            pos,
            StaticChunk { bounds, triangles, solid, height: chunk.height() },
        );
    }

    /// Register raw world-space triangles under a chunk column. Bounds are
    /// computed from the triangles; degenerate ones are dropped.
    pub fn register_static(&self, pos: ChunkPos, triangles: Vec<CollisionTriangle>) {
        let triangles: Vec<CollisionTriangle> =
            triangles.into_iter().filter(|t| !is_degenerate(t)).collect();
        let Some(first) = triangles.first() else {
            self.unregister_chunk(pos);
            return;
        };
        let mut bounds = Aabb::new(first[0], first[0]);
        for t in &triangles {
            for &v in t {
                bounds.expand(v);
            }
        }
        self.chunks.write().expect("collision chunks poisoned").insert(
            pos,
            StaticChunk { bounds, triangles, solid: Vec::new(), height: 0 },
        );
    }

    pub fn unregister_chunk(&self, pos: ChunkPos) -> bool {
        self.chunks.write().expect("collision chunks poisoned").remove(&pos).is_some()
    }

    pub fn has_chunk(&self, pos: ChunkPos) -> bool {
        self.chunks.read().expect("collision chunks poisoned").contains_key(&pos)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().expect("collision chunks poisoned").len()
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Deepest contact between the sphere at `pos` and everything registered,
    /// skipping `exclude`. Triggers are reported only when nothing solid is hit.
    /// A zero radius tests the point against solid volumes.
    pub fn check_collision(&self, pos: Vec3, radius: f32, exclude: Option<EntityId>) -> CollisionResult {
        let radius = radius.max(0.0);
        let mut best_solid: Option<Contact> = None;
        let mut best_trigger: Option<Contact> = None;
        let mut offer = |c: Contact| {
            let slot = if c.kind == BodyKind::Trigger { &mut best_trigger } else { &mut best_solid };
            if slot.as_ref().is_none_or(|cur| c.beats(cur)) {
                *slot = Some(c);
            }
        };

        {
            let bodies = self.bodies.read().expect("collision bodies poisoned");
            for id in self.grid.query_radius(pos, radius + MAX_BODY_EXTENT) {
                if Some(id) == exclude {
                    continue;
                }
                let Some(body) = bodies.get(&id) else { continue };
                if let Some((normal, penetration)) = body_contact(body, pos, radius) {
                    offer(Contact { normal, penetration, entity: Some(id), chunk: None, kind: body.kind });
                }
            }
            // Oversized bodies may not be found through the grid.
            for (&id, body) in bodies.iter() {
                if body.shape.extent() <= MAX_BODY_EXTENT || Some(id) == exclude {
                    continue;
                }
                if let Some((normal, penetration)) = body_contact(body, pos, radius) {
                    offer(Contact { normal, penetration, entity: Some(id), chunk: None, kind: body.kind });
                }
            }
        }

        let chunks = self.chunks.read().expect("collision chunks poisoned");
        for (&cpos, chunk) in chunks.iter() {
            if chunk.bounds.closest_point(pos).distance_sq(pos) > radius * radius + EPSILON {
                continue;
            }
            if radius <= EPSILON {
                if chunk.solid_at(cpos, pos) {
                    let (normal, penetration) = block_exit(pos);
                    offer(Contact { normal, penetration, entity: None, chunk: Some(cpos), kind: BodyKind::World });
                }
                continue;
            }
            for tri in &chunk.triangles {
                if let Some((normal, penetration)) = sphere_triangle(pos, radius, tri) {
                    offer(Contact { normal, penetration, entity: None, chunk: Some(cpos), kind: BodyKind::World });
                }
            }
        }

        best_solid
            .or(best_trigger)
            .map(Contact::into_result)
            .unwrap_or_default()
    }

    /// Apply up to `max_iterations` resolutions and return the final position
    /// along with the first solid contact encountered.
    pub fn resolve(
        &self,
        pos: Vec3,
        radius: f32,
        exclude: Option<EntityId>,
        max_iterations: usize,
    ) -> (Vec3, Option<CollisionResult>) {
        let mut current = pos;
        let mut first = None;
        for _ in 0..max_iterations.max(1) {
            let result = self.check_collision(current, radius, exclude);
            if !result.collided || result.kind == Some(BodyKind::Trigger) {
                break;
            }
            first.get_or_insert(result);
            current += result.resolution;
        }
        (current, first)
    }

    /// Trigger bodies overlapping the sphere, ascending by id.
    pub fn triggers_at(&self, pos: Vec3, radius: f32) -> Vec<EntityId> {
        let bodies = self.bodies.read().expect("collision bodies poisoned");
        let mut out: Vec<EntityId> = bodies
            .iter()
            .filter(|(_, b)| b.kind == BodyKind::Trigger)
            .filter(|(_, b)| body_contact(b, pos, radius.max(0.0)).is_some())
            .map(|(&id, _)| id)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn raycast(&self, origin: Vec3, dir: Vec3, max_dist: f32) -> RaycastHit {
        self.raycast_excluding(origin, dir, max_dist, None)
    }

    /// Earliest intersection along the ray within `max_dist`. Triggers are ignored.
    pub fn raycast_excluding(
        &self,
        origin: Vec3,
        dir: Vec3,
        max_dist: f32,
        exclude: Option<EntityId>,
    ) -> RaycastHit {
        let dir = dir.normalized();
        if dir == Vec3::ZERO || !origin.is_finite() || !(max_dist > 0.0) {
            return RaycastHit::default();
        }
        let mut best = RaycastHit { distance: max_dist, ..RaycastHit::default() };

        {
            let bodies = self.bodies.read().expect("collision bodies poisoned");
            for (&id, body) in bodies.iter() {
                if Some(id) == exclude || body.kind == BodyKind::Trigger {
                    continue;
                }
                let hit = match body.shape {
                    Shape::Sphere { radius } => ray_sphere(origin, dir, body.center, radius),
                    Shape::Box { half_extents } => {
                        let aabb = Aabb::new(body.center - half_extents, body.center + half_extents);
                        ray_aabb(origin, dir, &aabb)
                    }
                };
                if let Some((t, normal)) = hit {
                    if t < best.distance || (!best.hit && t <= max_dist) {
                        best = RaycastHit {
                            hit: true,
                            point: origin + dir * t,
                            normal,
                            distance: t,
                            entity_id: Some(id),
                            chunk: None,
                        };
                    }
                }
            }
        }

        let chunks = self.chunks.read().expect("collision chunks poisoned");
        for (&cpos, chunk) in chunks.iter() {
            let Some((enter, _)) = ray_aabb(origin, dir, &chunk.bounds) else { continue };
            if enter > best.distance {
                continue;
            }
            for tri in &chunk.triangles {
                let Some(t) = ray_triangle(origin, dir, tri) else { continue };
                if t < best.distance || (!best.hit && t <= max_dist) {
                    let mut normal = face_normal(tri);
                    if normal.dot(dir) > 0.0 {
                        normal = -normal;
                    }
                    best = RaycastHit {
                        hit: true,
                        point: origin + dir * t,
                        normal,
                        distance: t,
                        entity_id: None,
                        chunk: Some(cpos),
                    };
                }
            }
        }

        if best.hit { best } else { RaycastHit::default() }
    }
}

impl Default for CollisionSystem {
    fn default() -> Self {
        Self::new()
    }
}

// ── Narrow phase ────────────────────────────────────────────────────────

fn body_contact(body: &Body, pos: Vec3, radius: f32) -> Option<(Vec3, f32)> {
    match body.shape {
        Shape::Sphere { radius: r } => sphere_sphere(pos, radius, body.center, r),
        Shape::Box { half_extents } => {
            let aabb = Aabb::new(body.center - half_extents, body.center + half_extents);
            sphere_aabb(pos, radius, &aabb)
        }
    }
}

/// Normal pointing from `b` toward `a` and the overlap depth.
pub fn sphere_sphere(a: Vec3, ra: f32, b: Vec3, rb: f32) -> Option<(Vec3, f32)> {
    let delta = a - b;
    let dist_sq = delta.length_sq();
    let sum = ra + rb;
    if dist_sq > sum * sum || (sum <= 0.0 && dist_sq > 0.0) {
        return None;
    }
    let dist = dist_sq.sqrt();
    if dist >= sum && sum > 0.0 {
        return None;
    }
    let normal = if dist > EPSILON { delta / dist } else { Vec3::UP };
    Some((normal, sum - dist))
}

/// Sphere against box via the closest point on the box (Minkowski sum test).
pub fn sphere_aabb(center: Vec3, radius: f32, aabb: &Aabb) -> Option<(Vec3, f32)> {
    let closest = aabb.closest_point(center);
    let delta = center - closest;
    let dist_sq = delta.length_sq();
    if dist_sq > EPSILON * EPSILON {
        let dist = dist_sq.sqrt();
        if dist >= radius {
            return None;
        }
        return Some((delta / dist, radius - dist));
    }
    // Centre inside the box: leave through the nearest face.
    let exits = [
        (center.x - aabb.min.x, Vec3::new(-1.0, 0.0, 0.0)),
        (aabb.max.x - center.x, Vec3::new(1.0, 0.0, 0.0)),
        (center.y - aabb.min.y, Vec3::new(0.0, -1.0, 0.0)),
        (aabb.max.y - center.y, Vec3::new(0.0, 1.0, 0.0)),
        (center.z - aabb.min.z, Vec3::new(0.0, 0.0, -1.0)),
        (aabb.max.z - center.z, Vec3::new(0.0, 0.0, 1.0)),
    ];
    let (depth, normal) = exits
        .into_iter()
        .fold((f32::MAX, Vec3::UP), |acc, e| if e.0 < acc.0 { e } else { acc });
    Some((normal, depth + radius))
}

/// Sphere against a triangle. The contact normal is the face normal, oriented
/// toward the sphere centre.
pub fn sphere_triangle(center: Vec3, radius: f32, tri: &CollisionTriangle) -> Option<(Vec3, f32)> {
    if is_degenerate(tri) {
        return None;
    }
    let closest = closest_point_on_triangle(center, tri);
    let dist_sq = closest.distance_sq(center);
    if dist_sq >= radius * radius {
        return None;
    }
    let mut normal = face_normal(tri);
    if (center - tri[0]).dot(normal) < 0.0 {
        normal = -normal;
    }
    // Depth along the face normal that clears `closest`. Equals
    // `radius - dist` inside the face and grows near edges and vertices.
    let offset = center - closest;
    let along = offset.dot(normal).max(0.0);
    let lateral_sq = (dist_sq - along * along).max(0.0);
    Some((normal, (radius * radius - lateral_sq).sqrt() - along))
}

pub fn face_normal(tri: &CollisionTriangle) -> Vec3 {
    (tri[1] - tri[0]).cross(tri[2] - tri[0]).normalized()
}

/// Closest point to `p` on the triangle, by Voronoi region.
pub fn closest_point_on_triangle(p: Vec3, tri: &CollisionTriangle) -> Vec3 {
    let [a, b, c] = *tri;
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }
    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }
    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        return a + ab * (d1 / (d1 - d3));
    }
    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }
    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        return a + ac * (d2 / (d2 - d6));
    }
    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        return b + (c - b) * ((d4 - d3) / ((d4 - d3) + (d5 - d6)));
    }
    let denom = 1.0 / (va + vb + vc);
    a + ab * (vb * denom) + ac * (vc * denom)
}

/// Möller–Trumbore. Returns the distance along a unit `dir`.
pub fn ray_triangle(origin: Vec3, dir: Vec3, tri: &CollisionTriangle) -> Option<f32> {
    let [v0, v1, v2] = *tri;
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    let s = origin - v0;
    let u = s.dot(p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = dir.dot(q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv;
    (t > EPSILON).then_some(t)
}

pub fn ray_sphere(origin: Vec3, dir: Vec3, center: Vec3, radius: f32) -> Option<(f32, Vec3)> {
    let oc = origin - center;
    let b = oc.dot(dir);
    let c = oc.length_sq() - radius * radius;
    if c > 0.0 && b > 0.0 {
        return None;
    }
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()).max(0.0);
    let point = origin + dir * t;
    let normal = (point - center).normalized();
    Some((t, if normal == Vec3::ZERO { -dir } else { normal }))
}

/// Slab test. Returns the entry distance (0 when starting inside) and the
/// normal of the entry face.
pub fn ray_aabb(origin: Vec3, dir: Vec3, aabb: &Aabb) -> Option<(f32, Vec3)> {
    let mut t_min = 0.0f32;
    let mut t_max = f32::INFINITY;
    let mut normal = -dir;
    let axes = [
        (origin.x, dir.x, aabb.min.x, aabb.max.x, Vec3::new(1.0, 0.0, 0.0)),
        (origin.y, dir.y, aabb.min.y, aabb.max.y, Vec3::new(0.0, 1.0, 0.0)),
        (origin.z, dir.z, aabb.min.z, aabb.max.z, Vec3::new(0.0, 0.0, 1.0)),
    ];
    for (o, d, lo, hi, axis) in axes {
        if d.abs() < EPSILON {
            if o < lo || o > hi {
                return None;
            }
            continue;
        }
        let inv = 1.0 / d;
        let (mut t0, mut t1) = ((lo - o) * inv, (hi - o) * inv);
        let mut face = -axis;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
            face = axis;
        }
        if t0 > t_min {
            t_min = t0;
            normal = face;
        }
        t_max = t_max.min(t1);
        if t_min > t_max {
            return None;
        }
    }
    Some((t_min, normal))
}

/// Shortest way out of the unit block containing `p`.
fn block_exit(p: Vec3) -> (Vec3, f32) {
    let f = Vec3::new(p.x - p.x.floor(), p.y - p.y.floor(), p.z - p.z.floor());
    let exits = [
        (f.x, Vec3::new(-1.0, 0.0, 0.0)),
        (1.0 - f.x, Vec3::new(1.0, 0.0, 0.0)),
        (f.y, Vec3::new(0.0, -1.0, 0.0)),
        (1.0 - f.y, Vec3::new(0.0, 1.0, 0.0)),
        (f.z, Vec3::new(0.0, 0.0, -1.0)),
        (1.0 - f.z, Vec3::new(0.0, 0.0, 1.0)),
    ];
    let (depth, normal) = exits
        .into_iter()
        .fold((f32::MAX, Vec3::UP), |acc, e| if e.0 < acc.0 { e } else { acc });
    (normal, depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::block::BlockType;
    use crate::world::chunk::Lod;

    fn wall_at_x(x: f32) -> Vec<CollisionTriangle> {
        let a = Vec3::new(x, 0.0, 0.0);
        let b = Vec3::new(x, 40.0, 0.0);
        let c = Vec3::new(x, 40.0, 16.0);
        let d = Vec3::new(x, 0.0, 16.0);
        vec![[a, b, c], [a, c, d]]
    }

    #[test]
    fn empty_system_reports_nothing() {
        let cs = CollisionSystem::new();
        assert!(!cs.check_collision(Vec3::ZERO, 1.0, None).collided);
        assert!(!cs.raycast(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), 100.0).hit);
    }

    #[test]
    fn sphere_against_wall_resolves_out() {
        let cs = CollisionSystem::new();
        cs.register_static(ChunkPos::new(0, 0), wall_at_x(10.5));
        let r = cs.check_collision(Vec3::new(10.4, 20.0, 8.0), 0.5, None);
        assert!(r.collided);
        assert_eq!(r.kind, Some(BodyKind::World));
        assert!((r.penetration - 0.4).abs() < 1e-4);
        let fixed = Vec3::new(10.4, 20.0, 8.0) + r.resolution;
        assert!(fixed.x <= 10.5 - 0.5 + 1e-4);
    }

    #[test]
    fn deepest_contact_wins_and_ties_go_to_lowest_id() {
        let cs = CollisionSystem::new();
        cs.register_entity(5, Vec3::new(1.0, 0.0, 0.0), 1.0, BodyKind::Entity);
        cs.register_entity(3, Vec3::new(-1.0, 0.0, 0.0), 1.0, BodyKind::Entity);
        let r = cs.check_collision(Vec3::ZERO, 0.5, None);
        assert_eq!(r.collided_with, Some(3));

        cs.register_entity(9, Vec3::new(0.0, 0.2, 0.0), 1.0, BodyKind::Entity);
        let r = cs.check_collision(Vec3::ZERO, 0.5, None);
        assert_eq!(r.collided_with, Some(9));

        let r = cs.check_collision(Vec3::ZERO, 0.5, Some(9));
        assert_eq!(r.collided_with, Some(3));
    }

    #[test]
    fn triggers_overlap_without_pushing() {
        let cs = CollisionSystem::new();
        cs.register_entity(1, Vec3::ZERO, 2.0, BodyKind::Trigger);
        let r = cs.check_collision(Vec3::new(0.5, 0.0, 0.0), 0.5, None);
        assert!(r.collided);
        assert_eq!(r.kind, Some(BodyKind::Trigger));
        assert_eq!(r.resolution, Vec3::ZERO);
        assert_eq!(cs.triggers_at(Vec3::ZERO, 0.0), vec![1]);
    }

    #[test]
    fn zero_radius_is_a_point_test() {
        let cs = CollisionSystem::new();
        let mut chunk = WorldChunk::new(ChunkPos::new(0, 0), 4, Lod::High);
        chunk.set_block(crate::world::position::LocalBlockPos::new(2, 1, 2), BlockType::Stone);
        chunk.rebuild();
        cs.register_chunk(&chunk);

        let inside = cs.check_collision(Vec3::new(2.5, 1.9, 2.5), 0.0, None);
        assert!(inside.collided);
        assert_eq!(inside.normal, Vec3::UP);
        assert!((inside.penetration - 0.1).abs() < 1e-4);
        assert!(!cs.check_collision(Vec3::new(3.5, 1.5, 2.5), 0.0, None).collided);

        cs.register_entity(4, Vec3::new(20.0, 0.0, 0.0), 1.0, BodyKind::Entity);
        assert!(cs.check_collision(Vec3::new(20.5, 0.0, 0.0), 0.0, None).collided);
        assert!(!cs.check_collision(Vec3::new(21.5, 0.0, 0.0), 0.0, None).collided);
    }

    #[test]
    fn degenerate_triangles_are_ignored() {
        let cs = CollisionSystem::new();
        let line = [Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0)];
        cs.register_static(ChunkPos::new(0, 0), vec![line]);
        assert!(!cs.has_chunk(ChunkPos::new(0, 0)));
        assert!(!cs.check_collision(Vec3::new(1.0, 0.0, 0.0), 1.0, None).collided);
    }

    #[test]
    fn raycast_returns_earliest_hit() {
        let cs = CollisionSystem::new();
        cs.register_static(ChunkPos::new(0, 0), wall_at_x(10.0));
        cs.register_entity(7, Vec3::new(5.0, 20.0, 8.0), 1.0, BodyKind::Entity);
        let hit = cs.raycast(Vec3::new(0.0, 20.0, 8.0), Vec3::new(1.0, 0.0, 0.0), 100.0);
        assert!(hit.hit);
        assert_eq!(hit.entity_id, Some(7));
        assert!((hit.distance - 4.0).abs() < 1e-4);
        assert_eq!(hit.normal, Vec3::new(-1.0, 0.0, 0.0));

        let past = cs.raycast_excluding(Vec3::new(0.0, 20.0, 5.0), Vec3::new(1.0, 0.0, 0.0), 100.0, Some(7));
        assert_eq!(past.chunk, Some(ChunkPos::new(0, 0)));
        assert!((past.distance - 10.0).abs() < 1e-4);
        assert_eq!(past.normal, Vec3::new(-1.0, 0.0, 0.0));

        assert!(!cs.raycast(Vec3::new(0.0, 20.0, 8.0), Vec3::new(1.0, 0.0, 0.0), 3.0).hit);
    }

    #[test]
    fn vertex_hit_uses_face_normal() {
        let tri = [Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0)];
        let (normal, _) = sphere_triangle(Vec3::new(-0.1, 0.1, -0.1), 0.5, &tri).unwrap();
        assert!((normal.y.abs() - 1.0).abs() < 1e-5);
        assert!(normal.y > 0.0);
    }

    #[test]
    fn edge_contact_depth_separates_along_the_face_normal() {
        let tri = [Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0)];
        let center = Vec3::new(-0.1, 0.1, -0.1);
        let (normal, depth) = sphere_triangle(center, 0.5, &tri).unwrap();
        assert!((depth - (0.23f32.sqrt() - 0.1)).abs() < 1e-4);
        assert!(sphere_triangle(center + normal * (depth + 1e-3), 0.5, &tri).is_none());

        let (_, inside) = sphere_triangle(Vec3::new(0.2, 0.3, 0.2), 0.5, &tri).unwrap();
        assert!((inside - 0.2).abs() < 1e-5);
    }

    #[test]
    fn box_bodies_push_out_through_nearest_face() {
        let cs = CollisionSystem::new();
        cs.register_box(2, Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0), BodyKind::Entity);
        let r = cs.check_collision(Vec3::new(1.3, 0.0, 0.0), 0.5, None);
        assert!(r.collided);
        assert!((r.normal.x - 1.0).abs() < 1e-5);
        assert!((r.penetration - 0.2).abs() < 1e-4);
        let ray = cs.raycast(Vec3::new(-5.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), 10.0);
        assert!((ray.distance - 4.0).abs() < 1e-4);
    }

    #[test]
    fn update_and_unregister_keep_grid_in_sync() {
        let cs = CollisionSystem::new();
        cs.register_entity(1, Vec3::ZERO, 1.0, BodyKind::Entity);
        assert!(cs.update_entity(1, Vec3::new(50.0, 0.0, 0.0)));
        assert!(!cs.check_collision(Vec3::ZERO, 0.5, None).collided);
        assert!(cs.check_collision(Vec3::new(50.0, 0.0, 0.0), 0.5, None).collided);
        assert!(cs.unregister_entity(1));
        assert!(!cs.update_entity(1, Vec3::ZERO));
        assert_eq!(cs.entity_count(), 0);
    }

    #[test]
    fn resolve_separates_from_corner() {
        let cs = CollisionSystem::new();
        let mut tris = wall_at_x(10.5);
        let a = Vec3::new(0.0, 0.0, 10.5);
        let b = Vec3::new(0.0, 40.0, 10.5);
        let c = Vec3::new(16.0, 40.0, 10.5);
        let d = Vec3::new(16.0, 0.0, 10.5);
        tris.push([a, b, c]);
        tris.push([a, c, d]);
        cs.register_static(ChunkPos::new(0, 0), tris);
        let (pos, first) = cs.resolve(Vec3::new(10.3, 20.0, 10.2), 0.5, None, 4);
        assert!(first.is_some());
        assert!(!cs.check_collision(pos, 0.5 - 1e-3, None).collided);
    }
}

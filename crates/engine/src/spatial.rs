//! Uniform grid broad-phase index.
//!
//! Maps quantized cells to the entity IDs whose latest position falls inside
//! them. Callers refine results with exact distance checks.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::world::position::Vec3;

pub type EntityId = u64;

pub const DEFAULT_CELL_SIZE: f32 = 10.0;

/// Quantized cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Default)]
struct GridInner {
    cells: HashMap<CellKey, HashSet<EntityId>>,
    locations: HashMap<EntityId, CellKey>,
}

impl GridInner {
    fn detach(&mut self, id: EntityId) -> Option<CellKey> {
        let cell = self.locations.remove(&id)?;
        if let Some(set) = self.cells.get_mut(&cell) {
            set.remove(&id);
            if set.is_empty() {
                self.cells.remove(&cell);
            }
        }
        Some(cell)
    }

    fn attach(&mut self, id: EntityId, cell: CellKey) {
        self.cells.entry(cell).or_default().insert(id);
        self.locations.insert(id, cell);
    }
}

/// Thread-safe uniform grid guarded by a single lock.
pub struct SpatialGrid {
    cell_size: f32,
    inner: Mutex<GridInner>,
}

impl SpatialGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size: if cell_size > 0.0 { cell_size } else { DEFAULT_CELL_SIZE },
            inner: Mutex::new(GridInner::default()),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn cell_key(&self, pos: Vec3) -> CellKey {
        CellKey {
            x: (pos.x / self.cell_size).floor() as i32,
            y: (pos.y / self.cell_size).floor() as i32,
            z: (pos.z / self.cell_size).floor() as i32,
        }
    }

    /// Register `id` at `pos`. Re-inserting an existing ID moves it.
    pub fn insert(&self, id: EntityId, pos: Vec3) {
        let cell = self.cell_key(pos);
        let mut inner = self.inner.lock().expect("spatial grid poisoned");
        inner.detach(id);
        inner.attach(id, cell);
    }

    /// Remove `id`. The recorded cell is authoritative; `pos` is only a hint.
    pub fn remove(&self, id: EntityId, _pos: Vec3) -> bool {
        self.inner.lock().expect("spatial grid poisoned").detach(id).is_some()
    }

    /// Move `id` from `old` to `new`, touching cells only when the cell changes.
    pub fn move_entity(&self, id: EntityId, old: Vec3, new: Vec3) {
        let new_cell = self.cell_key(new);
        let mut inner = self.inner.lock().expect("spatial grid poisoned");
        let current = inner.locations.get(&id).copied();
        match current {
            Some(cell) if cell == new_cell => {}
            Some(_) => {
                inner.detach(id);
                inner.attach(id, new_cell);
            }
            None => {
                tracing::debug!("spatial move of unregistered entity {} from {:?}", id, old);
                inner.attach(id, new_cell);
            }
        }
    }

    /// IDs in every cell overlapping the cube of half-extent `radius` around `center`.
    /// Sorted ascending.
    pub fn query_radius(&self, center: Vec3, radius: f32) -> Vec<EntityId> {
        let r = radius.max(0.0);
        let min = self.cell_key(center - Vec3::new(r, r, r));
        let max = self.cell_key(center + Vec3::new(r, r, r));
        self.query_cells(min, max)
    }

    /// IDs in all cells of the inclusive box `min..=max`. Sorted ascending.
    pub fn query_cells(&self, min: CellKey, max: CellKey) -> Vec<EntityId> {
        let inner = self.inner.lock().expect("spatial grid poisoned");
        let mut out = Vec::new();
        let volume = (max.x - min.x + 1) as i64 * (max.y - min.y + 1) as i64 * (max.z - min.z + 1) as i64;
        if volume > inner.cells.len() as i64 {
            // Sparse grid: scanning occupied cells is cheaper than visiting the box.
            for (cell, ids) in &inner.cells {
                if (min.x..=max.x).contains(&cell.x)
                    && (min.y..=max.y).contains(&cell.y)
                    && (min.z..=max.z).contains(&cell.z)
                {
                    out.extend(ids.iter().copied());
                }
            }
        } else {
            for x in min.x..=max.x {
                for y in min.y..=max.y {
                    for z in min.z..=max.z {
                        if let Some(ids) = inner.cells.get(&CellKey { x, y, z }) {
                            out.extend(ids.iter().copied());
                        }
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    pub fn cell_of(&self, id: EntityId) -> Option<CellKey> {
        self.inner.lock().expect("spatial grid poisoned").locations.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("spatial grid poisoned").locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cells listing `id`. Always 0 or 1.
    pub fn occurrences(&self, id: EntityId) -> usize {
        let inner = self.inner.lock().expect("spatial grid poisoned");
        inner.cells.values().filter(|ids| ids.contains(&id)).count()
    }
}

impl Default for SpatialGrid {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE)
    }
}

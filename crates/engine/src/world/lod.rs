//! Distance-based LOD selection with hysteresis.
//!
//! The nominal level for a distance `d` is HIGH for `d <= 50`, MEDIUM for
//! `d <= 150`, LOW for `d <= 500` and BILLBOARD beyond. Once a column has a
//! level, moving finer needs `d < threshold * 0.8` and moving coarser needs
//! `d > threshold * 1.2`, where `threshold` is the upper bound of the finer
//! of the two levels involved.

use std::collections::HashMap;
use std::sync::RwLock;

use super::chunk::Lod;
use super::position::{ChunkPos, Vec3};

pub const UPGRADE_FACTOR: f32 = 0.8;
pub const DOWNGRADE_FACTOR: f32 = 1.2;

#[derive(Debug, Clone, Copy)]
pub struct LodThresholds {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for LodThresholds {
    fn default() -> Self {
        Self { high: 50.0, medium: 150.0, low: 500.0 }
    }
}

impl LodThresholds {
    /// Upper distance bound of `lod`. BILLBOARD is unbounded.
    pub fn upper(&self, lod: Lod) -> f32 {
        match lod {
            Lod::High => self.high,
            Lod::Medium => self.medium,
            Lod::Low => self.low,
            Lod::Billboard => f32::INFINITY,
        }
    }

    /// Level chosen with no history.
    pub fn nominal(&self, distance: f32) -> Lod {
        if distance <= self.high {
            Lod::High
        } else if distance <= self.medium {
            Lod::Medium
        } else if distance <= self.low {
            Lod::Low
        } else {
            Lod::Billboard
        }
    }

    /// Apply hysteresis to move from `current` toward the nominal level for `distance`.
    pub fn transition(&self, current: Lod, distance: f32) -> Lod {
        let target = self.nominal(distance);
        let mut lod = current;
        while lod > target {
            let finer = lod.finer();
            if distance < self.upper(finer) * UPGRADE_FACTOR {
                lod = finer;
            } else {
                break;
            }
        }
        while lod < target {
            if distance > self.upper(lod) * DOWNGRADE_FACTOR {
                lod = lod.coarser();
            } else {
                break;
            }
        }
        lod
    }
}

/// Remembers the last level handed out per chunk column.
pub struct LodManager {
    thresholds: LodThresholds,
    current: RwLock<HashMap<ChunkPos, Lod>>,
}

impl LodManager {
    pub fn new(thresholds: LodThresholds) -> Self {
        Self {
            thresholds,
            current: RwLock::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> &LodThresholds {
        &self.thresholds
    }

    /// Level for a chunk at `distance`, updating the remembered level.
    pub fn select(&self, pos: ChunkPos, distance: f32) -> Lod {
        let mut current = self.current.write().expect("lod table poisoned");
        let lod = match current.get(&pos) {
            Some(&prev) => self.thresholds.transition(prev, distance),
            None => self.thresholds.nominal(distance),
        };
        current.insert(pos, lod);
        lod
    }

    /// Level for the chunk column relative to a viewer position.
    pub fn select_for_view(&self, pos: ChunkPos, view: Vec3) -> Lod {
        let center = pos.world_center(view.y);
        self.select(pos, center.distance_xz(view))
    }

    /// What `select` would return, without recording it.
    pub fn peek(&self, pos: ChunkPos, distance: f32) -> Lod {
        let current = self.current.read().expect("lod table poisoned");
        match current.get(&pos) {
            Some(&prev) => self.thresholds.transition(prev, distance),
            None => self.thresholds.nominal(distance),
        }
    }

    pub fn current(&self, pos: ChunkPos) -> Option<Lod> {
        self.current.read().expect("lod table poisoned").get(&pos).copied()
    }

    pub fn forget(&self, pos: ChunkPos) {
        self.current.write().expect("lod table poisoned").remove(&pos);
    }
}

impl Default for LodManager {
    fn default() -> Self {
        Self::new(LodThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(path: &[f32]) -> Lod {
        let m = LodManager::default();
        let pos = ChunkPos::new(0, 0);
        let mut lod = Lod::High;
        for &d in path {
            lod = m.select(pos, d);
        }
        lod
    }

    #[test]
    fn nominal_levels() {
        let t = LodThresholds::default();
        assert_eq!(t.nominal(50.0), Lod::High);
        assert_eq!(t.nominal(50.1), Lod::Medium);
        assert_eq!(t.nominal(150.0), Lod::Medium);
        assert_eq!(t.nominal(500.0), Lod::Low);
        assert_eq!(t.nominal(500.5), Lod::Billboard);
    }

    #[test]
    fn small_excursions_do_not_flicker() {
        assert_eq!(run(&[48.0, 52.0]), Lod::High);
        assert_eq!(run(&[48.0, 40.0, 60.0]), Lod::High);
    }

    #[test]
    fn large_excursion_downgrades() {
        assert_eq!(run(&[48.0, 70.0]), Lod::Medium);
    }

    #[test]
    fn exact_threshold_does_not_transition() {
        assert_eq!(run(&[48.0, 60.0]), Lod::High);
        // MEDIUM back to HIGH needs d < 40.
        assert_eq!(run(&[48.0, 70.0, 40.0]), Lod::Medium);
        assert_eq!(run(&[48.0, 70.0, 39.9]), Lod::High);
    }

    #[test]
    fn multi_level_moves_step_through_each_threshold() {
        assert_eq!(run(&[10.0, 2000.0]), Lod::Billboard);
        assert_eq!(run(&[10.0, 600.0]), Lod::Low);
        assert_eq!(run(&[2000.0, 5.0]), Lod::High);
    }

    #[test]
    fn forget_resets_history() {
        let m = LodManager::default();
        let pos = ChunkPos::new(1, 1);
        m.select(pos, 48.0);
        assert_eq!(m.select(pos, 55.0), Lod::High);
        m.forget(pos);
        assert_eq!(m.select(pos, 55.0), Lod::Medium);
    }
}

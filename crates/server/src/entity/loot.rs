//! Weighted loot tables rolled on mob death.
//!
//! Generation is a pure function of the table, the killer's level and luck,
//! and the supplied RNG, so a seeded `StdRng` reproduces a drop exactly.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
    Mythic,
}

impl Rarity {
    const ORDER: [Rarity; 6] = [
        Rarity::Common,
        Rarity::Uncommon,
        Rarity::Rare,
        Rarity::Epic,
        Rarity::Legendary,
        Rarity::Mythic,
    ];

    /// `steps` tiers above `self`, capped at `max`.
    fn raised(self, steps: usize, max: Rarity) -> Rarity {
        let idx = (self as usize + steps).min(Self::ORDER.len() - 1);
        Self::ORDER[idx].min(max)
    }

    pub fn stat_multiplier(self) -> f32 {
        match self {
            Rarity::Common => 1.0,
            Rarity::Uncommon => 1.2,
            Rarity::Rare => 1.5,
            Rarity::Epic => 2.0,
            Rarity::Legendary => 3.0,
            Rarity::Mythic => 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootEntry {
    pub item_id: String,
    pub chance: f32,
    pub min_quantity: u32,
    pub max_quantity: u32,
    pub min_level: u32,
    pub max_level: u32,
    pub min_rarity: Rarity,
    pub max_rarity: Rarity,
    /// Tags (quest or faction) the killer must hold.
    #[serde(default)]
    pub requirements: Vec<String>,
}

impl LootEntry {
    fn new(item_id: &str, qty: (u32, u32), chance: f32, levels: (u32, u32)) -> Self {
        LootEntry {
            item_id: item_id.to_string(),
            chance,
            min_quantity: qty.0,
            max_quantity: qty.1,
            min_level: levels.0,
            max_level: levels.1,
            min_rarity: Rarity::Common,
            max_rarity: Rarity::Common,
            requirements: Vec::new(),
        }
    }

    fn rarities(mut self, min: Rarity, max: Rarity) -> Self {
        self.min_rarity = min;
        self.max_rarity = max;
        self
    }

    fn eligible(&self, player_level: u32, tags: &HashSet<&str>) -> bool {
        (self.min_level..=self.max_level).contains(&player_level)
            && self.requirements.iter().all(|r| tags.contains(r.as_str()))
    }

    fn item_level(&self) -> u32 {
        self.min_level.max(self.max_level / 2)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootTable {
    pub id: String,
    pub entries: Vec<LootEntry>,
    #[serde(default)]
    pub guaranteed_drops: usize,
    pub max_drops: usize,
    #[serde(default)]
    pub unique_drops: bool,
    #[serde(default)]
    pub gold_range: (u64, u64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LootDrop {
    pub item_id: String,
    pub quantity: u32,
    pub rarity: Rarity,
    pub level: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LootRoll {
    pub items: Vec<LootDrop>,
    pub gold: u64,
}

/// Drop-chance modifier for a player well above or below the item's level.
pub fn level_factor(player_level: u32, item_level: u32) -> f32 {
    if player_level > item_level + 10 {
        0.5
    } else if player_level + 5 < item_level {
        0.75
    } else {
        1.0
    }
}

pub fn adjusted_chance(base: f32, luck: f32, player_level: u32, item_level: u32) -> f32 {
    (base * luck * level_factor(player_level, item_level)).clamp(0.0, 1.0)
}

pub fn roll_rarity<R: Rng + ?Sized>(min: Rarity, max: Rarity, luck: f32, rng: &mut R) -> Rarity {
    let roll = rng.random::<f32>() * luck;
    if roll < 0.5 {
        min
    } else if roll < 0.75 {
        min.raised(1, max)
    } else if roll < 0.9 {
        min.raised(2, max)
    } else if roll < 0.98 {
        min.raised(3, max)
    } else {
        max
    }
}

impl LootTable {
    pub fn generate<R: Rng + ?Sized>(&self, player_level: u32, luck: f32, tags: &[String], rng: &mut R) -> LootRoll {
        let tags: HashSet<&str> = tags.iter().map(String::as_str).collect();
        let mut available: Vec<&LootEntry> = self.entries.iter().filter(|e| e.eligible(player_level, &tags)).collect();
        available.sort_by(|a, b| b.chance.total_cmp(&a.chance));

        let mut roll = LootRoll::default();
        let mut dropped: HashSet<&str> = HashSet::new();

        let guaranteed = self.guaranteed_drops.min(available.len());
        for entry in &available[..guaranteed] {
            roll.items.push(drop_from(entry, player_level, luck, rng));
            if self.unique_drops {
                dropped.insert(entry.item_id.as_str());
            }
        }

        let max_random = self.max_drops.saturating_sub(guaranteed);
        let mut random_drops = 0;
        available.shuffle(rng);
        for entry in available {
            if random_drops >= max_random {
                break;
            }
            if self.unique_drops && dropped.contains(entry.item_id.as_str()) {
                continue;
            }
            let chance = adjusted_chance(entry.chance, luck, player_level, entry.item_level());
            if rng.random::<f32>() <= chance {
                roll.items.push(drop_from(entry, player_level, luck, rng));
                random_drops += 1;
                if self.unique_drops {
                    dropped.insert(entry.item_id.as_str());
                }
            }
        }

        let (lo, hi) = self.gold_range;
        if hi > 0 {
            roll.gold = rng.random_range(lo.min(hi)..=hi);
        }
        roll
    }
}

fn drop_from<R: Rng + ?Sized>(entry: &LootEntry, player_level: u32, luck: f32, rng: &mut R) -> LootDrop {
    let max_qty = entry.max_quantity.max(entry.min_quantity);
    LootDrop {
        item_id: entry.item_id.clone(),
        quantity: rng.random_range(entry.min_quantity..=max_qty),
        rarity: roll_rarity(entry.min_rarity, entry.max_rarity, luck, rng),
        level: player_level.clamp(entry.min_level, entry.max_level.max(entry.min_level)),
    }
}

/// Tables keyed by id.
#[derive(Debug, Clone, Default)]
pub struct LootTables {
    tables: HashMap<String, LootTable>,
}

impl LootTables {
    pub fn new(tables: impl IntoIterator<Item = LootTable>) -> Self {
        Self { tables: tables.into_iter().map(|t| (t.id.clone(), t)).collect() }
    }

    pub fn get(&self, id: &str) -> Option<&LootTable> {
        self.tables.get(id)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// One table per hostile mob type.
pub fn default_tables() -> Vec<LootTable> {
    const ANY: u32 = 100;
    vec![
        LootTable {
            id: "goblin".into(),
            entries: vec![
                LootEntry::new("gold_coin", (1, 5), 0.8, (1, 20)),
                LootEntry::new("goblin_ear", (1, 1), 0.5, (1, 20)),
                LootEntry::new("rusty_sword", (1, 1), 0.2, (1, 20)).rarities(Rarity::Common, Rarity::Uncommon),
            ],
            guaranteed_drops: 1,
            max_drops: 3,
            unique_drops: true,
            gold_range: (1, 10),
        },
        LootTable {
            id: "orc".into(),
            entries: vec![
                LootEntry::new("gold_coin", (5, 15), 0.9, (1, 50)),
                LootEntry::new("orc_tusk", (1, 2), 0.6, (1, 50)),
                LootEntry::new("iron_sword", (1, 1), 0.3, (5, 50)).rarities(Rarity::Common, Rarity::Rare),
                LootEntry::new("leather_armor", (1, 1), 0.15, (5, 50)).rarities(Rarity::Common, Rarity::Rare),
            ],
            guaranteed_drops: 1,
            max_drops: 3,
            unique_drops: true,
            gold_range: (5, 25),
        },
        LootTable {
            id: "dragon".into(),
            entries: vec![
                LootEntry::new("gold_coin", (50, 200), 1.0, (1, ANY)),
                LootEntry::new("dragon_scale", (1, 5), 0.8, (20, ANY)).rarities(Rarity::Rare, Rarity::Epic),
                LootEntry::new("dragon_heart", (1, 1), 0.5, (30, ANY)).rarities(Rarity::Epic, Rarity::Legendary),
                LootEntry::new("legendary_sword", (1, 1), 0.1, (40, ANY)).rarities(Rarity::Legendary, Rarity::Mythic),
            ],
            guaranteed_drops: 2,
            max_drops: 4,
            unique_drops: true,
            gold_range: (100, 500),
        },
        LootTable {
            id: "slime".into(),
            entries: vec![
                LootEntry::new("gold_coin", (1, 3), 0.7, (1, 50)),
                LootEntry::new("slime_core", (1, 1), 0.4, (1, 50)),
                LootEntry::new("health_potion", (1, 1), 0.3, (1, 50)),
            ],
            guaranteed_drops: 1,
            max_drops: 2,
            unique_drops: true,
            gold_range: (0, 5),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn table(id: &str) -> LootTable {
        default_tables().into_iter().find(|t| t.id == id).unwrap()
    }

    #[test]
    fn same_seed_same_loot() {
        let goblin = table("goblin");
        let a = goblin.generate(3, 1.0, &[], &mut StdRng::seed_from_u64(42));
        let b = goblin.generate(3, 1.0, &[], &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn guaranteed_drop_is_highest_chance_entry() {
        let goblin = table("goblin");
        for seed in 0..50 {
            let roll = goblin.generate(1, 1.0, &[], &mut StdRng::seed_from_u64(seed));
            assert_eq!(roll.items[0].item_id, "gold_coin");
            assert!((1..=5).contains(&roll.items[0].quantity));
            assert!(roll.items.len() <= 3);
            assert!((1..=10).contains(&roll.gold));
            let mut ids: Vec<&str> = roll.items.iter().map(|d| d.item_id.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), roll.items.len(), "unique drops repeated an item");
        }
    }

    #[test]
    fn level_range_filters_entries() {
        // A level 10 player only qualifies for the dragon's gold.
        let dragon = table("dragon");
        for seed in 0..20 {
            let roll = dragon.generate(10, 1.0, &[], &mut StdRng::seed_from_u64(seed));
            assert!(roll.items.iter().all(|d| d.item_id == "gold_coin"));
            assert_eq!(roll.items.len(), 1);
        }
    }

    #[test]
    fn requirements_gate_entries() {
        let mut t = table("slime");
        t.entries[0].requirements = vec!["slime_hunter".into()];
        t.guaranteed_drops = 3;
        t.max_drops = 3;
        let without = t.generate(1, 1.0, &[], &mut StdRng::seed_from_u64(1));
        assert!(without.items.iter().all(|d| d.item_id != "gold_coin"));
        let with = t.generate(1, 1.0, &["slime_hunter".into()], &mut StdRng::seed_from_u64(1));
        assert!(with.items.iter().any(|d| d.item_id == "gold_coin"));
    }

    #[test]
    fn chance_is_scaled_by_level_gap() {
        assert_eq!(level_factor(25, 10), 0.5);
        assert_eq!(level_factor(1, 10), 0.75);
        assert_eq!(level_factor(10, 10), 1.0);
        assert_eq!(adjusted_chance(0.8, 2.0, 10, 10), 1.0);
        assert!((adjusted_chance(0.8, 1.0, 25, 10) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn rarity_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let r = roll_rarity(Rarity::Uncommon, Rarity::Rare, 1.5, &mut rng);
            assert!((Rarity::Uncommon..=Rarity::Rare).contains(&r));
        }
        assert_eq!(Rarity::Common.raised(9, Rarity::Mythic), Rarity::Mythic);
        assert_eq!(Rarity::Epic.stat_multiplier(), 2.0);
    }
}

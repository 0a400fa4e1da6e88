use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use worldcore_engine::world::position::Vec3;

use super::{EntityId, Stats};

pub const FAMILIAR_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NpcType {
    Goblin,
    Orc,
    Dragon,
    Slime,
    Villager,
    Merchant,
    QuestGiver,
    Blacksmith,
    Wolf,
    Owl,
    Cat,
}

impl NpcType {
    pub const ALL: [NpcType; 11] = [
        NpcType::Goblin,
        NpcType::Orc,
        NpcType::Dragon,
        NpcType::Slime,
        NpcType::Villager,
        NpcType::Merchant,
        NpcType::QuestGiver,
        NpcType::Blacksmith,
        NpcType::Wolf,
        NpcType::Owl,
        NpcType::Cat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NpcType::Goblin => "goblin",
            NpcType::Orc => "orc",
            NpcType::Dragon => "dragon",
            NpcType::Slime => "slime",
            NpcType::Villager => "villager",
            NpcType::Merchant => "merchant",
            NpcType::QuestGiver => "quest_giver",
            NpcType::Blacksmith => "blacksmith",
            NpcType::Wolf => "wolf",
            NpcType::Owl => "owl",
            NpcType::Cat => "cat",
        }
    }

    pub fn is_hostile(self) -> bool {
        matches!(self, NpcType::Goblin | NpcType::Orc | NpcType::Dragon | NpcType::Slime)
    }

    pub fn is_familiar(self) -> bool {
        matches!(self, NpcType::Wolf | NpcType::Owl | NpcType::Cat)
    }

    pub fn is_friendly(self) -> bool {
        !self.is_hostile() && !self.is_familiar()
    }

    /// Level-1 stats plus attack and detection ranges.
    pub fn base(self) -> BaseStats {
        let (health, attack, defense, speed, attack_range, detection_range) = match self {
            NpcType::Goblin => (50.0, 8.0, 3.0, 4.0, 1.5, 15.0),
            NpcType::Orc => (150.0, 20.0, 8.0, 3.5, 2.0, 20.0),
            NpcType::Dragon => (500.0, 50.0, 20.0, 5.0, 4.0, 40.0),
            NpcType::Slime => (30.0, 5.0, 1.0, 2.0, 1.0, 10.0),
            NpcType::Wolf | NpcType::Owl | NpcType::Cat => (80.0, 6.0, 2.0, 5.0, 1.5, 15.0),
            _ => (100.0, 0.0, 5.0, 3.0, 1.5, 10.0),
        };
        BaseStats { health, attack, defense, speed, attack_range, detection_range }
    }

    /// Collision sphere radius.
    pub fn radius(self) -> f32 {
        match self {
            NpcType::Dragon => 2.0,
            NpcType::Orc => 0.7,
            NpcType::Slime | NpcType::Cat | NpcType::Owl => 0.4,
            _ => 0.5,
        }
    }

    /// Greeting and offered services for friendly NPCs.
    pub fn dialogue(self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            NpcType::Merchant => Some(("Welcome, traveler! Care to see my wares?", &["trade"])),
            NpcType::QuestGiver => Some(("I have tasks for the brave.", &["quests"])),
            NpcType::Blacksmith => Some(("Need something mended?", &["repair"])),
            NpcType::Villager => Some(("Nice weather today.", &["talk"])),
            _ => None,
        }
    }
}

impl FromStr for NpcType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        NpcType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| format!("unknown npc type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaseStats {
    pub health: f32,
    pub attack: f32,
    pub defense: f32,
    pub speed: f32,
    pub attack_range: f32,
    pub detection_range: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NpcState {
    Idle,
    Patrol,
    Chase,
    Combat,
    Flee,
    Follow,
}

impl NpcState {
    pub fn as_str(self) -> &'static str {
        match self {
            NpcState::Idle => "idle",
            NpcState::Patrol => "patrol",
            NpcState::Chase => "chase",
            NpcState::Combat => "combat",
            NpcState::Flee => "flee",
            NpcState::Follow => "follow",
        }
    }
}

/// Owner order that overrides a familiar's own decisions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FamiliarCommand {
    Follow,
    Attack { target: EntityId },
    Patrol { center: Vec3, radius: f32 },
    Idle,
}

#[derive(Debug, Clone)]
pub struct Npc {
    pub npc_type: NpcType,
    pub state: NpcState,
    pub stats: Stats,
    pub owner_id: Option<EntityId>,
    pub target_id: Option<EntityId>,
    pub patrol_center: Vec3,
    pub patrol_radius: f32,
    /// Current angle on the patrol circle, radians.
    pub patrol_angle: f32,
    pub attack_cooldown: f32,
    pub attack_range: f32,
    pub detection_range: f32,
    pub threat_map: HashMap<EntityId, f32>,
    /// Seconds spent in the current idle stretch.
    pub idle_time: f32,
    pub command: Option<FamiliarCommand>,
    /// Index of the spawn zone this mob belongs to.
    pub zone: Option<usize>,
    pub xp_reward: u64,
}

impl Npc {
    pub fn new(npc_type: NpcType, level: u32, spawn: Vec3) -> Self {
        let level = level.max(1);
        let base = npc_type.base();
        let step = (level - 1) as f32;
        let max_health = base.health * (1.0 + 0.2 * step);
        Npc {
            npc_type,
            state: NpcState::Idle,
            stats: Stats {
                health: max_health,
                max_health,
                attack: base.attack * (1.0 + 0.15 * step),
                defense: base.defense,
                speed: base.speed,
                level,
                experience: 0,
            },
            owner_id: None,
            target_id: None,
            patrol_center: spawn,
            patrol_radius: 8.0,
            patrol_angle: 0.0,
            attack_cooldown: 0.0,
            attack_range: base.attack_range,
            detection_range: base.detection_range,
            threat_map: HashMap::new(),
            idle_time: 0.0,
            command: None,
            zone: None,
            xp_reward: 10 * level as u64,
        }
    }

    pub fn familiar(npc_type: NpcType, owner: EntityId, spawn: Vec3) -> Self {
        let mut npc = Npc::new(npc_type, 1, spawn);
        npc.owner_id = Some(owner);
        npc.state = NpcState::Follow;
        npc.command = Some(FamiliarCommand::Follow);
        npc
    }

    pub fn total_threat(&self) -> f32 {
        self.threat_map.values().sum()
    }

    /// Attacker with the most accumulated threat; lowest id on ties.
    pub fn top_threat(&self) -> Option<EntityId> {
        self.threat_map
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, _)| *id)
    }

    /// Apply a hit and return the damage actually dealt.
    pub fn take_damage(&mut self, amount: f32, attacker: Option<EntityId>) -> f32 {
        let dealt = (amount - self.stats.defense).max(1.0);
        self.stats.health = (self.stats.health - dealt).max(0.0);
        if let Some(attacker) = attacker {
            *self.threat_map.entry(attacker).or_insert(0.0) += dealt;
            if self.npc_type.is_friendly() {
                self.state = NpcState::Flee;
                self.target_id = Some(attacker);
            } else if self.state != NpcState::Flee {
                self.state = NpcState::Combat;
                self.target_id = Some(attacker);
            }
        }
        self.idle_time = 0.0;
        dealt
    }

    pub fn forget(&mut self, id: EntityId) {
        self.threat_map.remove(&id);
        if self.target_id == Some(id) {
            self.target_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_scaling_applies_to_health_attack_and_xp() {
        let goblin = Npc::new(NpcType::Goblin, 3, Vec3::ZERO);
        assert!((goblin.stats.max_health - 70.0).abs() < 1e-4);
        assert!((goblin.stats.attack - 10.4).abs() < 1e-4);
        assert_eq!(goblin.stats.defense, 3.0);
        assert_eq!(goblin.xp_reward, 30);
    }

    #[test]
    fn damage_floors_at_one_and_builds_threat() {
        let mut orc = Npc::new(NpcType::Orc, 1, Vec3::ZERO);
        assert_eq!(orc.take_damage(3.0, Some(9)), 1.0);
        assert_eq!(orc.take_damage(28.0, Some(9)), 20.0);
        assert_eq!(orc.take_damage(10.0, Some(4)), 2.0);
        assert_eq!(orc.stats.health, 127.0);
        assert_eq!(orc.state, NpcState::Combat);
        assert_eq!(orc.top_threat(), Some(9));
        assert_eq!(orc.total_threat(), 23.0);
    }

    #[test]
    fn friendly_npcs_flee_when_hit() {
        let mut villager = Npc::new(NpcType::Villager, 1, Vec3::ZERO);
        villager.take_damage(10.0, Some(1));
        assert_eq!(villager.state, NpcState::Flee);
        assert!(NpcType::Merchant.dialogue().is_some_and(|(_, s)| s == ["trade"]));
    }

    #[test]
    fn type_names_parse_case_insensitively() {
        assert_eq!("Quest_Giver".parse::<NpcType>(), Ok(NpcType::QuestGiver));
        assert!("unicorn".parse::<NpcType>().is_err());
        assert!(NpcType::Wolf.is_familiar() && !NpcType::Wolf.is_hostile());
    }
}

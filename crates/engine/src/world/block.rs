use serde::{Deserialize, Serialize};

/// Block kinds stored as one byte per cell in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    #[default]
    Air = 0,
    Grass = 1,
    Dirt = 2,
    Stone = 3,
    Water = 4,
    Sand = 5,
    Snow = 6,
    Wood = 7,
    Leaves = 8,
}

impl BlockType {
    /// Decode a stored byte. Unknown values read back as air.
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Grass,
            2 => Self::Dirt,
            3 => Self::Stone,
            4 => Self::Water,
            5 => Self::Sand,
            6 => Self::Snow,
            7 => Self::Wood,
            8 => Self::Leaves,
            _ => Self::Air,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Blocks that occlude neighbouring faces and take part in collision.
    pub const fn is_solid(self) -> bool {
        !matches!(self, Self::Air | Self::Water)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "air" => Self::Air,
            "grass" => Self::Grass,
            "dirt" => Self::Dirt,
            "stone" => Self::Stone,
            "water" => Self::Water,
            "sand" => Self::Sand,
            "snow" => Self::Snow,
            "wood" => Self::Wood,
            "leaves" => Self::Leaves,
            _ => return None,
        })
    }
}

/// Terrain biome of a chunk, serialized as its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum Biome {
    #[default]
    Plains = 0,
    Forest = 1,
    Mountain = 2,
    Desert = 3,
    Ocean = 4,
    River = 5,
}

impl Biome {
    pub const fn from_i32(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::Plains,
            1 => Self::Forest,
            2 => Self::Mountain,
            3 => Self::Desert,
            4 => Self::Ocean,
            5 => Self::River,
            _ => return None,
        })
    }

    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

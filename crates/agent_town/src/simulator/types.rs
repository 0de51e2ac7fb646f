//! Core type definitions: IDs, constants, tiles, and agent position records.

use serde::{Deserialize, Serialize};

// ============================================================================
// Type Aliases
// ============================================================================

pub type AgentId = String;
pub type BuildingId = String;
pub type ActionId = String;
pub type TickId = u64;
/// Wall-clock milliseconds since the Unix epoch.
pub type TimestampMs = u64;

// ============================================================================
// Constants
// ============================================================================

pub const SNAPSHOT_VERSION: u32 = 1;
/// Per-tick progress increment for an in-flight step (~20 ticks per tile).
pub const MOVEMENT_PROGRESS_PER_TICK: f64 = 0.05;
/// Hard cap on A* expansions; exceeding it yields no path.
pub const PATHFINDING_MAX_ITERATIONS: usize = 500;
pub const DEFAULT_GRID_WIDTH: u32 = 64;
pub const DEFAULT_GRID_HEIGHT: u32 = 64;
pub const DEFAULT_TILE_SIZE: u32 = 32;

// ============================================================================
// Tiles
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileKind {
    Grass,
    Road,
    Path,
    Water,
    Sand,
    Stone,
}

impl TileKind {
    pub fn is_walkable(self) -> bool {
        !matches!(self, TileKind::Water)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TileKind::Grass => "grass",
            TileKind::Road => "road",
            TileKind::Path => "path",
            TileKind::Water => "water",
            TileKind::Sand => "sand",
            TileKind::Stone => "stone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    #[serde(rename = "type")]
    pub kind: TileKind,
    pub walkable: bool,
}

impl Tile {
    pub fn new(kind: TileKind) -> Self {
        Self {
            kind,
            walkable: kind.is_walkable(),
        }
    }
}

/// Integer grid coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

impl TilePos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn manhattan(self, other: TilePos) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }

    pub fn chebyshev(self, other: TilePos) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

// ============================================================================
// Agent Position Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl Facing {
    /// Facing derived from a step displacement; horizontal wins ties.
    pub fn from_delta(dx: i32, dy: i32) -> Option<Self> {
        if dx == 0 && dy == 0 {
            return None;
        }
        if dx.abs() >= dy.abs() {
            Some(if dx > 0 { Facing::Right } else { Facing::Left })
        } else {
            Some(if dy > 0 { Facing::Down } else { Facing::Up })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    #[default]
    Idle,
    Moving,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPosition {
    pub id: AgentId,
    pub x: i32,
    pub y: i32,
    pub facing: Facing,
    pub state: MotionState,
    pub current_building: Option<BuildingId>,
    pub last_update: TimestampMs,
}

impl AgentPosition {
    pub fn new(id: impl Into<AgentId>, pos: TilePos, now: TimestampMs) -> Self {
        Self {
            id: id.into(),
            x: pos.x,
            y: pos.y,
            facing: Facing::default(),
            state: MotionState::Idle,
            current_building: None,
            last_update: now,
        }
    }

    pub fn tile(&self) -> TilePos {
        TilePos::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Human,
    Npc,
}

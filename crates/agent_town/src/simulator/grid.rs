//! WorldGrid: tile map, building footprints, and spawn-point selection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::types::{
    AgentId, BuildingId, Tile, TileKind, TilePos, DEFAULT_GRID_HEIGHT, DEFAULT_GRID_WIDTH,
    DEFAULT_TILE_SIZE,
};

const ROAD_SPACING: i32 = 12;
const ROAD_OFFSET: i32 = 6;
const PLAZA_HALF_EXTENT: i32 = 3;

// ============================================================================
// Config and Buildings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridConfig {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_GRID_WIDTH,
            height: DEFAULT_GRID_HEIGHT,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    pub id: BuildingId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub occupancy: BTreeSet<AgentId>,
}

impl Building {
    pub fn new(
        id: impl Into<BuildingId>,
        name: impl Into<String>,
        kind: impl Into<String>,
        origin: TilePos,
        width: i32,
        height: i32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            x: origin.x,
            y: origin.y,
            width,
            height,
            occupancy: BTreeSet::new(),
        }
    }

    pub fn contains(&self, pos: TilePos) -> bool {
        pos.x >= self.x
            && pos.x < self.x + self.width
            && pos.y >= self.y
            && pos.y < self.y + self.height
    }

    /// Tile on the bottom edge, centered; where agents walk to when visiting.
    pub fn entrance(&self) -> TilePos {
        TilePos::new(self.x + self.width / 2, self.y + self.height - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("grid dimensions must be positive: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("row {row} has width {actual}, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("unknown tile glyph {glyph:?} at ({x}, {y})")]
    UnknownGlyph { glyph: char, x: usize, y: usize },
    #[error("building {building_id} footprint leaves the grid")]
    BuildingOutOfBounds { building_id: BuildingId },
    #[error("building {building_id} already exists")]
    DuplicateBuilding { building_id: BuildingId },
}

// ============================================================================
// WorldGrid
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WorldGrid {
    config: GridConfig,
    tiles: Vec<Tile>,
    buildings: BTreeMap<BuildingId, Building>,
}

impl WorldGrid {
    /// A grid filled with a single tile kind and no buildings.
    pub fn filled(config: GridConfig, kind: TileKind) -> Result<Self, GridError> {
        if config.width == 0 || config.height == 0 {
            return Err(GridError::InvalidDimensions {
                width: config.width,
                height: config.height,
            });
        }
        let len = config.width as usize * config.height as usize;
        Ok(Self {
            config,
            tiles: vec![Tile::new(kind); len],
            buildings: BTreeMap::new(),
        })
    }

    /// Deterministic town layout: a road lattice, a central stone plaza, a pond
    /// ringed with sand, and the default buildings placed between roads.
    pub fn generate(config: GridConfig) -> Result<Self, GridError> {
        let mut grid = Self::filled(config, TileKind::Grass)?;
        let (w, h) = (config.width as i32, config.height as i32);

        for y in 0..h {
            for x in 0..w {
                if x % ROAD_SPACING == ROAD_OFFSET || y % ROAD_SPACING == ROAD_OFFSET {
                    grid.set_tile(TilePos::new(x, y), TileKind::Road);
                }
            }
        }

        let center = TilePos::new(w / 2, h / 2);
        for y in (center.y - PLAZA_HALF_EXTENT)..=(center.y + PLAZA_HALF_EXTENT) {
            for x in (center.x - PLAZA_HALF_EXTENT)..=(center.x + PLAZA_HALF_EXTENT) {
                grid.set_tile(TilePos::new(x, y), TileKind::Stone);
            }
        }

        let pond = TilePos::new(w * 3 / 4 + 2, h * 3 / 4 + 2);
        let radius = (w.min(h) / 12).max(1);
        for y in 0..h {
            for x in 0..w {
                let pos = TilePos::new(x, y);
                let d2 = (x - pond.x).pow(2) + (y - pond.y).pow(2);
                if d2 <= radius * radius {
                    grid.set_tile(pos, TileKind::Water);
                } else if d2 <= (radius + 1) * (radius + 1) {
                    grid.set_tile(pos, TileKind::Sand);
                }
            }
        }

        for (id, name, kind, block_x, block_y) in DEFAULT_BUILDINGS {
            let origin = TilePos::new(
                block_x * ROAD_SPACING + ROAD_OFFSET + 2,
                block_y * ROAD_SPACING + ROAD_OFFSET + 2,
            );
            let building = Building::new(*id, *name, *kind, origin, 4, 4);
            if grid.footprint_is_dry(&building) {
                grid.add_building(building)?;
            }
        }

        Ok(grid)
    }

    /// Parses a map where `.` grass, `=` road, `:` path, `~` water, `s` sand,
    /// `^` stone.
    pub fn from_ascii(rows: &[&str], tile_size: u32) -> Result<Self, GridError> {
        let height = rows.len();
        let width = rows.first().map(|row| row.chars().count()).unwrap_or(0);
        let mut grid = Self::filled(
            GridConfig {
                width: width as u32,
                height: height as u32,
                tile_size,
            },
            TileKind::Grass,
        )?;
        for (y, row) in rows.iter().enumerate() {
            let actual = row.chars().count();
            if actual != width {
                return Err(GridError::RaggedRows {
                    row: y,
                    expected: width,
                    actual,
                });
            }
            for (x, glyph) in row.chars().enumerate() {
                let kind = match glyph {
                    '.' => TileKind::Grass,
                    '=' => TileKind::Road,
                    ':' => TileKind::Path,
                    '~' => TileKind::Water,
                    's' => TileKind::Sand,
                    '^' => TileKind::Stone,
                    other => return Err(GridError::UnknownGlyph { glyph: other, x, y }),
                };
                grid.set_tile(TilePos::new(x as i32, y as i32), kind);
            }
        }
        Ok(grid)
    }

    pub fn config(&self) -> GridConfig {
        self.config
    }

    pub fn width(&self) -> i32 {
        self.config.width as i32
    }

    pub fn height(&self) -> i32 {
        self.config.height as i32
    }

    pub fn in_bounds(&self, pos: TilePos) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.width() && pos.y < self.height()
    }

    fn index(&self, pos: TilePos) -> Option<usize> {
        self.in_bounds(pos)
            .then(|| pos.y as usize * self.config.width as usize + pos.x as usize)
    }

    pub fn tile(&self, pos: TilePos) -> Option<Tile> {
        self.index(pos).map(|index| self.tiles[index])
    }

    pub fn is_walkable(&self, pos: TilePos) -> bool {
        self.tile(pos).map(|tile| tile.walkable).unwrap_or(false)
    }

    fn set_tile(&mut self, pos: TilePos, kind: TileKind) {
        if let Some(index) = self.index(pos) {
            self.tiles[index] = Tile::new(kind);
        }
    }

    fn footprint_is_dry(&self, building: &Building) -> bool {
        (building.y..building.y + building.height).all(|y| {
            (building.x..building.x + building.width)
                .all(|x| self.is_walkable(TilePos::new(x, y)))
        })
    }

    /// Overlays a building footprint. Footprint tiles become walkable floor so
    /// agents can step inside.
    pub fn add_building(&mut self, building: Building) -> Result<(), GridError> {
        if self.buildings.contains_key(&building.id) {
            return Err(GridError::DuplicateBuilding {
                building_id: building.id,
            });
        }
        let corner = TilePos::new(
            building.x + building.width - 1,
            building.y + building.height - 1,
        );
        if building.width <= 0
            || building.height <= 0
            || !self.in_bounds(TilePos::new(building.x, building.y))
            || !self.in_bounds(corner)
        {
            return Err(GridError::BuildingOutOfBounds {
                building_id: building.id,
            });
        }
        for y in building.y..building.y + building.height {
            for x in building.x..building.x + building.width {
                self.set_tile(TilePos::new(x, y), TileKind::Path);
            }
        }
        self.buildings.insert(building.id.clone(), building);
        Ok(())
    }

    pub fn buildings(&self) -> &BTreeMap<BuildingId, Building> {
        &self.buildings
    }

    pub fn building(&self, building_id: &str) -> Option<&Building> {
        self.buildings.get(building_id)
    }

    pub fn building_at(&self, pos: TilePos) -> Option<&Building> {
        self.buildings.values().find(|building| building.contains(pos))
    }

    /// Moves `agent_id` into the occupancy set of whichever building contains
    /// `pos`, removing it from every other building. Returns the new building.
    pub fn update_occupancy(&mut self, agent_id: &str, pos: TilePos) -> Option<BuildingId> {
        let mut current = None;
        for building in self.buildings.values_mut() {
            if building.contains(pos) {
                building.occupancy.insert(agent_id.to_string());
                current = Some(building.id.clone());
            } else {
                building.occupancy.remove(agent_id);
            }
        }
        current
    }

    pub fn clear_occupant(&mut self, agent_id: &str) {
        for building in self.buildings.values_mut() {
            building.occupancy.remove(agent_id);
        }
    }

    /// Nearest walkable tile to `preferred` not in `occupied`, searching rings of
    /// growing Chebyshev radius in row-major order.
    pub fn find_spawn_point(
        &self,
        preferred: TilePos,
        occupied: &BTreeSet<TilePos>,
    ) -> Option<TilePos> {
        let max_radius = self.width().max(self.height());
        for radius in 0..=max_radius {
            for y in (preferred.y - radius)..=(preferred.y + radius) {
                for x in (preferred.x - radius)..=(preferred.x + radius) {
                    let pos = TilePos::new(x, y);
                    if pos.chebyshev(preferred) != radius {
                        continue;
                    }
                    if self.is_walkable(pos) && !occupied.contains(&pos) {
                        return Some(pos);
                    }
                }
            }
        }
        None
    }

    /// Walkable tile adjacent to `target` closest to `from`, used when walking
    /// up to another agent rather than onto its tile.
    pub fn approach_tile(&self, from: TilePos, target: TilePos) -> Option<TilePos> {
        let mut best: Option<(i32, TilePos)> = None;
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let pos = TilePos::new(target.x + dx, target.y + dy);
                if !self.is_walkable(pos) {
                    continue;
                }
                let score = pos.manhattan(from);
                if best.map(|(best_score, _)| score < best_score).unwrap_or(true) {
                    best = Some((score, pos));
                }
            }
        }
        best.map(|(_, pos)| pos)
    }

    pub fn count_kind(&self, kind: TileKind) -> usize {
        self.tiles.iter().filter(|tile| tile.kind == kind).count()
    }
}

const DEFAULT_BUILDINGS: &[(&str, &str, &str, i32, i32)] = &[
    ("cafe", "Hobbs Cafe", "cafe", 0, 0),
    ("library", "Town Library", "library", 1, 0),
    ("market", "Market Hall", "market", 3, 0),
    ("town-hall", "Town Hall", "government", 0, 1),
    ("workshop", "Workshop", "workplace", 3, 1),
    ("house-1", "Maple House", "house", 0, 3),
    ("house-2", "Cedar House", "house", 1, 3),
];

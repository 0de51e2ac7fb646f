//! Town simulator: grid, pathfinding, movement, the action queue, and the
//! `World` aggregate the tick orchestrator drives.
//!
//! This module is organized into submodules:
//! - `types`: IDs, constants, tiles, agent position records
//! - `grid`: tile map, buildings, spawn-point selection
//! - `pathfinding`: A* over the grid
//! - `movement`: per-tick step progress and interpolation
//! - `action_queue`: deterministic priority queue of intents
//! - `clock`: time of day and weather
//! - `agents`: registry of connected agents and NPCs
//! - `world`: the aggregate plus observation
//! - `persist`: versioned snapshot document

mod action_queue;
mod agents;
mod clock;
mod grid;
mod movement;
mod pathfinding;
mod persist;
mod types;
mod world;

#[cfg(test)]
mod tests;

pub use action_queue::{
    ActionQueue, QueueError, QueuedAction, QueuedActionKind, DEFAULT_QUEUE_PRIORITY,
};
pub use agents::{
    AgentProfile, AgentRegistry, MemoryEntry, DEFAULT_DISCONNECT_TIMEOUT_MS, DEFAULT_MEMORY_LIMIT,
};
pub use clock::{Weather, WorldClock, WorldTimeView, MINUTES_PER_DAY};
pub use grid::{Building, GridConfig, GridError, WorldGrid};
pub use movement::{MoveError, MoveOutcome, MovementController, MovementState, StepEvent};
pub use pathfinding::Pathfinder;
pub use persist::{PersistError, WorldSnapshot};
pub use types::{
    ActionId, AgentId, AgentKind, AgentPosition, BuildingId, Facing, MotionState, TickId, Tile,
    TileKind, TilePos, TimestampMs, DEFAULT_GRID_HEIGHT, DEFAULT_GRID_WIDTH, DEFAULT_TILE_SIZE,
    MOVEMENT_PROGRESS_PER_TICK, PATHFINDING_MAX_ITERATIONS, SNAPSHOT_VERSION,
};
pub use world::{
    ActionLog, ActionLogEntry, EconomyObservation, NearbyAgent, NearbyBuilding, Observation,
    PhysicsReport, QueueRejection, QueueReport, SocialObservation, SpeechEntry, SpeechLog, World,
    WorldError, WorldSettings, MAX_MESSAGE_CHARS,
};

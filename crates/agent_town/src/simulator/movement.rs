//! MovementController: turns paths into per-tick step progress.
//!
//! Canonical positions only change when a step completes; the in-flight blend
//! is exposed through `interpolated_position` for rendering.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::grid::WorldGrid;
use super::pathfinding::Pathfinder;
use super::types::{
    AgentId, AgentPosition, BuildingId, Facing, MotionState, TilePos, TimestampMs,
    MOVEMENT_PROGRESS_PER_TICK,
};

/// Accumulated float increments land a hair under 1.0; treat that as arrival.
const ARRIVAL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementState {
    pub from_x: i32,
    pub from_y: i32,
    pub to_x: i32,
    pub to_y: i32,
    pub progress: f64,
    pub full_path: Option<Vec<TilePos>>,
    /// Index into `full_path` of the tile this step is heading to.
    pub current_step: usize,
}

impl MovementState {
    fn segment(from: TilePos, to: TilePos, full_path: Option<Vec<TilePos>>, step: usize) -> Self {
        Self {
            from_x: from.x,
            from_y: from.y,
            to_x: to.x,
            to_y: to.y,
            progress: 0.0,
            full_path,
            current_step: step,
        }
    }

    pub fn destination(&self) -> TilePos {
        TilePos::new(self.to_x, self.to_y)
    }

    /// Tiles still to be visited after the current step completes.
    pub fn remaining_steps(&self) -> usize {
        self.full_path
            .as_ref()
            .map(|path| path.len().saturating_sub(self.current_step + 1))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    #[error("agent {agent_id} has no world position")]
    UnknownAgent { agent_id: AgentId },
    #[error("target ({x}, {y}) is not walkable")]
    TargetNotWalkable { x: i32, y: i32 },
    #[error("no path to ({x}, {y})")]
    NoPath { x: i32, y: i32 },
}

impl MoveError {
    pub fn tag(&self) -> &'static str {
        match self {
            MoveError::UnknownAgent { .. } => "unknown_agent",
            MoveError::TargetNotWalkable { .. } => "target_not_walkable",
            MoveError::NoPath { .. } => "no_path",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    pub path: Vec<TilePos>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    StepCompleted {
        agent_id: AgentId,
        pos: TilePos,
    },
    Arrived {
        agent_id: AgentId,
        pos: TilePos,
        building: Option<BuildingId>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MovementController {
    positions: BTreeMap<AgentId, AgentPosition>,
    movements: BTreeMap<AgentId, MovementState>,
    pathfinder: Pathfinder,
    continue_paths: bool,
}

impl MovementController {
    pub fn new(continue_paths: bool) -> Self {
        Self {
            continue_paths,
            ..Self::default()
        }
    }

    pub fn with_pathfinder(mut self, pathfinder: Pathfinder) -> Self {
        self.pathfinder = pathfinder;
        self
    }

    pub fn continue_paths(&self) -> bool {
        self.continue_paths
    }

    pub fn positions(&self) -> &BTreeMap<AgentId, AgentPosition> {
        &self.positions
    }

    pub fn movements(&self) -> &BTreeMap<AgentId, MovementState> {
        &self.movements
    }

    pub fn position(&self, agent_id: &str) -> Option<&AgentPosition> {
        self.positions.get(agent_id)
    }

    pub fn movement(&self, agent_id: &str) -> Option<&MovementState> {
        self.movements.get(agent_id)
    }

    pub fn occupied_tiles(&self) -> BTreeSet<TilePos> {
        self.positions.values().map(AgentPosition::tile).collect()
    }

    pub fn is_moving(&self, agent_id: &str) -> bool {
        self.movements.contains_key(agent_id)
    }

    pub fn any_moving(&self) -> bool {
        !self.movements.is_empty()
    }

    pub fn place(&mut self, grid: &mut WorldGrid, agent_id: &str, pos: TilePos, now: TimestampMs) {
        let mut record = AgentPosition::new(agent_id, pos, now);
        record.current_building = grid.update_occupancy(agent_id, pos);
        self.movements.remove(agent_id);
        self.positions.insert(agent_id.to_string(), record);
    }

    pub fn remove(&mut self, grid: &mut WorldGrid, agent_id: &str) -> Option<AgentPosition> {
        self.movements.remove(agent_id);
        grid.clear_occupant(agent_id);
        self.positions.remove(agent_id)
    }

    /// Plans a path and starts the first step. The rest of the path is kept for
    /// bookkeeping and, when path continuation is on, walked step by step.
    pub fn move_to(
        &mut self,
        grid: &WorldGrid,
        agent_id: &str,
        target: TilePos,
        now: TimestampMs,
    ) -> Result<MoveOutcome, MoveError> {
        let start = self
            .positions
            .get(agent_id)
            .map(AgentPosition::tile)
            .ok_or_else(|| MoveError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        if !grid.is_walkable(target) {
            return Err(MoveError::TargetNotWalkable {
                x: target.x,
                y: target.y,
            });
        }
        let path = self
            .pathfinder
            .find_path(grid, start, target)
            .filter(|path| path.len() >= 2)
            .ok_or(MoveError::NoPath {
                x: target.x,
                y: target.y,
            })?;

        let first = path[1];
        let movement = MovementState::segment(start, first, Some(path.clone()), 1);
        if let Some(record) = self.positions.get_mut(agent_id) {
            if let Some(facing) = Facing::from_delta(first.x - start.x, first.y - start.y) {
                record.facing = facing;
            }
            record.state = MotionState::Moving;
            record.last_update = now;
        }
        self.movements.insert(agent_id.to_string(), movement);
        Ok(MoveOutcome { path })
    }

    pub fn stop(&mut self, agent_id: &str) -> bool {
        let stopped = self.movements.remove(agent_id).is_some();
        if let Some(record) = self.positions.get_mut(agent_id) {
            record.state = MotionState::Idle;
        }
        stopped
    }

    /// Advances every in-flight step by the fixed increment, snapping agents to
    /// their step destination on arrival and recomputing building occupancy.
    pub fn tick(&mut self, grid: &mut WorldGrid, now: TimestampMs) -> Vec<StepEvent> {
        let mut events = Vec::new();
        let mut finished = Vec::new();

        for (agent_id, movement) in self.movements.iter_mut() {
            movement.progress = (movement.progress + MOVEMENT_PROGRESS_PER_TICK).min(1.0);
            if movement.progress + ARRIVAL_EPSILON < 1.0 {
                continue;
            }
            let Some(record) = self.positions.get_mut(agent_id) else {
                finished.push(agent_id.clone());
                continue;
            };
            let arrived_at = movement.destination();
            record.x = arrived_at.x;
            record.y = arrived_at.y;
            record.last_update = now;
            record.current_building = grid.update_occupancy(agent_id, arrived_at);

            let next = if self.continue_paths {
                movement
                    .full_path
                    .as_ref()
                    .and_then(|path| path.get(movement.current_step + 1).copied())
            } else {
                None
            };
            match next {
                Some(next_tile) => {
                    if let Some(facing) =
                        Facing::from_delta(next_tile.x - arrived_at.x, next_tile.y - arrived_at.y)
                    {
                        record.facing = facing;
                    }
                    let step = movement.current_step + 1;
                    let full_path = movement.full_path.take();
                    *movement = MovementState::segment(arrived_at, next_tile, full_path, step);
                    events.push(StepEvent::StepCompleted {
                        agent_id: agent_id.clone(),
                        pos: arrived_at,
                    });
                }
                None => {
                    record.state = MotionState::Idle;
                    finished.push(agent_id.clone());
                    events.push(StepEvent::Arrived {
                        agent_id: agent_id.clone(),
                        pos: arrived_at,
                        building: record.current_building.clone(),
                    });
                }
            }
        }

        for agent_id in finished {
            self.movements.remove(&agent_id);
        }
        events
    }

    /// Blends `from → to` by progress without touching canonical state.
    pub fn interpolated_position(&self, agent_id: &str) -> Option<(f64, f64)> {
        let record = self.positions.get(agent_id)?;
        match self.movements.get(agent_id) {
            Some(movement) => {
                let t = movement.progress.clamp(0.0, 1.0);
                let x = f64::from(movement.from_x)
                    + (f64::from(movement.to_x) - f64::from(movement.from_x)) * t;
                let y = f64::from(movement.from_y)
                    + (f64::from(movement.to_y) - f64::from(movement.from_y)) * t;
                Some((x, y))
            }
            None => Some((f64::from(record.x), f64::from(record.y))),
        }
    }

    pub(crate) fn restore(
        &mut self,
        positions: BTreeMap<AgentId, AgentPosition>,
        movements: BTreeMap<AgentId, MovementState>,
    ) {
        self.movements = movements
            .into_iter()
            .filter(|(agent_id, _)| positions.contains_key(agent_id))
            .collect();
        self.positions = positions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::grid::{Building, GridConfig};
    use crate::simulator::types::TileKind;

    fn grid() -> WorldGrid {
        WorldGrid::filled(
            GridConfig {
                width: 12,
                height: 12,
                tile_size: 16,
            },
            TileKind::Grass,
        )
        .expect("grid")
    }

    fn ticks_until_idle(
        controller: &mut MovementController,
        grid: &mut WorldGrid,
        agent_id: &str,
    ) -> usize {
        let mut ticks = 0;
        while controller.is_moving(agent_id) {
            controller.tick(grid, ticks as u64);
            ticks += 1;
            assert!(ticks < 10_000, "movement never finished");
        }
        ticks
    }

    #[test]
    fn single_step_takes_twenty_ticks() {
        let mut grid = grid();
        let mut controller = MovementController::new(false);
        controller.place(&mut grid, "a", TilePos::new(0, 0), 0);
        controller
            .move_to(&grid, "a", TilePos::new(1, 0), 0)
            .expect("move");
        assert_eq!(controller.position("a").unwrap().facing, Facing::Right);
        assert_eq!(controller.position("a").unwrap().state, MotionState::Moving);

        let ticks = ticks_until_idle(&mut controller, &mut grid, "a");
        assert_eq!(ticks, 20);
        let record = controller.position("a").unwrap();
        assert_eq!(record.tile(), TilePos::new(1, 0));
        assert_eq!(record.state, MotionState::Idle);
    }

    #[test]
    fn without_continuation_only_first_step_is_walked() {
        let mut grid = grid();
        let mut controller = MovementController::new(false);
        controller.place(&mut grid, "a", TilePos::new(0, 0), 0);
        let outcome = controller
            .move_to(&grid, "a", TilePos::new(4, 0), 0)
            .expect("move");
        assert_eq!(outcome.path.len(), 5);
        assert_eq!(controller.movement("a").unwrap().remaining_steps(), 3);
        ticks_until_idle(&mut controller, &mut grid, "a");
        assert_eq!(controller.position("a").unwrap().tile(), TilePos::new(1, 0));
    }

    #[test]
    fn continuation_walks_full_path() {
        let mut grid = grid();
        let mut controller = MovementController::new(true);
        controller.place(&mut grid, "a", TilePos::new(0, 0), 0);
        controller
            .move_to(&grid, "a", TilePos::new(4, 0), 0)
            .expect("move");
        let ticks = ticks_until_idle(&mut controller, &mut grid, "a");
        assert_eq!(ticks, 80);
        assert_eq!(controller.position("a").unwrap().tile(), TilePos::new(4, 0));
    }

    #[test]
    fn move_rejects_unwalkable_and_same_tile_targets() {
        let mut grid = WorldGrid::from_ascii(&["..~"], 16).expect("grid");
        let mut controller = MovementController::new(true);
        controller.place(&mut grid, "a", TilePos::new(0, 0), 0);
        assert!(matches!(
            controller.move_to(&grid, "a", TilePos::new(2, 0), 0),
            Err(MoveError::TargetNotWalkable { .. })
        ));
        assert!(matches!(
            controller.move_to(&grid, "a", TilePos::new(0, 0), 0),
            Err(MoveError::NoPath { .. })
        ));
        assert!(matches!(
            controller.move_to(&grid, "ghost", TilePos::new(1, 0), 0),
            Err(MoveError::UnknownAgent { .. })
        ));
    }

    #[test]
    fn interpolation_blends_without_moving_canonical_position() {
        let mut grid = grid();
        let mut controller = MovementController::new(false);
        controller.place(&mut grid, "a", TilePos::new(2, 2), 0);
        controller
            .move_to(&grid, "a", TilePos::new(2, 3), 0)
            .expect("move");
        for tick in 0..10 {
            controller.tick(&mut grid, tick);
        }
        let (x, y) = controller.interpolated_position("a").unwrap();
        assert!((x - 2.0).abs() < 1e-9);
        assert!((y - 2.5).abs() < 1e-6);
        assert_eq!(controller.position("a").unwrap().tile(), TilePos::new(2, 2));
        assert_eq!(controller.position("a").unwrap().facing, Facing::Down);
    }

    #[test]
    fn arrival_inside_building_updates_occupancy() {
        let mut grid = grid();
        grid.add_building(Building::new("cafe", "Cafe", "cafe", TilePos::new(3, 0), 2, 2))
            .expect("building");
        let mut controller = MovementController::new(true);
        controller.place(&mut grid, "a", TilePos::new(1, 0), 0);
        controller
            .move_to(&grid, "a", TilePos::new(3, 0), 0)
            .expect("move");
        ticks_until_idle(&mut controller, &mut grid, "a");
        assert_eq!(
            controller.position("a").unwrap().current_building.as_deref(),
            Some("cafe")
        );
        assert!(grid.building("cafe").unwrap().occupancy.contains("a"));
    }
}

//! World: the aggregate the tick mutates.
//!
//! Owns the grid, positions and movement, the agent registry, the action
//! queue, the clock, the collaborators, and the speech and action logs. Every
//! mutation path (tick steps, client intents, decision-driven actions) goes
//! through these methods while holding the runtime's world lock.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::action_queue::{ActionQueue, QueueError, QueuedAction, QueuedActionKind};
use super::agents::{AgentProfile, AgentRegistry, MemoryEntry};
use super::clock::{Weather, WorldClock, WorldTimeView};
use super::grid::{GridConfig, GridError, WorldGrid};
use super::movement::{MoveError, MovementController, MovementState, StepEvent};
use super::persist::{PersistError, WorldSnapshot};
use super::types::{
    ActionId, AgentId, AgentKind, AgentPosition, BuildingId, MotionState, TickId, TilePos,
    TimestampMs, SNAPSHOT_VERSION,
};
use crate::collaborators::{Collaborators, FavorStanding, JobView};

pub const DEFAULT_SPEECH_WINDOW_MS: u64 = 120_000;
pub const MAX_SPEECH_LOG: usize = 64;
pub const MAX_ACTION_LOG: usize = 256;
pub const MAX_MESSAGE_CHARS: usize = 280;
pub const NEARBY_RADIUS: i32 = 8;
pub const MAX_NEARBY_AGENTS: usize = 8;
pub const MAX_NEARBY_BUILDINGS: usize = 6;
pub const MAX_OPEN_JOBS: usize = 5;
pub const MAX_SOCIAL_ITEMS: usize = 3;
pub const MAX_OBSERVED_SPEECH: usize = 8;
pub const MAX_OBSERVED_MEMORY: usize = 5;

// ============================================================================
// Settings and Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WorldSettings {
    pub grid: GridConfig,
    pub continue_paths: bool,
    pub seed: u64,
    pub minutes_per_tick: u64,
    pub memory_limit: usize,
    pub disconnect_timeout_ms: u64,
    pub speech_window_ms: u64,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            continue_paths: true,
            seed: 7,
            minutes_per_tick: 1,
            memory_limit: super::agents::DEFAULT_MEMORY_LIMIT,
            disconnect_timeout_ms: super::agents::DEFAULT_DISCONNECT_TIMEOUT_MS,
            speech_window_ms: DEFAULT_SPEECH_WINDOW_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("agent {agent_id} is not in the world")]
    UnknownAgent { agent_id: AgentId },
    #[error("no free walkable tile to spawn on")]
    NoSpawnPoint,
    #[error("unknown building {building_id}")]
    UnknownBuilding { building_id: BuildingId },
    #[error("agent {agent_id} is not inside a building")]
    NotInBuilding { agent_id: AgentId },
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Move(#[from] MoveError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl WorldError {
    pub fn tag(&self) -> &'static str {
        match self {
            WorldError::UnknownAgent { .. } => "unknown_agent",
            WorldError::NoSpawnPoint => "no_spawn_point",
            WorldError::UnknownBuilding { .. } => "unknown_building",
            WorldError::NotInBuilding { .. } => "not_in_building",
            WorldError::EmptyMessage => "empty_message",
            WorldError::Move(err) => err.tag(),
            WorldError::Queue(QueueError::DuplicateId { .. }) => "duplicate_action_id",
        }
    }
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechEntry {
    pub at: TimestampMs,
    pub agent_id: AgentId,
    pub name: String,
    pub message: String,
    pub x: i32,
    pub y: i32,
}

/// Recent utterances, bounded by count and by age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechLog {
    entries: VecDeque<SpeechEntry>,
    window_ms: u64,
}

impl SpeechLog {
    pub fn new(window_ms: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            window_ms,
        }
    }

    pub fn push(&mut self, entry: SpeechEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_SPEECH_LOG {
            self.entries.pop_front();
        }
    }

    pub fn prune(&mut self, now: TimestampMs) {
        let window = self.window_ms;
        self.entries
            .retain(|entry| now.saturating_sub(entry.at) <= window);
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &SpeechEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest-first utterances heard within `radius` tiles of `pos`.
    pub fn heard_near(&self, pos: TilePos, radius: i32, limit: usize) -> Vec<SpeechEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| TilePos::new(entry.x, entry.y).chebyshev(pos) <= radius)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub at: TimestampMs,
    pub tick: TickId,
    pub agent_id: AgentId,
    pub action_type: String,
    pub status: String,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionLog {
    entries: VecDeque<ActionLogEntry>,
}

impl ActionLog {
    pub fn push(&mut self, entry: ActionLogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_ACTION_LOG {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &ActionLogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Reports and Observation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRejection {
    pub action_id: ActionId,
    pub agent_id: AgentId,
    pub action_type: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueReport {
    pub processed: usize,
    pub rejected: Vec<QueueRejection>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhysicsReport {
    pub weather_changed: Option<Weather>,
    pub step_events: Vec<StepEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyAgent {
    pub id: AgentId,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub distance: i32,
    pub state: MotionState,
    pub current_building: Option<BuildingId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyBuilding {
    pub id: BuildingId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub entrance: TilePos,
    pub distance: i32,
    pub occupants: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EconomyObservation {
    pub balance: f64,
    pub job: Option<JobView>,
    pub open_jobs: Vec<JobView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialObservation {
    pub favor: FavorStanding,
    pub negotiations: Vec<Value>,
    pub commitments: Vec<Value>,
}

/// Bounded, read-only view of the world from one agent's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub agent_id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub tick: TickId,
    pub position: AgentPosition,
    pub destination: Option<TilePos>,
    pub last_goal: Option<String>,
    pub last_thought: Option<String>,
    pub memory: Vec<MemoryEntry>,
    pub nearby_agents: Vec<NearbyAgent>,
    pub nearby_buildings: Vec<NearbyBuilding>,
    pub economy: EconomyObservation,
    pub social: SocialObservation,
    pub recent_speech: Vec<SpeechEntry>,
    pub world_time: WorldTimeView,
}

// ============================================================================
// World
// ============================================================================

#[derive(Debug)]
pub struct World {
    settings: WorldSettings,
    grid: WorldGrid,
    movement: MovementController,
    agents: AgentRegistry,
    queue: ActionQueue,
    clock: WorldClock,
    collaborators: Collaborators,
    speech: SpeechLog,
    action_log: ActionLog,
    tick: TickId,
}

impl World {
    pub fn new(settings: WorldSettings, grid: WorldGrid, collaborators: Collaborators) -> Self {
        Self {
            movement: MovementController::new(settings.continue_paths),
            agents: AgentRegistry::new(settings.memory_limit, settings.disconnect_timeout_ms),
            queue: ActionQueue::new(),
            clock: WorldClock::new(settings.seed, settings.minutes_per_tick),
            speech: SpeechLog::new(settings.speech_window_ms),
            action_log: ActionLog::default(),
            tick: 0,
            collaborators,
            grid,
            settings,
        }
    }

    /// Builds a world on the generated town map.
    pub fn generate(settings: WorldSettings, collaborators: Collaborators) -> Result<Self, GridError> {
        let grid = WorldGrid::generate(settings.grid)?;
        Ok(Self::new(settings, grid, collaborators))
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    pub fn grid(&self) -> &WorldGrid {
        &self.grid
    }

    pub fn movement(&self) -> &MovementController {
        &self.movement
    }

    pub fn positions(&self) -> &BTreeMap<AgentId, AgentPosition> {
        self.movement.positions()
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn agents_mut(&mut self) -> &mut AgentRegistry {
        &mut self.agents
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn clock(&self) -> &WorldClock {
        &self.clock
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn collaborators_mut(&mut self) -> &mut Collaborators {
        &mut self.collaborators
    }

    pub fn speech_log(&self) -> &SpeechLog {
        &self.speech
    }

    pub fn action_log(&self) -> &ActionLog {
        &self.action_log
    }

    pub fn action_log_mut(&mut self) -> &mut ActionLog {
        &mut self.action_log
    }

    pub fn tick(&self) -> TickId {
        self.tick
    }

    pub fn advance_tick(&mut self) -> TickId {
        self.tick += 1;
        self.tick
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().map(|profile| profile.id.clone()).collect()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Places an agent on the nearest free walkable tile to `preferred` (the
    /// map center by default). An agent already in the world is reconnected in
    /// place.
    pub fn spawn_agent(
        &mut self,
        agent_id: &str,
        name: &str,
        kind: AgentKind,
        preferred: Option<TilePos>,
        now: TimestampMs,
    ) -> Result<TilePos, WorldError> {
        if let Some(existing) = self.movement.position(agent_id).map(AgentPosition::tile) {
            self.agents.touch(agent_id, now);
            return Ok(existing);
        }
        let preferred = preferred
            .unwrap_or_else(|| TilePos::new(self.grid.width() / 2, self.grid.height() / 2));
        let spawn = self
            .grid
            .find_spawn_point(preferred, &self.movement.occupied_tiles())
            .ok_or(WorldError::NoSpawnPoint)?;
        self.movement.place(&mut self.grid, agent_id, spawn, now);
        if self.agents.contains(agent_id) {
            self.agents.touch(agent_id, now);
        } else {
            self.agents
                .insert(AgentProfile::new(agent_id, name, kind, now));
        }
        tracing::info!(agent_id, x = spawn.x, y = spawn.y, ?kind, "agent spawned");
        Ok(spawn)
    }

    pub fn despawn_agent(&mut self, agent_id: &str) -> bool {
        let had_position = self.movement.remove(&mut self.grid, agent_id).is_some();
        let had_profile = self.agents.remove(agent_id).is_some();
        had_position || had_profile
    }

    /// Marks a human disconnected. Its position stays until the registry's
    /// timeout removes it during housekeeping.
    pub fn disconnect_agent(&mut self, agent_id: &str, now: TimestampMs) -> bool {
        self.agents.disconnect(agent_id, now)
    }

    // ------------------------------------------------------------------------
    // Action Queue
    // ------------------------------------------------------------------------

    pub fn enqueue(
        &mut self,
        agent_id: &str,
        priority: i32,
        action: QueuedActionKind,
        now: TimestampMs,
    ) -> Result<ActionId, WorldError> {
        self.require_agent(agent_id)?;
        let id = self.queue.next_action_id();
        self.queue
            .enqueue(QueuedAction::new(id.clone(), agent_id, priority, now, action))?;
        Ok(id)
    }

    pub fn enqueue_action(&mut self, action: QueuedAction) -> Result<(), WorldError> {
        self.queue.enqueue(action)?;
        Ok(())
    }

    /// Drains the queue in order. Each action is applied on its own; one
    /// failure is recorded and never stops the rest.
    pub fn process_queue(&mut self, now: TimestampMs) -> QueueReport {
        let mut report = QueueReport::default();
        for action in self.queue.drain() {
            report.processed += 1;
            let outcome = self.apply_queued(&action, now);
            let (status, detail) = match &outcome {
                Ok(()) => ("ok", Value::Null),
                Err(err) => ("rejected", Value::String(err.tag().to_string())),
            };
            self.action_log.push(ActionLogEntry {
                at: now,
                tick: self.tick,
                agent_id: action.agent_id.clone(),
                action_type: action.action.as_str().to_string(),
                status: status.to_string(),
                detail,
            });
            if let Err(err) = outcome {
                tracing::debug!(
                    action_id = %action.id,
                    agent_id = %action.agent_id,
                    error = %err,
                    "queued action rejected"
                );
                report.rejected.push(QueueRejection {
                    action_id: action.id,
                    agent_id: action.agent_id,
                    action_type: action.action.as_str().to_string(),
                    error: err.tag().to_string(),
                });
            }
        }
        report
    }

    fn apply_queued(&mut self, action: &QueuedAction, now: TimestampMs) -> Result<(), WorldError> {
        let agent_id = action.agent_id.as_str();
        match &action.action {
            QueuedActionKind::MoveTo { x, y } => {
                self.move_agent(agent_id, TilePos::new(*x, *y), now)?;
            }
            QueuedActionKind::Speak { message } => {
                self.speak(agent_id, message, now)?;
            }
            QueuedActionKind::EnterBuilding { building_id } => {
                self.enter_building(agent_id, building_id, now)?;
            }
            QueuedActionKind::LeaveBuilding => {
                self.leave_building(agent_id, now)?;
            }
            QueuedActionKind::Wait => {
                self.require_agent(agent_id)?;
                self.movement.stop(agent_id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Agent Actions
    // ------------------------------------------------------------------------

    fn require_agent(&self, agent_id: &str) -> Result<&AgentPosition, WorldError> {
        self.movement
            .position(agent_id)
            .ok_or_else(|| WorldError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })
    }

    pub fn move_agent(
        &mut self,
        agent_id: &str,
        target: TilePos,
        now: TimestampMs,
    ) -> Result<Vec<TilePos>, WorldError> {
        let outcome = self.movement.move_to(&self.grid, agent_id, target, now)?;
        Ok(outcome.path)
    }

    /// Walks to the building entrance. An agent already inside gets an empty
    /// path.
    pub fn enter_building(
        &mut self,
        agent_id: &str,
        building_id: &str,
        now: TimestampMs,
    ) -> Result<Vec<TilePos>, WorldError> {
        let here = self.require_agent(agent_id)?.clone();
        let building = self
            .grid
            .building(building_id)
            .ok_or_else(|| WorldError::UnknownBuilding {
                building_id: building_id.to_string(),
            })?;
        if here.current_building.as_deref() == Some(building_id) {
            return Ok(Vec::new());
        }
        let entrance = building.entrance();
        self.move_agent(agent_id, entrance, now)
    }

    /// Walks out to the nearest free walkable tile outside the footprint.
    pub fn leave_building(
        &mut self,
        agent_id: &str,
        now: TimestampMs,
    ) -> Result<Vec<TilePos>, WorldError> {
        let here = self.require_agent(agent_id)?.clone();
        let building = here
            .current_building
            .as_deref()
            .and_then(|building_id| self.grid.building(building_id))
            .ok_or_else(|| WorldError::NotInBuilding {
                agent_id: agent_id.to_string(),
            })?;
        let mut blocked = self.movement.occupied_tiles();
        for y in building.y..building.y + building.height {
            for x in building.x..building.x + building.width {
                blocked.insert(TilePos::new(x, y));
            }
        }
        let doorstep = TilePos::new(building.entrance().x, building.y + building.height);
        let exit = self
            .grid
            .find_spawn_point(doorstep, &blocked)
            .ok_or(WorldError::NoSpawnPoint)?;
        self.move_agent(agent_id, exit, now)
    }

    pub fn speak(
        &mut self,
        agent_id: &str,
        message: &str,
        now: TimestampMs,
    ) -> Result<SpeechEntry, WorldError> {
        let pos = self.require_agent(agent_id)?.tile();
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(WorldError::EmptyMessage);
        }
        let text: String = trimmed.chars().take(MAX_MESSAGE_CHARS).collect();
        let name = self
            .agents
            .get(agent_id)
            .map(|profile| profile.name.clone())
            .unwrap_or_else(|| agent_id.to_string());
        let entry = SpeechEntry {
            at: now,
            agent_id: agent_id.to_string(),
            name,
            message: text.clone(),
            x: pos.x,
            y: pos.y,
        };
        self.speech.push(entry.clone());
        self.agents.remember(
            agent_id,
            MemoryEntry {
                at: now,
                kind: "said".to_string(),
                text,
            },
        );
        Ok(entry)
    }

    // ------------------------------------------------------------------------
    // Tick Steps
    // ------------------------------------------------------------------------

    /// Advances time of day, weather, and every in-flight step.
    pub fn physics_tick(&mut self, now: TimestampMs) -> PhysicsReport {
        let weather_changed = self.clock.advance();
        let step_events = self.movement.tick(&mut self.grid, now);
        PhysicsReport {
            weather_changed,
            step_events,
        }
    }

    /// Prunes memories and speech, and removes agents whose disconnect timed
    /// out. Returns the removed ids.
    pub fn housekeeping(&mut self, now: TimestampMs) -> Vec<AgentId> {
        let expired = self.agents.prune(now);
        for agent_id in &expired {
            self.movement.remove(&mut self.grid, agent_id);
            tracing::info!(agent_id = %agent_id, "agent removed after disconnect timeout");
        }
        self.speech.prune(now);
        expired
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn observe(&self, agent_id: &str) -> Option<Observation> {
        let position = self.movement.position(agent_id)?.clone();
        let profile = self.agents.get(agent_id)?;
        let here = position.tile();

        let mut nearby_agents: Vec<NearbyAgent> = self
            .movement
            .positions()
            .values()
            .filter(|other| other.id != agent_id)
            .filter(|other| other.tile().chebyshev(here) <= NEARBY_RADIUS)
            .map(|other| NearbyAgent {
                id: other.id.clone(),
                name: self
                    .agents
                    .get(&other.id)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| other.id.clone()),
                x: other.x,
                y: other.y,
                distance: other.tile().manhattan(here),
                state: other.state,
                current_building: other.current_building.clone(),
            })
            .collect();
        nearby_agents.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        nearby_agents.truncate(MAX_NEARBY_AGENTS);

        let mut nearby_buildings: Vec<NearbyBuilding> = self
            .grid
            .buildings()
            .values()
            .map(|building| NearbyBuilding {
                id: building.id.clone(),
                name: building.name.clone(),
                kind: building.kind.clone(),
                entrance: building.entrance(),
                distance: building.entrance().manhattan(here),
                occupants: building.occupancy.len(),
            })
            .collect();
        nearby_buildings.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        nearby_buildings.truncate(MAX_NEARBY_BUILDINGS);

        let economy = &self.collaborators.economy;
        let social = &self.collaborators.social;
        let memory_skip = profile.memory.len().saturating_sub(MAX_OBSERVED_MEMORY);

        Some(Observation {
            agent_id: agent_id.to_string(),
            name: profile.name.clone(),
            kind: profile.kind,
            tick: self.tick,
            destination: self
                .movement
                .movement(agent_id)
                .map(movement_target),
            position,
            last_goal: profile.last_goal.clone(),
            last_thought: profile.last_thought.clone(),
            memory: profile.memory.iter().skip(memory_skip).cloned().collect(),
            nearby_agents,
            nearby_buildings,
            economy: EconomyObservation {
                balance: economy.balance(agent_id),
                job: economy.job(agent_id),
                open_jobs: economy.open_jobs(MAX_OPEN_JOBS),
            },
            social: SocialObservation {
                favor: social.favor_standing(agent_id),
                negotiations: social.recent_negotiations(agent_id, MAX_SOCIAL_ITEMS),
                commitments: social.commitments(agent_id, MAX_SOCIAL_ITEMS),
            },
            recent_speech: self
                .speech
                .heard_near(here, NEARBY_RADIUS, MAX_OBSERVED_SPEECH),
            world_time: self.clock.view(),
        })
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            version: SNAPSHOT_VERSION,
            tick: self.tick,
            grid: self.grid.config(),
            agents: self.agents.profiles().clone(),
            positions: self.movement.positions().clone(),
            movements: self.movement.movements().clone(),
            queue: self.queue.actions().to_vec(),
            next_action_seq: self.queue.next_seq(),
            clock: self.clock.clone(),
            collaborators: self.collaborators.create_snapshots(),
        }
    }

    /// Replaces dynamic state with the snapshot's. The grid itself is static
    /// and must match the snapshot's configuration.
    pub fn restore(&mut self, snapshot: WorldSnapshot) -> Result<(), PersistError> {
        snapshot.validate_version()?;
        let current = self.grid.config();
        if snapshot.grid != current {
            return Err(PersistError::GridMismatch {
                expected: current,
                actual: snapshot.grid,
            });
        }
        self.collaborators
            .load_snapshots(&snapshot.collaborators)
            .map_err(|err| PersistError::Collaborator(err.to_string()))?;

        let previous: BTreeSet<AgentId> = self.movement.positions().keys().cloned().collect();
        for agent_id in &previous {
            self.grid.clear_occupant(agent_id);
        }
        let mut positions = snapshot.positions;
        for (agent_id, record) in positions.iter_mut() {
            record.current_building = self.grid.update_occupancy(agent_id, record.tile());
        }

        self.movement.restore(positions, snapshot.movements);
        self.agents.restore(snapshot.agents);
        self.queue = ActionQueue::restore(snapshot.queue, snapshot.next_action_seq);
        self.clock = snapshot.clock;
        self.tick = snapshot.tick;
        Ok(())
    }
}

fn movement_target(movement: &MovementState) -> TilePos {
    movement
        .full_path
        .as_ref()
        .and_then(|path| path.last().copied())
        .unwrap_or_else(|| movement.destination())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::grid::Building;
    use crate::simulator::types::TileKind;

    fn small_world() -> World {
        let settings = WorldSettings {
            grid: GridConfig {
                width: 16,
                height: 16,
                tile_size: 16,
            },
            ..WorldSettings::default()
        };
        let mut grid = WorldGrid::filled(settings.grid, TileKind::Grass).expect("grid");
        grid.add_building(Building::new("cafe", "Cafe", "cafe", TilePos::new(10, 2), 3, 3))
            .expect("building");
        World::new(settings, grid, Collaborators::default())
    }

    fn run_ticks(world: &mut World, ticks: u64) {
        for tick in 0..ticks {
            world.physics_tick(tick);
        }
    }

    #[test]
    fn spawn_avoids_occupied_tiles_and_reconnects_in_place() {
        let mut world = small_world();
        let a = world
            .spawn_agent("a", "Ada", AgentKind::Human, Some(TilePos::new(2, 2)), 0)
            .expect("spawn");
        let b = world
            .spawn_agent("b", "Bo", AgentKind::Human, Some(TilePos::new(2, 2)), 0)
            .expect("spawn");
        assert_eq!(a, TilePos::new(2, 2));
        assert_ne!(a, b);
        let again = world
            .spawn_agent("a", "Ada", AgentKind::Human, None, 5)
            .expect("spawn");
        assert_eq!(again, a);
        assert_eq!(world.agents().len(), 2);
    }

    #[test]
    fn queue_failures_are_isolated() {
        let mut world = small_world();
        world
            .spawn_agent("a", "Ada", AgentKind::Human, Some(TilePos::new(1, 1)), 0)
            .expect("spawn");
        world
            .enqueue("a", 1, QueuedActionKind::LeaveBuilding, 0)
            .expect("enqueue");
        world
            .enqueue("a", 2, QueuedActionKind::MoveTo { x: 3, y: 1 }, 0)
            .expect("enqueue");
        world
            .enqueue_action(QueuedAction::new(
                "ghost-1",
                "ghost",
                0,
                0,
                QueuedActionKind::Wait,
            ))
            .expect("enqueue");

        let report = world.process_queue(1);
        assert_eq!(report.processed, 3);
        let errors: Vec<&str> = report.rejected.iter().map(|r| r.error.as_str()).collect();
        assert_eq!(errors, vec!["unknown_agent", "not_in_building"]);
        assert!(world.movement().is_moving("a"));
        assert_eq!(world.action_log().len(), 3);
    }

    #[test]
    fn enter_then_leave_building() {
        let mut world = small_world();
        world
            .spawn_agent("a", "Ada", AgentKind::Human, Some(TilePos::new(11, 9)), 0)
            .expect("spawn");
        let path = world.enter_building("a", "cafe", 0).expect("enter");
        assert_eq!(path.last(), Some(&TilePos::new(11, 4)));
        run_ticks(&mut world, 200);
        assert_eq!(
            world.positions()["a"].current_building.as_deref(),
            Some("cafe")
        );
        assert!(world.enter_building("a", "cafe", 0).expect("enter").is_empty());

        let exit = world.leave_building("a", 0).expect("leave");
        assert_eq!(exit.last(), Some(&TilePos::new(11, 5)));
        run_ticks(&mut world, 200);
        assert_eq!(world.positions()["a"].current_building, None);
        assert!(world.grid().building("cafe").unwrap().occupancy.is_empty());
    }

    #[test]
    fn speak_trims_and_records() {
        let mut world = small_world();
        world
            .spawn_agent("a", "Ada", AgentKind::Human, Some(TilePos::new(1, 1)), 0)
            .expect("spawn");
        assert_eq!(world.speak("a", "   ", 0), Err(WorldError::EmptyMessage));
        let long = "x".repeat(MAX_MESSAGE_CHARS + 20);
        let entry = world.speak("a", &long, 0).expect("speak");
        assert_eq!(entry.message.len(), MAX_MESSAGE_CHARS);
        assert_eq!(world.speech_log().len(), 1);
        assert_eq!(world.agents().get("a").unwrap().memory.len(), 1);
    }

    #[test]
    fn observation_is_bounded_and_sorted() {
        let mut world = small_world();
        world
            .spawn_agent("me", "Me", AgentKind::Npc, Some(TilePos::new(5, 5)), 0)
            .expect("spawn");
        for index in 0..12 {
            world
                .spawn_agent(
                    &format!("n{index:02}"),
                    "N",
                    AgentKind::Npc,
                    Some(TilePos::new(5, 5)),
                    0,
                )
                .expect("spawn");
        }
        world
            .spawn_agent("far", "Far", AgentKind::Npc, Some(TilePos::new(15, 15)), 0)
            .expect("spawn");
        world.speak("n00", "hello", 0).expect("speak");

        let observation = world.observe("me").expect("observation");
        assert_eq!(observation.nearby_agents.len(), MAX_NEARBY_AGENTS);
        assert!(observation
            .nearby_agents
            .windows(2)
            .all(|pair| pair[0].distance <= pair[1].distance));
        assert!(observation.nearby_agents.iter().all(|agent| agent.id != "far"));
        assert_eq!(observation.nearby_buildings[0].id, "cafe");
        assert_eq!(observation.recent_speech.len(), 1);
        assert_eq!(observation.economy.open_jobs.len(), 4);
        assert!(world.observe("nobody").is_none());
    }

    #[test]
    fn housekeeping_drops_timed_out_humans() {
        let mut world = small_world();
        world
            .spawn_agent("h", "Hal", AgentKind::Human, Some(TilePos::new(1, 1)), 0)
            .expect("spawn");
        world.disconnect_agent("h", 0);
        let timeout = world.settings().disconnect_timeout_ms;
        assert!(world.housekeeping(timeout - 1).is_empty());
        assert_eq!(world.housekeeping(timeout), vec!["h".to_string()]);
        assert!(world.positions().is_empty());
    }
}

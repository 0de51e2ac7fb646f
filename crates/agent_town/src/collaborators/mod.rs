//! Collaborator contracts: the domain managers the tick drives.
//!
//! The core only knows these traits. Every manager exposes a `tick` entry
//! point plus optional summary/snapshot accessors; the economy, social and
//! policy managers additionally expose the read and write ports the decision
//! pipeline and the action executor call into.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::simulator::{AgentId, TickId, TilePos, TimestampMs, WorldTimeView};

mod economy;
mod events;
mod governance;
mod npc;
mod social;

pub use economy::InMemoryEconomy;
pub use events::{EventCalendar, ScheduledEvent};
pub use governance::{ScheduledPolicy, StaticPolicySource};
pub use npc::{NpcRosterEntry, StaticNpcSpawner};
pub use social::InMemorySocialLedger;

// ============================================================================
// Shared Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{collaborator}: unknown {entity} {id}")]
    NotFound {
        collaborator: String,
        entity: String,
        id: String,
    },
    #[error("{collaborator}: {reason}")]
    Rejected { collaborator: String, reason: String },
    #[error("{collaborator}: invalid snapshot: {message}")]
    Snapshot {
        collaborator: String,
        message: String,
    },
}

impl CollaboratorError {
    pub fn rejected(collaborator: &str, reason: impl Into<String>) -> Self {
        CollaboratorError::Rejected {
            collaborator: collaborator.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(collaborator: &str, entity: &str, id: impl Into<String>) -> Self {
        CollaboratorError::NotFound {
            collaborator: collaborator.to_string(),
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            CollaboratorError::NotFound { .. } => "not_found",
            CollaboratorError::Rejected { .. } => "rejected",
            CollaboratorError::Snapshot { .. } => "invalid_snapshot",
        }
    }
}

/// Read-only view handed to every collaborator tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickContext<'a> {
    pub tick: TickId,
    pub now: TimestampMs,
    pub live_agents: usize,
    pub agent_ids: &'a [AgentId],
    pub time: &'a WorldTimeView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTransition {
    pub event_id: String,
    pub name: String,
    pub status: String,
    /// Balance change applied to every agent by the economy.
    #[serde(default)]
    pub economy_bonus: f64,
    /// Reputation change applied to every agent by the social ledger.
    #[serde(default)]
    pub reputation_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NpcSpawn {
    pub agent_id: AgentId,
    pub name: String,
    pub preferred: Option<TilePos>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollaboratorOutput {
    pub transitions: Vec<EventTransition>,
    pub spawns: Vec<NpcSpawn>,
    pub despawns: Vec<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub salary_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub title: String,
    pub salary: f64,
    pub building_id: Option<String>,
    pub holder: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavorStanding {
    pub balance: f64,
    pub risk: String,
    pub reputation: f64,
}

// ============================================================================
// Traits
// ============================================================================

/// Tick entry point shared by every domain manager.
pub trait TickCollaborator: Send {
    fn name(&self) -> &str;

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<CollaboratorOutput, CollaboratorError>;

    fn summary(&self) -> Value {
        Value::Null
    }

    fn create_snapshot(&self) -> Option<Value> {
        None
    }

    fn load_snapshot(&mut self, _snapshot: Value) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

pub trait EconomyPort: TickCollaborator {
    fn balance(&self, agent_id: &str) -> f64;
    fn job(&self, agent_id: &str) -> Option<JobView>;
    fn open_jobs(&self, limit: usize) -> Vec<JobView>;
    fn has_pending_application(&self, agent_id: &str, job_id: &str) -> bool;
    fn apply_job(&mut self, agent_id: &str, job_id: &str) -> Result<Value, CollaboratorError>;
    fn vote_job(
        &mut self,
        voter_id: &str,
        applicant_id: &str,
        job_id: &str,
    ) -> Result<Value, CollaboratorError>;
    fn apply_policies(&mut self, policies: &[Policy]);
    fn apply_event_effects(&mut self, transitions: &[EventTransition], agent_ids: &[AgentId]);
}

pub trait SocialPort: TickCollaborator {
    fn favor_standing(&self, agent_id: &str) -> FavorStanding;
    fn recent_negotiations(&self, agent_id: &str, limit: usize) -> Vec<Value>;
    fn commitments(&self, agent_id: &str, limit: usize) -> Vec<Value>;
    fn interact(
        &mut self,
        agent_id: &str,
        target_id: &str,
        kind: &str,
        message: Option<&str>,
    ) -> Result<Value, CollaboratorError>;
    fn propose(
        &mut self,
        agent_id: &str,
        target_id: &str,
        terms: &Value,
    ) -> Result<Value, CollaboratorError>;
    fn counter(
        &mut self,
        agent_id: &str,
        negotiation_id: &str,
        terms: &Value,
    ) -> Result<Value, CollaboratorError>;
    fn accept(&mut self, agent_id: &str, negotiation_id: &str) -> Result<Value, CollaboratorError>;
    fn declare_commitment(
        &mut self,
        agent_id: &str,
        target_id: Option<&str>,
        description: &str,
    ) -> Result<Value, CollaboratorError>;
    fn create_favor(
        &mut self,
        agent_id: &str,
        target_id: &str,
        value: f64,
    ) -> Result<Value, CollaboratorError>;
    fn repay_favor(&mut self, agent_id: &str, favor_id: &str) -> Result<Value, CollaboratorError>;
    fn apply_event_effects(&mut self, transitions: &[EventTransition], agent_ids: &[AgentId]);
}

pub trait PolicyPort: TickCollaborator {
    fn active_policies(&self) -> Vec<Policy>;
}

/// Placeholder for manager slots a deployment does not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullCollaborator {
    name: String,
}

impl NullCollaborator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TickCollaborator for NullCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, _ctx: &TickContext<'_>) -> Result<CollaboratorOutput, CollaboratorError> {
        Ok(CollaboratorOutput::default())
    }
}

// ============================================================================
// Collaborator Set
// ============================================================================

/// Secondary manager slots. Declaration order is tick order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerSlot {
    Voting,
    Mood,
    Aesthetics,
    Events,
    NpcSpawner,
    ScheduledEvents,
    Health,
    MicroEvents,
    Conversations,
}

impl ManagerSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            ManagerSlot::Voting => "voting",
            ManagerSlot::Mood => "mood",
            ManagerSlot::Aesthetics => "aesthetics",
            ManagerSlot::Events => "events",
            ManagerSlot::NpcSpawner => "npc_spawner",
            ManagerSlot::ScheduledEvents => "scheduled_events",
            ManagerSlot::Health => "health",
            ManagerSlot::MicroEvents => "micro_events",
            ManagerSlot::Conversations => "conversations",
        }
    }

    /// Slots whose summaries ride along in the viewer broadcast.
    pub fn broadcast_summary(self) -> bool {
        matches!(
            self,
            ManagerSlot::Voting
                | ManagerSlot::Mood
                | ManagerSlot::Aesthetics
                | ManagerSlot::Events
                | ManagerSlot::Conversations
        )
    }
}

pub struct Collaborators {
    pub economy: Box<dyn EconomyPort>,
    pub social: Box<dyn SocialPort>,
    pub governance: Box<dyn PolicyPort>,
    pub managers: BTreeMap<ManagerSlot, Box<dyn TickCollaborator>>,
    pub micro_events_enabled: bool,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("economy", &self.economy.name())
            .field("social", &self.social.name())
            .field("governance", &self.governance.name())
            .field("managers", &self.managers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            economy: Box::new(InMemoryEconomy::default()),
            social: Box::new(InMemorySocialLedger::default()),
            governance: Box::new(StaticPolicySource::default()),
            managers: BTreeMap::new(),
            micro_events_enabled: false,
        }
    }
}

impl Collaborators {
    pub fn with_manager(mut self, slot: ManagerSlot, manager: Box<dyn TickCollaborator>) -> Self {
        self.managers.insert(slot, manager);
        self
    }

    pub fn manager_mut(&mut self, slot: ManagerSlot) -> Option<&mut (dyn TickCollaborator + 'static)> {
        self.managers.get_mut(&slot).map(|manager| manager.as_mut())
    }

    /// Snapshot of every collaborator that keeps state, keyed by name.
    pub fn create_snapshots(&self) -> BTreeMap<String, Value> {
        let mut snapshots = BTreeMap::new();
        let mut push = |name: &str, snapshot: Option<Value>| {
            if let Some(snapshot) = snapshot {
                snapshots.insert(name.to_string(), snapshot);
            }
        };
        push(self.economy.name(), self.economy.create_snapshot());
        push(self.social.name(), self.social.create_snapshot());
        push(self.governance.name(), self.governance.create_snapshot());
        for manager in self.managers.values() {
            push(manager.name(), manager.create_snapshot());
        }
        snapshots
    }

    pub fn load_snapshots(
        &mut self,
        snapshots: &BTreeMap<String, Value>,
    ) -> Result<(), CollaboratorError> {
        fn load<T: TickCollaborator + ?Sized>(
            target: &mut T,
            snapshots: &BTreeMap<String, Value>,
        ) -> Result<(), CollaboratorError> {
            match snapshots.get(target.name()) {
                Some(snapshot) => target.load_snapshot(snapshot.clone()),
                None => Ok(()),
            }
        }
        load(self.economy.as_mut(), snapshots)?;
        load(self.social.as_mut(), snapshots)?;
        load(self.governance.as_mut(), snapshots)?;
        for manager in self.managers.values_mut() {
            load(manager.as_mut(), snapshots)?;
        }
        Ok(())
    }

    pub fn broadcast_summaries(&self) -> BTreeMap<String, Value> {
        let mut summaries = BTreeMap::new();
        summaries.insert("governance".to_string(), self.governance.summary());
        for (slot, manager) in &self.managers {
            if slot.broadcast_summary() {
                summaries.insert(slot.as_str().to_string(), manager.summary());
            }
        }
        summaries
    }
}

pub(crate) fn snapshot_error(collaborator: &str, err: serde_json::Error) -> CollaboratorError {
    CollaboratorError::Snapshot {
        collaborator: collaborator.to_string(),
        message: err.to_string(),
    }
}

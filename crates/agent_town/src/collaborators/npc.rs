//! NPC spawner driven by a fixed roster.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{CollaboratorError, CollaboratorOutput, NpcSpawn, TickCollaborator, TickContext};
use crate::simulator::{AgentId, TilePos};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcRosterEntry {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub x: Option<i32>,
    #[serde(default)]
    pub y: Option<i32>,
}

impl NpcRosterEntry {
    fn preferred(&self) -> Option<TilePos> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some(TilePos::new(x, y)),
            _ => None,
        }
    }
}

/// Keeps every roster NPC present, re-requesting a spawn whenever one is
/// missing from the world.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StaticNpcSpawner {
    roster: Vec<NpcRosterEntry>,
    spawn_requests: u64,
}

impl StaticNpcSpawner {
    pub fn new(roster: Vec<NpcRosterEntry>) -> Self {
        Self {
            roster,
            spawn_requests: 0,
        }
    }
}

impl TickCollaborator for StaticNpcSpawner {
    fn name(&self) -> &str {
        "npc_spawner"
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<CollaboratorOutput, CollaboratorError> {
        let spawns: Vec<NpcSpawn> = self
            .roster
            .iter()
            .filter(|entry| !ctx.agent_ids.contains(&entry.id))
            .map(|entry| NpcSpawn {
                agent_id: entry.id.clone(),
                name: entry.name.clone(),
                preferred: entry.preferred(),
            })
            .collect();
        self.spawn_requests += spawns.len() as u64;
        Ok(CollaboratorOutput {
            spawns,
            ..CollaboratorOutput::default()
        })
    }

    fn summary(&self) -> Value {
        json!({ "roster": self.roster.len(), "spawnRequests": self.spawn_requests })
    }
}

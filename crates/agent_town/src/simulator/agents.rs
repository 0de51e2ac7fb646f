//! Agent registry: connected clients and NPCs, bounded memory, reasoning.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::types::{AgentId, AgentKind, TimestampMs};

pub const DEFAULT_MEMORY_LIMIT: usize = 32;
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub at: TimestampMs,
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub connected: bool,
    pub last_seen: TimestampMs,
    pub disconnected_at: Option<TimestampMs>,
    pub last_goal: Option<String>,
    pub last_thought: Option<String>,
    #[serde(default)]
    pub memory: VecDeque<MemoryEntry>,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>, kind: AgentKind, now: TimestampMs) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            connected: kind == AgentKind::Human,
            last_seen: now,
            disconnected_at: None,
            last_goal: None,
            last_thought: None,
            memory: VecDeque::new(),
        }
    }

    pub fn is_npc(&self) -> bool {
        self.kind == AgentKind::Npc
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentId, AgentProfile>,
    memory_limit: usize,
    disconnect_timeout_ms: u64,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT, DEFAULT_DISCONNECT_TIMEOUT_MS)
    }
}

impl AgentRegistry {
    pub fn new(memory_limit: usize, disconnect_timeout_ms: u64) -> Self {
        Self {
            agents: BTreeMap::new(),
            memory_limit: memory_limit.max(1),
            disconnect_timeout_ms,
        }
    }

    pub fn insert(&mut self, profile: AgentProfile) {
        self.agents.insert(profile.id.clone(), profile);
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentProfile> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents that count as present: connected humans and every NPC.
    pub fn live_count(&self) -> usize {
        self.agents
            .values()
            .filter(|profile| profile.connected || profile.is_npc())
            .count()
    }

    pub fn touch(&mut self, agent_id: &str, now: TimestampMs) {
        if let Some(profile) = self.agents.get_mut(agent_id) {
            profile.last_seen = now;
            profile.connected = true;
            profile.disconnected_at = None;
        }
    }

    pub fn disconnect(&mut self, agent_id: &str, now: TimestampMs) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(profile) if profile.connected => {
                profile.connected = false;
                profile.disconnected_at = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn remember(&mut self, agent_id: &str, entry: MemoryEntry) {
        let limit = self.memory_limit;
        if let Some(profile) = self.agents.get_mut(agent_id) {
            profile.memory.push_back(entry);
            while profile.memory.len() > limit {
                profile.memory.pop_front();
            }
        }
    }

    pub fn record_reasoning(&mut self, agent_id: &str, goal: &str, thought: &str) {
        if let Some(profile) = self.agents.get_mut(agent_id) {
            if !goal.is_empty() {
                profile.last_goal = Some(goal.to_string());
            }
            if !thought.is_empty() {
                profile.last_thought = Some(thought.to_string());
            }
        }
    }

    /// Housekeeping pass: trims memories and drops humans whose disconnect
    /// outlived the timeout. Returns the removed ids.
    pub fn prune(&mut self, now: TimestampMs) -> Vec<AgentId> {
        let limit = self.memory_limit;
        let timeout = self.disconnect_timeout_ms;
        let mut expired = Vec::new();
        for profile in self.agents.values_mut() {
            while profile.memory.len() > limit {
                profile.memory.pop_front();
            }
            if let Some(since) = profile.disconnected_at {
                if !profile.is_npc() && now.saturating_sub(since) >= timeout {
                    expired.push(profile.id.clone());
                }
            }
        }
        for agent_id in &expired {
            self.agents.remove(agent_id);
        }
        expired
    }

    pub(crate) fn profiles(&self) -> &BTreeMap<AgentId, AgentProfile> {
        &self.agents
    }

    pub(crate) fn restore(&mut self, agents: BTreeMap<AgentId, AgentProfile>) {
        self.agents = agents;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_is_bounded() {
        let mut registry = AgentRegistry::new(2, 1_000);
        registry.insert(AgentProfile::new("a", "Ada", AgentKind::Human, 0));
        for index in 0..5 {
            registry.remember(
                "a",
                MemoryEntry {
                    at: index,
                    kind: "note".to_string(),
                    text: format!("n{index}"),
                },
            );
        }
        let memory = &registry.get("a").unwrap().memory;
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.back().unwrap().text, "n4");
    }

    #[test]
    fn disconnected_humans_expire_but_npcs_stay() {
        let mut registry = AgentRegistry::new(4, 1_000);
        registry.insert(AgentProfile::new("h", "Hal", AgentKind::Human, 0));
        registry.insert(AgentProfile::new("n", "Nia", AgentKind::Npc, 0));
        assert_eq!(registry.live_count(), 2);
        assert!(registry.disconnect("h", 100));
        assert_eq!(registry.live_count(), 1);
        assert!(registry.prune(500).is_empty());
        assert_eq!(registry.prune(1_100), vec!["h".to_string()]);
        assert!(registry.contains("n"));
    }

    #[test]
    fn touch_reconnects() {
        let mut registry = AgentRegistry::default();
        registry.insert(AgentProfile::new("h", "Hal", AgentKind::Human, 0));
        registry.disconnect("h", 10);
        registry.touch("h", 20);
        let profile = registry.get("h").unwrap();
        assert!(profile.connected);
        assert_eq!(profile.disconnected_at, None);
    }
}

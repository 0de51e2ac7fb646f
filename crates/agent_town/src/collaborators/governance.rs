//! Governance policy source: a fixed schedule of policies with tick windows.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    snapshot_error, CollaboratorError, CollaboratorOutput, Policy, PolicyPort, TickCollaborator,
    TickContext,
};
use crate::simulator::TickId;

const NAME: &str = "governance";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledPolicy {
    pub policy: Policy,
    pub from_tick: TickId,
    pub until_tick: Option<TickId>,
}

impl ScheduledPolicy {
    fn active_at(&self, tick: TickId) -> bool {
        tick >= self.from_tick && self.until_tick.map(|until| tick < until).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GovernanceState {
    current_tick: TickId,
    live_agents: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StaticPolicySource {
    schedule: Vec<ScheduledPolicy>,
    state: GovernanceState,
}

impl StaticPolicySource {
    pub fn new(schedule: Vec<ScheduledPolicy>) -> Self {
        Self {
            schedule,
            state: GovernanceState::default(),
        }
    }
}

impl TickCollaborator for StaticPolicySource {
    fn name(&self) -> &str {
        NAME
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<CollaboratorOutput, CollaboratorError> {
        self.state.current_tick = ctx.tick;
        self.state.live_agents = ctx.live_agents;
        Ok(CollaboratorOutput::default())
    }

    fn summary(&self) -> Value {
        let active: Vec<String> = self
            .active_policies()
            .into_iter()
            .map(|policy| policy.name)
            .collect();
        json!({
            "activePolicies": active,
            "population": self.state.live_agents,
        })
    }

    fn create_snapshot(&self) -> Option<Value> {
        serde_json::to_value(&self.state).ok()
    }

    fn load_snapshot(&mut self, snapshot: Value) -> Result<(), CollaboratorError> {
        self.state = serde_json::from_value(snapshot).map_err(|err| snapshot_error(NAME, err))?;
        Ok(())
    }
}

impl PolicyPort for StaticPolicySource {
    /// Policies active for the tick most recently seen. The runtime applies
    /// these before the governance tick, so they lag by one tick.
    fn active_policies(&self) -> Vec<Policy> {
        self.schedule
            .iter()
            .filter(|scheduled| scheduled.active_at(self.state.current_tick))
            .map(|scheduled| scheduled.policy.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::WorldClock;

    #[test]
    fn policies_follow_their_window() {
        let mut source = StaticPolicySource::new(vec![ScheduledPolicy {
            policy: Policy {
                id: "festival".to_string(),
                name: "Festival Wages".to_string(),
                salary_multiplier: 1.5,
            },
            from_tick: 10,
            until_tick: Some(20),
        }]);
        let time = WorldClock::default().view();
        let mut at = |tick| {
            source
                .tick(&TickContext {
                    tick,
                    now: 0,
                    live_agents: 3,
                    agent_ids: &[],
                    time: &time,
                })
                .expect("tick");
            source.active_policies().len()
        };
        assert_eq!(at(5), 0);
        assert_eq!(at(10), 1);
        assert_eq!(at(20), 0);
    }
}

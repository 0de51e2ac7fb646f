//! In-memory social ledger: interactions, negotiations, commitments and
//! favors with periodic interest and default penalties.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};

use super::{
    snapshot_error, CollaboratorError, CollaboratorOutput, EventTransition, FavorStanding,
    SocialPort, TickCollaborator, TickContext,
};
use crate::simulator::{AgentId, TickId};

const NAME: &str = "social";
const MAX_INTERACTIONS: usize = 256;
pub const INTEREST_INTERVAL_TICKS: u64 = 600;
pub const FAVOR_INTEREST_RATE: f64 = 0.05;
pub const FAVOR_DUE_TICKS: u64 = 6_000;
pub const DEFAULT_PENALTY: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum NegotiationStatus {
    Proposed,
    Countered,
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Negotiation {
    id: String,
    proposer: AgentId,
    counterpart: AgentId,
    terms: Value,
    status: NegotiationStatus,
    last_actor: AgentId,
}

impl Negotiation {
    fn involves(&self, agent_id: &str) -> bool {
        self.proposer == agent_id || self.counterpart == agent_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FavorStatus {
    Open,
    Repaid,
    Defaulted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Favor {
    id: String,
    creditor: AgentId,
    debtor: AgentId,
    principal: f64,
    owed: f64,
    created_tick: TickId,
    status: FavorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Commitment {
    id: String,
    agent_id: AgentId,
    target_id: Option<AgentId>,
    description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Interaction {
    agent_id: AgentId,
    target_id: AgentId,
    kind: String,
    message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerState {
    reputation: BTreeMap<AgentId, f64>,
    interactions: VecDeque<Interaction>,
    negotiations: BTreeMap<String, Negotiation>,
    commitments: Vec<Commitment>,
    favors: BTreeMap<String, Favor>,
    next_id: u64,
    current_tick: TickId,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InMemorySocialLedger {
    state: LedgerState,
}

impl InMemorySocialLedger {
    pub fn reputation(&self, agent_id: &str) -> f64 {
        self.state.reputation.get(agent_id).copied().unwrap_or(0.0)
    }

    pub fn interaction_count(&self) -> usize {
        self.state.interactions.len()
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.state.next_id += 1;
        format!("{prefix}-{:06}", self.state.next_id)
    }

    fn adjust_reputation(&mut self, agent_id: &str, delta: f64) {
        *self
            .state
            .reputation
            .entry(agent_id.to_string())
            .or_insert(0.0) += delta;
    }

    fn negotiation_for_reply(
        &mut self,
        agent_id: &str,
        negotiation_id: &str,
    ) -> Result<&mut Negotiation, CollaboratorError> {
        let negotiation = self
            .state
            .negotiations
            .get_mut(negotiation_id)
            .filter(|negotiation| negotiation.involves(agent_id))
            .ok_or_else(|| CollaboratorError::not_found(NAME, "negotiation", negotiation_id))?;
        if negotiation.status == NegotiationStatus::Accepted {
            return Err(CollaboratorError::rejected(NAME, "negotiation_closed"));
        }
        if negotiation.last_actor == agent_id {
            return Err(CollaboratorError::rejected(NAME, "awaiting_counterpart"));
        }
        Ok(negotiation)
    }

    /// Accrues interest on open favors and defaults overdue ones.
    fn sweep_favors(&mut self, tick: TickId) {
        let accrue = tick > 0 && tick % INTEREST_INTERVAL_TICKS == 0;
        let mut defaulted = Vec::new();
        for favor in self.state.favors.values_mut() {
            if favor.status != FavorStatus::Open {
                continue;
            }
            if accrue {
                favor.owed *= 1.0 + FAVOR_INTEREST_RATE;
            }
            if tick.saturating_sub(favor.created_tick) >= FAVOR_DUE_TICKS {
                favor.status = FavorStatus::Defaulted;
                defaulted.push(favor.debtor.clone());
            }
        }
        for debtor in defaulted {
            self.adjust_reputation(&debtor, -DEFAULT_PENALTY);
        }
    }
}

impl TickCollaborator for InMemorySocialLedger {
    fn name(&self) -> &str {
        NAME
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<CollaboratorOutput, CollaboratorError> {
        self.state.current_tick = ctx.tick;
        self.sweep_favors(ctx.tick);
        Ok(CollaboratorOutput::default())
    }

    fn summary(&self) -> Value {
        let open_favors = self
            .state
            .favors
            .values()
            .filter(|favor| favor.status == FavorStatus::Open)
            .count();
        json!({
            "openFavors": open_favors,
            "negotiations": self.state.negotiations.len(),
            "commitments": self.state.commitments.len(),
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

impl SocialPort for InMemorySocialLedger {
    fn favor_standing(&self, agent_id: &str) -> FavorStanding {
        let mut credit = 0.0;
        let mut debt = 0.0;
        for favor in self.state.favors.values() {
            if favor.status != FavorStatus::Open {
                continue;
            }
            if favor.creditor == agent_id {
                credit += favor.owed;
            }
            if favor.debtor == agent_id {
                debt += favor.owed;
            }
        }
        let risk = if debt < 20.0 {
            "low"
        } else if debt < 50.0 {
            "medium"
        } else {
            "high"
        };
        FavorStanding {
            balance: credit - debt,
            risk: risk.to_string(),
            reputation: self.reputation(agent_id),
        }
    }

    fn recent_negotiations(&self, agent_id: &str, limit: usize) -> Vec<Value> {
        self.state
            .negotiations
            .values()
            .rev()
            .filter(|negotiation| negotiation.involves(agent_id))
            .take(limit)
            .filter_map(|negotiation| serde_json::to_value(negotiation).ok())
            .collect()
    }

    fn commitments(&self, agent_id: &str, limit: usize) -> Vec<Value> {
        self.state
            .commitments
            .iter()
            .rev()
            .filter(|commitment| commitment.agent_id == agent_id)
            .take(limit)
            .filter_map(|commitment| serde_json::to_value(commitment).ok())
            .collect()
    }

    fn interact(
        &mut self,
        agent_id: &str,
        target_id: &str,
        kind: &str,
        message: Option<&str>,
    ) -> Result<Value, CollaboratorError> {
        if agent_id == target_id {
            return Err(CollaboratorError::rejected(NAME, "cannot_interact_with_self"));
        }
        self.state.interactions.push_back(Interaction {
            agent_id: agent_id.to_string(),
            target_id: target_id.to_string(),
            kind: kind.to_string(),
            message: message.map(str::to_string),
        });
        while self.state.interactions.len() > MAX_INTERACTIONS {
            self.state.interactions.pop_front();
        }
        Ok(json!({ "targetId": target_id, "kind": kind }))
    }

    fn propose(
        &mut self,
        agent_id: &str,
        target_id: &str,
        terms: &Value,
    ) -> Result<Value, CollaboratorError> {
        if agent_id == target_id {
            return Err(CollaboratorError::rejected(NAME, "cannot_negotiate_with_self"));
        }
        let id = self.next_id("neg");
        self.state.negotiations.insert(
            id.clone(),
            Negotiation {
                id: id.clone(),
                proposer: agent_id.to_string(),
                counterpart: target_id.to_string(),
                terms: terms.clone(),
                status: NegotiationStatus::Proposed,
                last_actor: agent_id.to_string(),
            },
        );
        Ok(json!({ "negotiationId": id, "status": "proposed" }))
    }

    fn counter(
        &mut self,
        agent_id: &str,
        negotiation_id: &str,
        terms: &Value,
    ) -> Result<Value, CollaboratorError> {
        let negotiation = self.negotiation_for_reply(agent_id, negotiation_id)?;
        negotiation.terms = terms.clone();
        negotiation.status = NegotiationStatus::Countered;
        negotiation.last_actor = agent_id.to_string();
        Ok(json!({ "negotiationId": negotiation_id, "status": "countered" }))
    }

    fn accept(&mut self, agent_id: &str, negotiation_id: &str) -> Result<Value, CollaboratorError> {
        let negotiation = self.negotiation_for_reply(agent_id, negotiation_id)?;
        negotiation.status = NegotiationStatus::Accepted;
        negotiation.last_actor = agent_id.to_string();
        let terms = negotiation.terms.clone();
        Ok(json!({ "negotiationId": negotiation_id, "status": "accepted", "terms": terms }))
    }

    fn declare_commitment(
        &mut self,
        agent_id: &str,
        target_id: Option<&str>,
        description: &str,
    ) -> Result<Value, CollaboratorError> {
        let id = self.next_id("commit");
        self.state.commitments.push(Commitment {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            target_id: target_id.map(str::to_string),
            description: description.to_string(),
        });
        Ok(json!({ "commitmentId": id }))
    }

    fn create_favor(
        &mut self,
        agent_id: &str,
        target_id: &str,
        value: f64,
    ) -> Result<Value, CollaboratorError> {
        if agent_id == target_id {
            return Err(CollaboratorError::rejected(NAME, "cannot_owe_self"));
        }
        if !(value.is_finite() && value > 0.0) {
            return Err(CollaboratorError::rejected(NAME, "favor_value_must_be_positive"));
        }
        let id = self.next_id("favor");
        let created_tick = self.state.current_tick;
        self.state.favors.insert(
            id.clone(),
            Favor {
                id: id.clone(),
                creditor: agent_id.to_string(),
                debtor: target_id.to_string(),
                principal: value,
                owed: value,
                created_tick,
                status: FavorStatus::Open,
            },
        );
        Ok(json!({ "favorId": id, "owed": value }))
    }

    fn repay_favor(&mut self, agent_id: &str, favor_id: &str) -> Result<Value, CollaboratorError> {
        let favor = self
            .state
            .favors
            .get_mut(favor_id)
            .filter(|favor| favor.debtor == agent_id)
            .ok_or_else(|| CollaboratorError::not_found(NAME, "favor", favor_id))?;
        if favor.status != FavorStatus::Open {
            return Err(CollaboratorError::rejected(NAME, "favor_not_open"));
        }
        favor.status = FavorStatus::Repaid;
        let owed = favor.owed;
        self.adjust_reputation(agent_id, 1.0);
        Ok(json!({ "favorId": favor_id, "repaid": owed }))
    }

    fn apply_event_effects(&mut self, transitions: &[EventTransition], agent_ids: &[AgentId]) {
        let delta: f64 = transitions.iter().map(|t| t.reputation_delta).sum();
        if delta == 0.0 {
            return;
        }
        for agent_id in agent_ids {
            self.adjust_reputation(agent_id, delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::WorldClock;

    fn tick(ledger: &mut InMemorySocialLedger, tick: u64) {
        let time = WorldClock::default().view();
        ledger
            .tick(&TickContext {
                tick,
                now: 0,
                live_agents: 0,
                agent_ids: &[],
                time: &time,
            })
            .expect("tick");
    }

    #[test]
    fn negotiation_alternates_turns() {
        let mut ledger = InMemorySocialLedger::default();
        let proposed = ledger.propose("a", "b", &json!({"price": 10})).expect("propose");
        let id = proposed["negotiationId"].as_str().unwrap().to_string();

        assert!(ledger.accept("a", &id).is_err());
        ledger.counter("b", &id, &json!({"price": 8})).expect("counter");
        let accepted = ledger.accept("a", &id).expect("accept");
        assert_eq!(accepted["terms"]["price"], 8);
        assert!(ledger.counter("b", &id, &json!({})).is_err());
        assert_eq!(ledger.recent_negotiations("b", 5).len(), 1);
    }

    #[test]
    fn favors_accrue_interest_and_default() {
        let mut ledger = InMemorySocialLedger::default();
        ledger.create_favor("a", "b", 10.0).expect("favor");
        assert_eq!(ledger.favor_standing("a").balance, 10.0);

        tick(&mut ledger, INTEREST_INTERVAL_TICKS);
        let owed = -ledger.favor_standing("b").balance;
        assert!((owed - 10.5).abs() < 1e-9);

        tick(&mut ledger, FAVOR_DUE_TICKS);
        assert_eq!(ledger.favor_standing("b").balance, 0.0);
        assert_eq!(ledger.reputation("b"), -DEFAULT_PENALTY);
    }

    #[test]
    fn only_debtor_can_repay() {
        let mut ledger = InMemorySocialLedger::default();
        let created = ledger.create_favor("a", "b", 3.0).expect("favor");
        let id = created["favorId"].as_str().unwrap().to_string();
        assert_eq!(ledger.repay_favor("a", &id).unwrap_err().tag(), "not_found");
        ledger.repay_favor("b", &id).expect("repay");
        assert_eq!(ledger.repay_favor("b", &id).unwrap_err().tag(), "rejected");
        assert_eq!(ledger.reputation("b"), 1.0);
    }

    #[test]
    fn invalid_favor_values_are_rejected() {
        let mut ledger = InMemorySocialLedger::default();
        assert!(ledger.create_favor("a", "b", 0.0).is_err());
        assert!(ledger.create_favor("a", "a", 1.0).is_err());
    }
}

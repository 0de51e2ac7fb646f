//! Town event calendar: events move upcoming → active → ended on tick
//! boundaries and report each status change as a transition.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{
    snapshot_error, CollaboratorError, CollaboratorOutput, EventTransition, TickCollaborator,
    TickContext,
};
use crate::simulator::TickId;

const NAME: &str = "events";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEvent {
    pub id: String,
    pub name: String,
    pub start_tick: TickId,
    pub end_tick: TickId,
    #[serde(default)]
    pub economy_bonus: f64,
    #[serde(default)]
    pub reputation_delta: f64,
}

impl ScheduledEvent {
    fn status_at(&self, tick: TickId) -> &'static str {
        if tick < self.start_tick {
            "upcoming"
        } else if tick < self.end_tick {
            "active"
        } else {
            "ended"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventCalendar {
    events: Vec<ScheduledEvent>,
    statuses: BTreeMap<String, String>,
}

impl EventCalendar {
    pub fn new(events: Vec<ScheduledEvent>) -> Self {
        let statuses = events
            .iter()
            .map(|event| (event.id.clone(), "upcoming".to_string()))
            .collect();
        Self { events, statuses }
    }

    pub fn status(&self, event_id: &str) -> Option<&str> {
        self.statuses.get(event_id).map(String::as_str)
    }
}

impl TickCollaborator for EventCalendar {
    fn name(&self) -> &str {
        NAME
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<CollaboratorOutput, CollaboratorError> {
        let mut transitions = Vec::new();
        for event in &self.events {
            let next = event.status_at(ctx.tick);
            let previous = self
                .statuses
                .insert(event.id.clone(), next.to_string());
            if previous.as_deref() == Some(next) {
                continue;
            }
            // Effects land once, when the event opens.
            let opening = next == "active";
            transitions.push(EventTransition {
                event_id: event.id.clone(),
                name: event.name.clone(),
                status: next.to_string(),
                economy_bonus: if opening { event.economy_bonus } else { 0.0 },
                reputation_delta: if opening { event.reputation_delta } else { 0.0 },
            });
        }
        Ok(CollaboratorOutput {
            transitions,
            ..CollaboratorOutput::default()
        })
    }

    fn summary(&self) -> Value {
        let active: Vec<&str> = self
            .events
            .iter()
            .filter(|event| self.status(&event.id) == Some("active"))
            .map(|event| event.name.as_str())
            .collect();
        json!({ "active": active, "scheduled": self.events.len() })
    }

    fn create_snapshot(&self) -> Option<Value> {
        serde_json::to_value(&self.statuses).ok()
    }

    fn load_snapshot(&mut self, snapshot: Value) -> Result<(), CollaboratorError> {
        self.statuses =
            serde_json::from_value(snapshot).map_err(|err| snapshot_error(NAME, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::WorldClock;

    #[test]
    fn transitions_fire_once_per_status_change() {
        let mut calendar = EventCalendar::new(vec![ScheduledEvent {
            id: "fair".to_string(),
            name: "Harvest Fair".to_string(),
            start_tick: 2,
            end_tick: 4,
            economy_bonus: 10.0,
            reputation_delta: 0.5,
        }]);
        let time = WorldClock::default().view();
        let mut seen = Vec::new();
        for tick in 0..6 {
            let output = calendar
                .tick(&TickContext {
                    tick,
                    now: 0,
                    live_agents: 0,
                    agent_ids: &[],
                    time: &time,
                })
                .expect("tick");
            for transition in output.transitions {
                seen.push((tick, transition.status, transition.economy_bonus));
            }
        }
        assert_eq!(
            seen,
            vec![
                (2, "active".to_string(), 10.0),
                (4, "ended".to_string(), 0.0)
            ]
        );
    }
}

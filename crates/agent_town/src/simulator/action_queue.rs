//! ActionQueue: deterministic priority queue of pending agent intents.
//!
//! Order is `(priority, timestamp, id)` ascending; a lower priority number runs
//! first. Snapshots carry the queue verbatim so a restore never re-derives it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::types::{ActionId, AgentId, BuildingId, TimestampMs};

pub const DEFAULT_QUEUE_PRIORITY: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuedActionKind {
    MoveTo { x: i32, y: i32 },
    Speak { message: String },
    EnterBuilding { building_id: BuildingId },
    LeaveBuilding,
    Wait,
}

impl QueuedActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuedActionKind::MoveTo { .. } => "move_to",
            QueuedActionKind::Speak { .. } => "speak",
            QueuedActionKind::EnterBuilding { .. } => "enter_building",
            QueuedActionKind::LeaveBuilding => "leave_building",
            QueuedActionKind::Wait => "wait",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: ActionId,
    pub agent_id: AgentId,
    pub priority: i32,
    pub timestamp: TimestampMs,
    pub action: QueuedActionKind,
}

impl QueuedAction {
    pub fn new(
        id: impl Into<ActionId>,
        agent_id: impl Into<AgentId>,
        priority: i32,
        timestamp: TimestampMs,
        action: QueuedActionKind,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            priority,
            timestamp,
            action,
        }
    }

    fn sort_key_cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("action {id} is already queued")]
    DuplicateId { id: ActionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActionQueue {
    actions: Vec<QueuedAction>,
    next_seq: u64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id whose lexical order matches allocation order.
    pub fn next_action_id(&mut self) -> ActionId {
        self.next_seq = self.next_seq.saturating_add(1);
        format!("act-{:08}", self.next_seq)
    }

    pub fn enqueue(&mut self, action: QueuedAction) -> Result<(), QueueError> {
        if self.actions.iter().any(|queued| queued.id == action.id) {
            return Err(QueueError::DuplicateId { id: action.id });
        }
        self.actions.push(action);
        self.actions.sort_by(QueuedAction::sort_key_cmp);
        Ok(())
    }

    /// Removes every queued action in processing order.
    pub fn drain(&mut self) -> Vec<QueuedAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn actions(&self) -> &[QueuedAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn restore(actions: Vec<QueuedAction>, next_seq: u64) -> Self {
        Self { actions, next_seq }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: &str, priority: i32, timestamp: u64) -> QueuedAction {
        QueuedAction::new(id, "agent-1", priority, timestamp, QueuedActionKind::Wait)
    }

    fn ids(actions: &[QueuedAction]) -> Vec<&str> {
        actions.iter().map(|action| action.id.as_str()).collect()
    }

    #[test]
    fn drain_orders_by_priority_timestamp_then_id() {
        let mut queue = ActionQueue::new();
        queue.enqueue(queued("d", 1, 100)).unwrap();
        queue.enqueue(queued("c", 2, 200)).unwrap();
        queue.enqueue(queued("b", 1, 300)).unwrap();
        queue.enqueue(queued("a", 1, 300)).unwrap();
        let drained = queue.drain();
        assert_eq!(ids(&drained), vec!["d", "a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut queue = ActionQueue::new();
        queue.enqueue(queued("a", 1, 1)).unwrap();
        assert_eq!(
            queue.enqueue(queued("a", 0, 0)),
            Err(QueueError::DuplicateId {
                id: "a".to_string()
            })
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn generated_ids_sort_in_allocation_order() {
        let mut queue = ActionQueue::new();
        let first = queue.next_action_id();
        let second = queue.next_action_id();
        assert!(first < second);
        let tenth = (0..8).map(|_| queue.next_action_id()).last().unwrap();
        assert!(second < tenth);
    }

    #[test]
    fn restore_keeps_order_verbatim() {
        let mut queue = ActionQueue::new();
        queue.enqueue(queued("x", 3, 5)).unwrap();
        queue.enqueue(queued("y", 3, 5)).unwrap();
        queue.enqueue(queued("w", 0, 9)).unwrap();
        let json = serde_json::to_string(queue.actions()).unwrap();
        let actions: Vec<QueuedAction> = serde_json::from_str(&json).unwrap();
        let mut restored = ActionQueue::restore(actions, queue.next_seq());
        assert_eq!(ids(&restored.drain()), ids(&queue.drain()));
    }
}

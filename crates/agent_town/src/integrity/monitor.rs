//! TickIntegrityMonitor: before/after checksums around one tick.
//!
//! Purely diagnostic. Mismatches against an expectation are logged at `warn`
//! and reported to the caller; nothing here can fail a tick.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::canonical::{compute_hash, NodeId, StateGraph};
use crate::simulator::TickId;

/// Ticks started but never finished are dropped once this many pile up.
const MAX_PENDING_TICKS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickChecksum {
    pub tick: TickId,
    pub before: String,
    pub after: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Change,
    NoChange,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TickIntegrityMonitor {
    pending: BTreeMap<TickId, String>,
    last: Option<TickChecksum>,
    anomalies: u64,
}

impl TickIntegrityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_tick(&mut self, tick: TickId, graph: &StateGraph, root: NodeId) -> String {
        let checksum = compute_hash(graph, root);
        self.pending.insert(tick, checksum.clone());
        while self.pending.len() > MAX_PENDING_TICKS {
            self.pending.pop_first();
        }
        checksum
    }

    /// Compares against the checksum taken at `start_tick`. A finish without
    /// a start is logged and reported as changed with an empty `before`.
    pub fn finish_tick(&mut self, tick: TickId, graph: &StateGraph, root: NodeId) -> TickChecksum {
        let after = compute_hash(graph, root);
        let before = match self.pending.remove(&tick) {
            Some(before) => before,
            None => {
                tracing::warn!(tick, "integrity finish without matching start");
                self.anomalies += 1;
                String::new()
            }
        };
        let checksum = TickChecksum {
            tick,
            changed: before != after,
            before,
            after,
        };
        self.last = Some(checksum.clone());
        checksum
    }

    /// Logs when the observed change disagrees with what the tick should have
    /// done. Returns whether the checksum matched the expectation.
    pub fn check(&mut self, checksum: &TickChecksum, expectation: Expectation) -> bool {
        let matched = match expectation {
            Expectation::Change => checksum.changed,
            Expectation::NoChange => !checksum.changed,
            Expectation::Unknown => true,
        };
        if !matched {
            self.anomalies += 1;
            tracing::warn!(
                tick = checksum.tick,
                changed = checksum.changed,
                ?expectation,
                before = %checksum.before,
                after = %checksum.after,
                "tick integrity diverged from expectation"
            );
        }
        matched
    }

    pub fn last(&self) -> Option<&TickChecksum> {
        self.last.as_ref()
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(value: serde_json::Value) -> (StateGraph, NodeId) {
        StateGraph::from_json(&value)
    }

    #[test]
    fn unchanged_state_reports_same_checksum() {
        let mut monitor = TickIntegrityMonitor::new();
        let (g, root) = graph(json!({"tick": 1, "positions": {"a": [1, 2]}}));
        let before = monitor.start_tick(1, &g, root);
        let checksum = monitor.finish_tick(1, &g, root);
        assert_eq!(checksum.before, before);
        assert!(!checksum.changed);
        assert!(monitor.check(&checksum, Expectation::NoChange));
        assert!(!monitor.check(&checksum, Expectation::Change));
        assert_eq!(monitor.anomalies(), 1);
    }

    #[test]
    fn moved_agent_changes_checksum() {
        let mut monitor = TickIntegrityMonitor::new();
        let (g1, r1) = graph(json!({"positions": {"a": {"x": 1, "y": 1}}}));
        let (g2, r2) = graph(json!({"positions": {"a": {"x": 2, "y": 1}}}));
        monitor.start_tick(5, &g1, r1);
        let checksum = monitor.finish_tick(5, &g2, r2);
        assert!(checksum.changed);
        assert_eq!(monitor.last().map(|c| c.tick), Some(5));
    }

    #[test]
    fn finish_without_start_is_diagnostic_only() {
        let mut monitor = TickIntegrityMonitor::new();
        let (g, root) = graph(json!(null));
        let checksum = monitor.finish_tick(9, &g, root);
        assert!(checksum.before.is_empty());
        assert!(checksum.changed);
        assert_eq!(monitor.anomalies(), 1);
    }
}

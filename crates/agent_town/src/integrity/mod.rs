//! Tick integrity diagnostics: canonical hashing of state graphs and the
//! before/after monitor.

mod canonical;
mod monitor;

pub use canonical::{
    canonical_json, canonicalize, compute_hash, hash_json, Canonical, NodeId, StateGraph,
    StateNode, CIRCULAR_MARKER,
};
pub use monitor::{Expectation, TickChecksum, TickIntegrityMonitor};

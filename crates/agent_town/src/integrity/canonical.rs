//! Canonical serialization of arbitrary state graphs.
//!
//! State is held in an arena (`StateGraph`) and containers refer to children
//! by `NodeId`, so shared and cyclic structure is representable without
//! pointers. Canonicalization walks the graph with a visiting set keyed by
//! node id; a container reached again while still on the stack becomes the
//! `[Circular]` marker.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

pub type NodeId = usize;

pub const CIRCULAR_MARKER: &str = "[Circular]";
/// Largest integer an f64 represents exactly.
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, PartialEq)]
pub enum StateNode {
    Null,
    /// A present key with no value; dropped from objects.
    Undefined,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    Date(DateTime<Utc>),
    String(String),
    Array(Vec<NodeId>),
    /// Insertion-ordered key/value pairs with arbitrary keys.
    Map(Vec<(NodeId, NodeId)>),
    Set(Vec<NodeId>),
    Object(Vec<(String, NodeId)>),
    /// Functions, symbols and other values with no data representation.
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateGraph {
    nodes: Vec<StateNode>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: StateNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Replaces a node in place; used to close cycles after the children
    /// exist.
    pub fn set(&mut self, id: NodeId, node: StateNode) {
        if let Some(slot) = self.nodes.get_mut(id) {
            *slot = node;
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&StateNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn string(&mut self, value: impl Into<String>) -> NodeId {
        self.push(StateNode::String(value.into()))
    }

    pub fn number(&mut self, value: f64) -> NodeId {
        self.push(StateNode::Number(value))
    }

    /// Imports a JSON document. Integers beyond the exact f64 range become
    /// big integers so they hash by their decimal digits.
    pub fn import_json(&mut self, value: &Value) -> NodeId {
        match value {
            Value::Null => self.push(StateNode::Null),
            Value::Bool(flag) => self.push(StateNode::Bool(*flag)),
            Value::Number(number) => {
                if let Some(unsigned) = number.as_u64().filter(|n| *n > MAX_SAFE_INTEGER) {
                    self.push(StateNode::BigInt(i128::from(unsigned)))
                } else if let Some(signed) = number
                    .as_i64()
                    .filter(|n| n.unsigned_abs() > MAX_SAFE_INTEGER)
                {
                    self.push(StateNode::BigInt(i128::from(signed)))
                } else {
                    self.push(StateNode::Number(number.as_f64().unwrap_or(f64::NAN)))
                }
            }
            Value::String(text) => self.string(text.clone()),
            Value::Array(items) => {
                let children = items.iter().map(|item| self.import_json(item)).collect();
                self.push(StateNode::Array(children))
            }
            Value::Object(entries) => {
                let children = entries
                    .iter()
                    .map(|(key, item)| (key.clone(), self.import_json(item)))
                    .collect();
                self.push(StateNode::Object(children))
            }
        }
    }

    pub fn from_json(value: &Value) -> (Self, NodeId) {
        let mut graph = Self::new();
        let root = graph.import_json(value);
        (graph, root)
    }

    pub fn from_serialize<T: Serialize>(value: &T) -> Result<(Self, NodeId), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(Self::from_json(&value))
    }
}

// ============================================================================
// Canonical form
// ============================================================================

/// Canonical tree: plain JSON shapes with object keys already sorted.
#[derive(Debug, Clone, PartialEq)]
pub enum Canonical {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Canonical>),
    Object(Vec<(String, Canonical)>),
}

impl Canonical {
    pub fn to_json_string(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        match self {
            Canonical::Null => out.push_str("null"),
            Canonical::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
            Canonical::Number(number) => out.push_str(&format_number(*number)),
            Canonical::String(text) => out.push_str(&quote(text)),
            Canonical::Array(items) => {
                out.push('[');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    item.write_into(out);
                }
                out.push(']');
            }
            Canonical::Object(entries) => {
                out.push('{');
                for (index, (key, item)) in entries.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    out.push_str(&quote(key));
                    out.push(':');
                    item.write_into(out);
                }
                out.push('}');
            }
        }
    }
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{text}\""))
}

/// Integral values print without a fraction; non-finite values print as
/// `null`.
fn format_number(number: f64) -> String {
    if !number.is_finite() {
        return "null".to_string();
    }
    if number == 0.0 {
        return "0".to_string();
    }
    if number.fract() == 0.0 && number.abs() < 1e21 {
        return format!("{number:.0}");
    }
    serde_json::Number::from_f64(number)
        .map(|n| n.to_string())
        .unwrap_or_else(|| "null".to_string())
}

struct Canonicalizer<'a> {
    graph: &'a StateGraph,
    visiting: BTreeSet<NodeId>,
}

impl Canonicalizer<'_> {
    /// `None` means the value is dropped (undefined, opaque, or dangling).
    fn visit(&mut self, id: NodeId) -> Option<Canonical> {
        let graph = self.graph;
        let node = graph.node(id)?;
        let is_container = matches!(
            node,
            StateNode::Array(_) | StateNode::Map(_) | StateNode::Set(_) | StateNode::Object(_)
        );
        if is_container && !self.visiting.insert(id) {
            return Some(Canonical::String(CIRCULAR_MARKER.to_string()));
        }
        let canonical = match node {
            StateNode::Null => Some(Canonical::Null),
            StateNode::Undefined | StateNode::Opaque => None,
            StateNode::Bool(flag) => Some(Canonical::Bool(*flag)),
            StateNode::Number(number) => Some(Canonical::Number(*number)),
            StateNode::BigInt(big) => Some(Canonical::String(big.to_string())),
            StateNode::Date(at) => Some(Canonical::String(
                at.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            StateNode::String(text) => Some(Canonical::String(text.clone())),
            StateNode::Array(items) => Some(Canonical::Array(
                items
                    .iter()
                    .map(|item| self.visit(*item).unwrap_or(Canonical::Null))
                    .collect(),
            )),
            StateNode::Map(entries) => {
                let mut pairs: Vec<(String, Canonical)> = entries
                    .iter()
                    .map(|(key, item)| {
                        let key = self.key_string(*key);
                        let item = self.visit(*item).unwrap_or(Canonical::Null);
                        (key, item)
                    })
                    .collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                Some(Canonical::Array(
                    pairs
                        .into_iter()
                        .map(|(key, item)| Canonical::Array(vec![Canonical::String(key), item]))
                        .collect(),
                ))
            }
            StateNode::Set(items) => {
                let mut members: Vec<(String, Canonical)> = items
                    .iter()
                    .map(|item| {
                        let canonical = self.visit(*item).unwrap_or(Canonical::Null);
                        (canonical.to_json_string(), canonical)
                    })
                    .collect();
                members.sort_by(|a, b| a.0.cmp(&b.0));
                Some(Canonical::Array(
                    members.into_iter().map(|(_, canonical)| canonical).collect(),
                ))
            }
            StateNode::Object(entries) => {
                let mut fields: Vec<(String, Canonical)> = entries
                    .iter()
                    .filter_map(|(key, item)| self.visit(*item).map(|value| (key.clone(), value)))
                    .collect();
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                fields.dedup_by(|later, earlier| later.0 == earlier.0);
                Some(Canonical::Object(fields))
            }
        };
        if is_container {
            self.visiting.remove(&id);
        }
        canonical
    }

    /// Map keys: strings as-is, anything else by its canonical JSON.
    fn key_string(&mut self, key: NodeId) -> String {
        let graph = self.graph;
        match graph.node(key) {
            Some(StateNode::String(text)) => text.clone(),
            _ => self
                .visit(key)
                .unwrap_or(Canonical::Null)
                .to_json_string(),
        }
    }
}

pub fn canonicalize(graph: &StateGraph, root: NodeId) -> Canonical {
    Canonicalizer {
        graph,
        visiting: BTreeSet::new(),
    }
    .visit(root)
    .unwrap_or(Canonical::Null)
}

pub fn canonical_json(graph: &StateGraph, root: NodeId) -> String {
    canonicalize(graph, root).to_json_string()
}

/// SHA-256 of the canonical JSON, lowercase hex.
pub fn compute_hash(graph: &StateGraph, root: NodeId) -> String {
    let digest = Sha256::digest(canonical_json(graph, root).as_bytes());
    hex::encode(digest)
}

pub fn hash_json(value: &Value) -> String {
    let (graph, root) = StateGraph::from_json(value);
    compute_hash(&graph, root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn object_key_order_does_not_matter() {
        let mut a = StateGraph::new();
        let one = a.number(1.0);
        let two = a.number(2.0);
        let root_a = a.push(StateNode::Object(vec![("b".into(), one), ("a".into(), two)]));

        let mut b = StateGraph::new();
        let two = b.number(2.0);
        let one = b.number(1.0);
        let root_b = b.push(StateNode::Object(vec![("a".into(), two), ("b".into(), one)]));

        assert_eq!(canonical_json(&a, root_a), r#"{"a":2,"b":1}"#);
        assert_eq!(compute_hash(&a, root_a), compute_hash(&b, root_b));
    }

    #[test]
    fn maps_and_sets_ignore_insertion_order() {
        let build = |reverse: bool| {
            let mut graph = StateGraph::new();
            let mut pairs = vec![
                (graph.string("x"), graph.number(1.0)),
                (graph.string("y"), graph.number(2.0)),
            ];
            let mut members = vec![graph.string("p"), graph.string("q"), graph.number(3.0)];
            if reverse {
                pairs.reverse();
                members.reverse();
            }
            let map = graph.push(StateNode::Map(pairs));
            let set = graph.push(StateNode::Set(members));
            let root = graph.push(StateNode::Object(vec![
                ("map".into(), map),
                ("set".into(), set),
            ]));
            (graph, root)
        };
        let (forward, root_f) = build(false);
        let (reversed, root_r) = build(true);
        assert_eq!(
            canonical_json(&forward, root_f),
            r#"{"map":[["x",1],["y",2]],"set":["p","q",3]}"#
        );
        assert_eq!(compute_hash(&forward, root_f), compute_hash(&reversed, root_r));
    }

    #[test]
    fn scalars_follow_conversion_rules() {
        let mut graph = StateGraph::new();
        let big = graph.push(StateNode::BigInt(123_456_789_012_345_678_901));
        let date = graph.push(StateNode::Date(
            Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
        ));
        let undefined = graph.push(StateNode::Undefined);
        let opaque = graph.push(StateNode::Opaque);
        let in_array = graph.push(StateNode::Opaque);
        let array = graph.push(StateNode::Array(vec![in_array]));
        let half = graph.number(0.5);
        let root = graph.push(StateNode::Object(vec![
            ("big".into(), big),
            ("when".into(), date),
            ("gone".into(), undefined),
            ("fn".into(), opaque),
            ("list".into(), array),
            ("half".into(), half),
        ]));
        assert_eq!(
            canonical_json(&graph, root),
            r#"{"big":"123456789012345678901","half":0.5,"list":[null],"when":"2024-05-06T07:08:09.000Z"}"#
        );
    }

    #[test]
    fn cycles_become_markers() {
        let mut graph = StateGraph::new();
        let root = graph.push(StateNode::Null);
        let name = graph.string("loop");
        graph.set(
            root,
            StateNode::Object(vec![("name".into(), name), ("self".into(), root)]),
        );
        assert_eq!(
            canonical_json(&graph, root),
            r#"{"name":"loop","self":"[Circular]"}"#
        );
    }

    #[test]
    fn shared_children_are_not_cycles() {
        let mut graph = StateGraph::new();
        let leaf = graph.push(StateNode::Array(vec![]));
        let root = graph.push(StateNode::Array(vec![leaf, leaf]));
        assert_eq!(canonical_json(&graph, root), "[[],[]]");
    }

    #[test]
    fn coordinate_change_changes_hash() {
        let before = hash_json(&json!({"positions": {"a": {"x": 1, "y": 2}}}));
        let after = hash_json(&json!({"positions": {"a": {"x": 2, "y": 2}}}));
        assert_ne!(before, after);
        assert_eq!(before.len(), 64);
    }
}

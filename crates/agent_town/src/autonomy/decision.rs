//! Decision schema: the closed action vocabulary and the strict parser for
//! untrusted decision-service output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::integrity::hash_json;

pub const MIN_NEXT_THINK_MS: u64 = 1_500;
pub const MAX_NEXT_THINK_MS: u64 = 120_000;
pub const DEFAULT_NEXT_THINK_MS: u64 = 10_000;

// ============================================================================
// Action Vocabulary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    None,
    MoveToPosition,
    MoveToAgent,
    MoveToBuilding,
    SocialAction,
    QueueAction,
    ApplyJob,
    VoteJob,
    NegotiatePropose,
    NegotiateCounter,
    NegotiateAccept,
    CommitmentDeclare,
    FavorCreate,
    FavorRepay,
}

impl ActionType {
    pub const ALL: [ActionType; 14] = [
        ActionType::None,
        ActionType::MoveToPosition,
        ActionType::MoveToAgent,
        ActionType::MoveToBuilding,
        ActionType::SocialAction,
        ActionType::QueueAction,
        ActionType::ApplyJob,
        ActionType::VoteJob,
        ActionType::NegotiatePropose,
        ActionType::NegotiateCounter,
        ActionType::NegotiateAccept,
        ActionType::CommitmentDeclare,
        ActionType::FavorCreate,
        ActionType::FavorRepay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::None => "none",
            ActionType::MoveToPosition => "move_to_position",
            ActionType::MoveToAgent => "move_to_agent",
            ActionType::MoveToBuilding => "move_to_building",
            ActionType::SocialAction => "social_action",
            ActionType::QueueAction => "queue_action",
            ActionType::ApplyJob => "apply_job",
            ActionType::VoteJob => "vote_job",
            ActionType::NegotiatePropose => "negotiate_propose",
            ActionType::NegotiateCounter => "negotiate_counter",
            ActionType::NegotiateAccept => "negotiate_accept",
            ActionType::CommitmentDeclare => "commitment_declare",
            ActionType::FavorCreate => "favor_create",
            ActionType::FavorRepay => "favor_repay",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ActionSpec {
    pub fn new(kind: ActionType, target: Option<&str>, params: Value) -> Self {
        Self {
            kind,
            target: target.map(str::to_string),
            params: match params {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    pub fn none() -> Self {
        Self::new(ActionType::None, None, Value::Null)
    }

    /// Stable identity of `(type, target, params)` for loop detection. Params
    /// are hashed canonically so key order never matters.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}",
            self.kind.as_str(),
            self.target.as_deref().unwrap_or(""),
            hash_json(&Value::Object(self.params.clone()))
        )
    }

    pub fn param(&self, names: &[&str]) -> Option<&Value> {
        names
            .iter()
            .find_map(|name| self.params.get(*name))
            .filter(|value| !value.is_null())
    }

    /// First non-empty string among the aliases.
    pub fn param_str(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.params.get(*name))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|text| !text.is_empty())
    }

    pub fn param_f64(&self, names: &[&str]) -> Option<f64> {
        names
            .iter()
            .filter_map(|name| self.params.get(*name))
            .find_map(|value| match value {
                Value::Number(number) => number.as_f64(),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            })
            .filter(|number: &f64| number.is_finite())
    }

    /// Target when present, else the first string param among the aliases.
    pub fn target_or(&self, names: &[&str]) -> Option<String> {
        self.target
            .as_deref()
            .map(str::trim)
            .filter(|target| !target.is_empty())
            .map(str::to_string)
            .or_else(|| self.param_str(names).map(str::to_string))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub goal: String,
    pub thought: String,
    pub utterance: String,
    pub action: ActionSpec,
    pub next_think_ms: u64,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("response contains no JSON object")]
    NoJsonObject,
    #[error("response JSON is invalid: {message}")]
    InvalidJson { message: String },
    #[error("decision is not a JSON object")]
    NotAnObject,
    #[error("decision has no action object")]
    MissingAction,
    #[error("decision action is not an object")]
    ActionNotObject,
    #[error("decision action has no type")]
    MissingActionType,
    #[error("unknown action type {kind}")]
    UnknownActionType { kind: String },
    #[error("field {field} has the wrong type")]
    InvalidField { field: &'static str },
}

impl DecisionError {
    pub fn tag(&self) -> String {
        match self {
            DecisionError::NoJsonObject => "no_json_object".to_string(),
            DecisionError::InvalidJson { .. } => "invalid_json".to_string(),
            DecisionError::NotAnObject => "decision_not_object".to_string(),
            DecisionError::MissingAction => "missing_action".to_string(),
            DecisionError::ActionNotObject => "action_not_object".to_string(),
            DecisionError::MissingActionType => "missing_action_type".to_string(),
            DecisionError::UnknownActionType { kind } => format!("unknown_action_type:{kind}"),
            DecisionError::InvalidField { field } => format!("invalid_field:{field}"),
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Byte range `(start, end_inclusive)` of the balanced `{...}` beginning at
/// `start`, skipping braces inside strings.
fn balanced_object_from(raw: &str, start: usize) -> Option<usize> {
    let mut depth: u32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw.get(start..)?.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth = depth.saturating_add(1),
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// First balanced `{...}` block in `raw`, tolerating code fences and prose
/// around it.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let mut cursor = 0;
    while let Some(found) = raw.get(cursor..)?.find('{') {
        let start = cursor + found;
        if let Some(end) = balanced_object_from(raw, start) {
            return raw.get(start..=end);
        }
        cursor = start + 1;
    }
    None
}

fn optional_string(
    object: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, DecisionError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.trim().to_string()),
        Some(_) => Err(DecisionError::InvalidField { field }),
    }
}

pub fn clamp_next_think_ms(value: u64) -> u64 {
    value.clamp(MIN_NEXT_THINK_MS, MAX_NEXT_THINK_MS)
}

/// Parses and validates a raw decision. The `action` object and its type are
/// mandatory; text fields default to empty and `nextThinkMs` to the default
/// delay when absent, but present fields of the wrong type are rejected.
pub fn parse_decision(raw: &str) -> Result<Decision, DecisionError> {
    let block = extract_json_object(raw).ok_or(DecisionError::NoJsonObject)?;
    let value: Value = serde_json::from_str(block).map_err(|err| DecisionError::InvalidJson {
        message: err.to_string(),
    })?;
    let object = value.as_object().ok_or(DecisionError::NotAnObject)?;

    let action = match object.get("action") {
        None | Some(Value::Null) => return Err(DecisionError::MissingAction),
        Some(Value::Object(action)) => action,
        Some(_) => return Err(DecisionError::ActionNotObject),
    };
    let kind_name = match action.get("type") {
        Some(Value::String(kind)) => kind.trim(),
        Some(Value::Null) | None => return Err(DecisionError::MissingActionType),
        Some(_) => return Err(DecisionError::InvalidField { field: "action.type" }),
    };
    let kind = ActionType::parse(kind_name).ok_or_else(|| DecisionError::UnknownActionType {
        kind: kind_name.to_string(),
    })?;
    let target = match action.get("target") {
        None | Some(Value::Null) => None,
        Some(Value::String(target)) if target.trim().is_empty() => None,
        Some(Value::String(target)) => Some(target.trim().to_string()),
        Some(_) => return Err(DecisionError::InvalidField { field: "action.target" }),
    };
    let params = match action.get("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(params)) => params.clone(),
        Some(_) => return Err(DecisionError::InvalidField { field: "action.params" }),
    };
    let next_think_ms = match object.get("nextThinkMs") {
        None | Some(Value::Null) => DEFAULT_NEXT_THINK_MS,
        Some(Value::Number(number)) => {
            let millis = number
                .as_f64()
                .filter(|millis| millis.is_finite())
                .ok_or(DecisionError::InvalidField { field: "nextThinkMs" })?;
            millis.max(0.0).round() as u64
        }
        Some(_) => return Err(DecisionError::InvalidField { field: "nextThinkMs" }),
    };

    Ok(Decision {
        goal: optional_string(object, "goal", "goal")?,
        thought: optional_string(object, "thought", "thought")?,
        utterance: optional_string(object, "utterance", "utterance")?,
        action: ActionSpec {
            kind,
            target,
            params,
        },
        next_think_ms: clamp_next_think_ms(next_think_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_decision_parses() {
        let raw = r#"{"goal":"eat","thought":"hungry","utterance":"Off to the cafe",
            "action":{"type":"move_to_building","target":"cafe","params":{}},"nextThinkMs":5000}"#;
        let decision = parse_decision(raw).expect("decision");
        assert_eq!(decision.action.kind, ActionType::MoveToBuilding);
        assert_eq!(decision.action.target.as_deref(), Some("cafe"));
        assert_eq!(decision.next_think_ms, 5_000);
        assert_eq!(decision.utterance, "Off to the cafe");
    }

    #[test]
    fn fenced_and_prose_wrapped_output_is_tolerated() {
        let raw = "Sure! Here you go:\n```json\n{\"action\":{\"type\":\"none\"},\"thought\":\"a } in text\"}\n```\nanything else?";
        let decision = parse_decision(raw).expect("decision");
        assert_eq!(decision.action.kind, ActionType::None);
        assert_eq!(decision.thought, "a } in text");
    }

    #[test]
    fn next_think_is_clamped() {
        let low = parse_decision(r#"{"action":{"type":"none"},"nextThinkMs":10}"#).unwrap();
        let high = parse_decision(r#"{"action":{"type":"none"},"nextThinkMs":9e9}"#).unwrap();
        assert_eq!(low.next_think_ms, MIN_NEXT_THINK_MS);
        assert_eq!(high.next_think_ms, MAX_NEXT_THINK_MS);
    }

    #[test]
    fn invalid_decisions_are_rejected_with_tags() {
        let cases = [
            ("no json here", "no_json_object"),
            (r#"{"goal":"x"}"#, "missing_action"),
            (r#"{"action":"move"}"#, "action_not_object"),
            (r#"{"action":{}}"#, "missing_action_type"),
            (r#"{"action":{"type":"teleport"}}"#, "unknown_action_type:teleport"),
            (r#"{"action":{"type":"none","params":[1]}}"#, "invalid_field:action.params"),
            (r#"{"action":{"type":"none"},"nextThinkMs":"soon"}"#, "invalid_field:nextThinkMs"),
            (r#"{"action":{"type":"none"},"goal":5}"#, "invalid_field:goal"),
        ];
        for (raw, tag) in cases {
            assert_eq!(parse_decision(raw).unwrap_err().tag(), tag, "input: {raw}");
        }
    }

    #[test]
    fn unbalanced_prefix_is_skipped() {
        assert_eq!(extract_json_object("{ oops"), None);
        assert_eq!(
            extract_json_object("a { b {\"c\":1}"),
            Some("{\"c\":1}"),
            "an unclosed outer brace is stepped over"
        );
        assert_eq!(extract_json_object("x {\"a\":{\"b\":2}} y"), Some("{\"a\":{\"b\":2}}"));
    }

    #[test]
    fn signature_ignores_param_key_order() {
        let a = ActionSpec::new(
            ActionType::MoveToPosition,
            None,
            json!({"x": 1, "y": 2}),
        );
        let mut params = Map::new();
        params.insert("y".to_string(), json!(2));
        params.insert("x".to_string(), json!(1));
        let b = ActionSpec {
            kind: ActionType::MoveToPosition,
            target: None,
            params,
        };
        assert_eq!(a.signature(), b.signature());
        let c = ActionSpec::new(ActionType::MoveToPosition, None, json!({"x": 1, "y": 3}));
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn param_aliases_resolve_in_order() {
        let spec = ActionSpec::new(
            ActionType::MoveToPosition,
            None,
            json!({"targetX": "4", "y": 7}),
        );
        assert_eq!(spec.param_f64(&["x", "targetX"]), Some(4.0));
        assert_eq!(spec.param_f64(&["y", "targetY"]), Some(7.0));
        assert_eq!(spec.param_str(&["missing"]), None);
    }
}

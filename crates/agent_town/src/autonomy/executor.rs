//! ActionExecutor: validates a decision's action, dispatches it to the world
//! or a collaborator, logs it, and gates the accompanying utterance.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::decision::{ActionSpec, ActionType, Decision};
use super::speech::SpeechFilter;
use crate::collaborators::CollaboratorError;
use crate::simulator::{
    ActionLogEntry, MemoryEntry, MoveError, QueuedActionKind, SpeechEntry, TilePos, TimestampMs,
    World, WorldError, DEFAULT_QUEUE_PRIORITY,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("{action} requires {field}")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },
    #[error("unknown action type {kind}")]
    UnknownActionType { kind: String },
    #[error("{action}: {source}")]
    World {
        action: &'static str,
        #[source]
        source: WorldError,
    },
    #[error("{action}: {source}")]
    Collaborator {
        action: &'static str,
        #[source]
        source: CollaboratorError,
    },
}

impl ActionError {
    fn missing(action: ActionType, field: &'static str) -> Self {
        ActionError::MissingField {
            action: action.as_str(),
            field,
        }
    }

    pub fn tag(&self) -> String {
        match self {
            ActionError::MissingField { action, field } => format!("{action}_requires_{field}"),
            ActionError::UnknownActionType { kind } => format!("unknown_action_type:{kind}"),
            ActionError::World { action, source } => format!("{action}_failed:{}", source.tag()),
            ActionError::Collaborator { action, source } => {
                let detail = match source {
                    CollaboratorError::Rejected { reason, .. } => reason.clone(),
                    CollaboratorError::NotFound { entity, .. } => format!("unknown_{entity}"),
                    CollaboratorError::Snapshot { .. } => source.tag().to_string(),
                };
                format!("{action}_failed:{detail}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub status: String,
    pub action_type: ActionType,
    pub result: Value,
    pub speech: Option<SpeechEntry>,
    pub speech_suppressed: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionExecutor {
    speech_action_types: Vec<ActionType>,
    speech: SpeechFilter,
}

impl ActionExecutor {
    pub fn new(speech_action_types: Vec<ActionType>, speech: SpeechFilter) -> Self {
        Self {
            speech_action_types,
            speech,
        }
    }

    /// Drops the agent's remembered lines once its session is gone.
    pub fn forget_agent(&mut self, agent_id: &str) {
        self.speech.forget_agent(agent_id);
    }

    /// Runs the action, then the utterance when the action type is a social
    /// one and the line clears the duplicate filter. Every attempt lands in
    /// the world's action log.
    pub fn execute(
        &mut self,
        world: &mut World,
        agent_id: &str,
        decision: &Decision,
        now: TimestampMs,
    ) -> Result<ExecutionOutcome, ActionError> {
        let action = &decision.action;
        let outcome = dispatch(world, agent_id, action, &decision.utterance, now);
        let (status, detail) = match &outcome {
            Ok(result) => ("ok", result.clone()),
            Err(err) => ("failed", Value::String(err.tag())),
        };
        let tick = world.tick();
        world.action_log_mut().push(ActionLogEntry {
            at: now,
            tick,
            agent_id: agent_id.to_string(),
            action_type: action.kind.as_str().to_string(),
            status: status.to_string(),
            detail,
        });
        let result = outcome?;

        let mut speech = None;
        let mut speech_suppressed = None;
        let utterance = decision.utterance.trim();
        if !utterance.is_empty() && self.is_speech_action(action.kind) {
            match self.speech.admit(agent_id, utterance, now) {
                Ok(()) => match world.speak(agent_id, utterance, now) {
                    Ok(entry) => speech = Some(entry),
                    Err(err) => speech_suppressed = Some(err.tag().to_string()),
                },
                Err(rejection) => {
                    tracing::debug!(agent_id, reason = rejection.tag(), "utterance suppressed");
                    speech_suppressed = Some(rejection.tag().to_string());
                }
            }
        }

        Ok(ExecutionOutcome {
            status: "ok".to_string(),
            action_type: action.kind,
            result,
            speech,
            speech_suppressed,
        })
    }

    fn is_speech_action(&self, kind: ActionType) -> bool {
        self.speech_action_types.contains(&kind)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

fn world_err(action: ActionType) -> impl Fn(WorldError) -> ActionError {
    move |source| ActionError::World {
        action: action.as_str(),
        source,
    }
}

fn collab_err(action: ActionType) -> impl Fn(CollaboratorError) -> ActionError {
    move |source| ActionError::Collaborator {
        action: action.as_str(),
        source,
    }
}

fn coordinate(value: f64) -> i32 {
    value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// Target tile from `x`/`y`, `targetX`/`targetY`, or `position: {x, y}`.
fn move_target(action: &ActionSpec) -> Result<TilePos, ActionError> {
    let nested = action.param(&["position"]).and_then(Value::as_object);
    let nested_axis = |axis: &str| {
        nested
            .and_then(|position| position.get(axis))
            .and_then(Value::as_f64)
    };
    let x = action
        .param_f64(&["x", "targetX", "target_x"])
        .or_else(|| nested_axis("x"))
        .ok_or_else(|| ActionError::missing(action.kind, "x"))?;
    let y = action
        .param_f64(&["y", "targetY", "target_y"])
        .or_else(|| nested_axis("y"))
        .ok_or_else(|| ActionError::missing(action.kind, "y"))?;
    Ok(TilePos::new(coordinate(x), coordinate(y)))
}

fn required_target(
    action: &ActionSpec,
    aliases: &[&str],
    field: &'static str,
) -> Result<String, ActionError> {
    action
        .target_or(aliases)
        .ok_or_else(|| ActionError::missing(action.kind, field))
}

/// `params.terms` when present, else every param other than routing keys.
fn negotiation_terms(action: &ActionSpec) -> Result<Value, ActionError> {
    if let Some(terms) = action.param(&["terms", "offer"]) {
        return Ok(terms.clone());
    }
    let rest: Map<String, Value> = action
        .params
        .iter()
        .filter(|(key, _)| {
            !matches!(
                key.as_str(),
                "targetId" | "target_id" | "agentId" | "negotiationId" | "negotiation_id"
            )
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if rest.is_empty() {
        return Err(ActionError::missing(action.kind, "terms"));
    }
    Ok(Value::Object(rest))
}

fn path_result(path: &[TilePos]) -> Value {
    json!({
        "pathLength": path.len(),
        "destination": path.last(),
    })
}

fn queued_kind(action: &ActionSpec) -> Result<QueuedActionKind, ActionError> {
    let kind = action
        .param_str(&["kind", "action", "type"])
        .ok_or_else(|| ActionError::missing(action.kind, "kind"))?;
    match kind {
        "move_to" | "move" => {
            let target = move_target(action)?;
            Ok(QueuedActionKind::MoveTo {
                x: target.x,
                y: target.y,
            })
        }
        "speak" => Ok(QueuedActionKind::Speak {
            message: action
                .param_str(&["message", "text"])
                .ok_or_else(|| ActionError::missing(action.kind, "message"))?
                .to_string(),
        }),
        "enter_building" => Ok(QueuedActionKind::EnterBuilding {
            building_id: action
                .param_str(&["buildingId", "building_id"])
                .ok_or_else(|| ActionError::missing(action.kind, "building_id"))?
                .to_string(),
        }),
        "leave_building" => Ok(QueuedActionKind::LeaveBuilding),
        "wait" => Ok(QueuedActionKind::Wait),
        other => Err(ActionError::UnknownActionType {
            kind: other.to_string(),
        }),
    }
}

fn remember(world: &mut World, agent_id: &str, kind: &str, text: String, now: TimestampMs) {
    world.agents_mut().remember(
        agent_id,
        MemoryEntry {
            at: now,
            kind: kind.to_string(),
            text,
        },
    );
}

fn dispatch(
    world: &mut World,
    agent_id: &str,
    action: &ActionSpec,
    utterance: &str,
    now: TimestampMs,
) -> Result<Value, ActionError> {
    let kind = action.kind;
    match kind {
        ActionType::None => Ok(Value::Null),
        ActionType::MoveToPosition => {
            let target = move_target(action)?;
            let path = world
                .move_agent(agent_id, target, now)
                .map_err(world_err(kind))?;
            Ok(path_result(&path))
        }
        ActionType::MoveToAgent => {
            let target_id = required_target(action, &["agentId", "agent_id", "targetId"], "target")?;
            let from = world
                .positions()
                .get(agent_id)
                .map(|pos| pos.tile())
                .ok_or_else(|| {
                    world_err(kind)(WorldError::UnknownAgent {
                        agent_id: agent_id.to_string(),
                    })
                })?;
            let to = world
                .positions()
                .get(&target_id)
                .map(|pos| pos.tile())
                .ok_or_else(|| {
                    world_err(kind)(WorldError::UnknownAgent {
                        agent_id: target_id.clone(),
                    })
                })?;
            if from.chebyshev(to) <= 1 {
                return Ok(json!({ "pathLength": 0, "alreadyAdjacent": true }));
            }
            let approach = world.grid().approach_tile(from, to).ok_or_else(|| {
                world_err(kind)(WorldError::Move(MoveError::NoPath { x: to.x, y: to.y }))
            })?;
            let path = world
                .move_agent(agent_id, approach, now)
                .map_err(world_err(kind))?;
            Ok(path_result(&path))
        }
        ActionType::MoveToBuilding => {
            let building_id =
                required_target(action, &["buildingId", "building_id"], "building_id")?;
            let path = world
                .enter_building(agent_id, &building_id, now)
                .map_err(world_err(kind))?;
            Ok(path_result(&path))
        }
        ActionType::SocialAction => {
            let target_id = required_target(action, &["targetId", "target_id", "agentId"], "target")?;
            if !world.positions().contains_key(&target_id) {
                return Err(world_err(kind)(WorldError::UnknownAgent {
                    agent_id: target_id,
                }));
            }
            let interaction = action
                .param_str(&["kind", "interaction", "socialType"])
                .unwrap_or("chat")
                .to_string();
            let message = action
                .param_str(&["message"])
                .or_else(|| Some(utterance.trim()).filter(|text| !text.is_empty()));
            let result = world
                .collaborators_mut()
                .social
                .interact(agent_id, &target_id, &interaction, message)
                .map_err(collab_err(kind))?;
            remember(world, agent_id, "interacted", format!("{interaction} with {target_id}"), now);
            remember(world, &target_id, "interacted", format!("{interaction} from {agent_id}"), now);
            Ok(result)
        }
        ActionType::QueueAction => {
            let queued = queued_kind(action)?;
            let priority = action
                .param_f64(&["priority"])
                .map(|value| value.round() as i32)
                .unwrap_or(DEFAULT_QUEUE_PRIORITY);
            let action_id = world
                .enqueue(agent_id, priority, queued, now)
                .map_err(world_err(kind))?;
            Ok(json!({ "actionId": action_id, "priority": priority }))
        }
        ActionType::ApplyJob => {
            let job_id = required_target(action, &["jobId", "job_id"], "job_id")?;
            world
                .collaborators_mut()
                .economy
                .apply_job(agent_id, &job_id)
                .map_err(collab_err(kind))
        }
        ActionType::VoteJob => {
            let applicant_id =
                required_target(action, &["applicantId", "applicant_id"], "applicant_id")?;
            let job_id = action
                .param_str(&["jobId", "job_id"])
                .ok_or_else(|| ActionError::missing(kind, "job_id"))?
                .to_string();
            world
                .collaborators_mut()
                .economy
                .vote_job(agent_id, &applicant_id, &job_id)
                .map_err(collab_err(kind))
        }
        ActionType::NegotiatePropose => {
            let target_id = required_target(action, &["targetId", "target_id", "agentId"], "target")?;
            let terms = negotiation_terms(action)?;
            world
                .collaborators_mut()
                .social
                .propose(agent_id, &target_id, &terms)
                .map_err(collab_err(kind))
        }
        ActionType::NegotiateCounter => {
            let negotiation_id =
                required_target(action, &["negotiationId", "negotiation_id"], "negotiation_id")?;
            let terms = negotiation_terms(action)?;
            world
                .collaborators_mut()
                .social
                .counter(agent_id, &negotiation_id, &terms)
                .map_err(collab_err(kind))
        }
        ActionType::NegotiateAccept => {
            let negotiation_id =
                required_target(action, &["negotiationId", "negotiation_id"], "negotiation_id")?;
            world
                .collaborators_mut()
                .social
                .accept(agent_id, &negotiation_id)
                .map_err(collab_err(kind))
        }
        ActionType::CommitmentDeclare => {
            let description = action
                .param_str(&["description", "commitment", "text"])
                .ok_or_else(|| ActionError::missing(kind, "description"))?
                .to_string();
            let target = action.target.clone();
            let result = world
                .collaborators_mut()
                .social
                .declare_commitment(agent_id, target.as_deref(), &description)
                .map_err(collab_err(kind))?;
            remember(world, agent_id, "committed", description, now);
            Ok(result)
        }
        ActionType::FavorCreate => {
            let target_id = required_target(action, &["targetId", "target_id", "agentId"], "target")?;
            let value = action
                .param_f64(&["value", "amount"])
                .ok_or_else(|| ActionError::missing(kind, "value"))?;
            world
                .collaborators_mut()
                .social
                .create_favor(agent_id, &target_id, value)
                .map_err(collab_err(kind))
        }
        ActionType::FavorRepay => {
            let favor_id = required_target(action, &["favorId", "favor_id"], "favor_id")?;
            world
                .collaborators_mut()
                .social
                .repay_favor(agent_id, &favor_id)
                .map_err(collab_err(kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::simulator::{AgentKind, GridConfig, TileKind, WorldGrid, WorldSettings};

    fn world() -> World {
        let settings = WorldSettings {
            grid: GridConfig {
                width: 20,
                height: 20,
                tile_size: 16,
            },
            ..WorldSettings::default()
        };
        let grid = WorldGrid::filled(settings.grid, TileKind::Grass).expect("grid");
        let mut world = World::new(settings, grid, Collaborators::default());
        world
            .spawn_agent("ada", "Ada", AgentKind::Npc, Some(TilePos::new(2, 2)), 0)
            .expect("spawn");
        world
            .spawn_agent("bo", "Bo", AgentKind::Npc, Some(TilePos::new(12, 12)), 0)
            .expect("spawn");
        world
    }

    fn executor() -> ActionExecutor {
        ActionExecutor::new(
            vec![ActionType::SocialAction],
            SpeechFilter::new(60_000, 10_000, 0.85),
        )
    }

    fn decision(kind: ActionType, target: Option<&str>, params: Value, utterance: &str) -> Decision {
        Decision {
            goal: String::new(),
            thought: String::new(),
            utterance: utterance.to_string(),
            action: ActionSpec::new(kind, target, params),
            next_think_ms: 5_000,
        }
    }

    fn tag(result: Result<ExecutionOutcome, ActionError>) -> String {
        result.expect_err("should fail").tag()
    }

    #[test]
    fn required_fields_are_reported_by_tag() {
        let mut world = world();
        let mut exec = executor();
        let cases = [
            (ActionType::MoveToPosition, json!({"y": 3}), "move_to_position_requires_x"),
            (ActionType::MoveToAgent, json!({}), "move_to_agent_requires_target"),
            (ActionType::MoveToBuilding, json!({}), "move_to_building_requires_building_id"),
            (ActionType::SocialAction, json!({}), "social_action_requires_target"),
            (ActionType::QueueAction, json!({}), "queue_action_requires_kind"),
            (ActionType::ApplyJob, json!({}), "apply_job_requires_job_id"),
            (ActionType::VoteJob, json!({"jobId": "job-baker"}), "vote_job_requires_applicant_id"),
            (ActionType::NegotiateAccept, json!({}), "negotiate_accept_requires_negotiation_id"),
            (ActionType::CommitmentDeclare, json!({}), "commitment_declare_requires_description"),
            (ActionType::FavorCreate, json!({"targetId": "bo"}), "favor_create_requires_value"),
            (ActionType::FavorRepay, json!({}), "favor_repay_requires_favor_id"),
        ];
        for (kind, params, expected) in &cases {
            let d = decision(*kind, None, params.clone(), "");
            assert_eq!(tag(exec.execute(&mut world, "ada", &d, 0)), *expected);
        }
        assert_eq!(world.action_log().len(), cases.len());
    }

    #[test]
    fn unknown_queued_kind_is_tagged() {
        let mut world = world();
        let d = decision(ActionType::QueueAction, None, json!({"kind": "fly"}), "");
        assert_eq!(tag(executor().execute(&mut world, "ada", &d, 0)), "unknown_action_type:fly");
    }

    #[test]
    fn move_aliases_resolve() {
        let mut world = world();
        let mut exec = executor();
        for params in [
            json!({"x": 5, "y": 2}),
            json!({"targetX": 5, "targetY": 3}),
            json!({"position": {"x": 6, "y": 3}}),
        ] {
            let d = decision(ActionType::MoveToPosition, None, params, "");
            let outcome = exec.execute(&mut world, "ada", &d, 0).expect("move");
            assert!(outcome.result["pathLength"].as_u64().unwrap() >= 2);
        }
        assert!(world.movement().is_moving("ada"));
    }

    #[test]
    fn move_to_agent_stops_next_to_target() {
        let mut world = world();
        let d = decision(ActionType::MoveToAgent, Some("bo"), json!({}), "");
        let outcome = executor().execute(&mut world, "ada", &d, 0).expect("move");
        let destination: TilePos = serde_json::from_value(outcome.result["destination"].clone()).unwrap();
        assert_eq!(destination.chebyshev(TilePos::new(12, 12)), 1);
    }

    #[test]
    fn utterance_only_for_social_types_and_deduped() {
        let mut world = world();
        let mut exec = executor();
        let chat = decision(ActionType::SocialAction, Some("bo"), json!({}), "Hello there Bo");
        let first = exec.execute(&mut world, "ada", &chat, 0).expect("chat");
        assert!(first.speech.is_some());
        let again = exec.execute(&mut world, "ada", &chat, 1_000).expect("chat");
        assert_eq!(again.speech, None);
        assert_eq!(again.speech_suppressed.as_deref(), Some("speech_duplicate_agent"));

        let walk = decision(ActionType::MoveToPosition, None, json!({"x": 4, "y": 4}), "Walking");
        let moved = exec.execute(&mut world, "ada", &walk, 2_000).expect("move");
        assert_eq!(moved.speech, None);
        assert_eq!(moved.speech_suppressed, None);
        assert_eq!(world.speech_log().len(), 1);
    }

    #[test]
    fn collaborator_rejections_carry_reason() {
        let mut world = world();
        let mut exec = executor();
        let apply = decision(ActionType::ApplyJob, Some("job-baker"), json!({}), "");
        exec.execute(&mut world, "ada", &apply, 0).expect("apply");
        assert_eq!(
            tag(exec.execute(&mut world, "ada", &apply, 1)),
            "apply_job_failed:application_pending"
        );
        let missing = decision(ActionType::ApplyJob, Some("job-astronaut"), json!({}), "");
        assert_eq!(tag(exec.execute(&mut world, "ada", &missing, 2)), "apply_job_failed:unknown_job");

        let vote = decision(
            ActionType::VoteJob,
            Some("ada"),
            json!({"jobId": "job-baker"}),
            "",
        );
        let voted = exec.execute(&mut world, "bo", &vote, 3).expect("vote");
        assert_eq!(voted.result["status"], "voted");
    }

    #[test]
    fn negotiation_flow_runs_through_social_ledger() {
        let mut world = world();
        let mut exec = executor();
        let propose = decision(
            ActionType::NegotiatePropose,
            Some("bo"),
            json!({"terms": {"give": "bread", "get": "tools"}}),
            "",
        );
        let proposed = exec.execute(&mut world, "ada", &propose, 0).expect("propose");
        let negotiation_id = proposed.result["negotiationId"].as_str().expect("id").to_string();

        let accept = decision(ActionType::NegotiateAccept, Some(&negotiation_id), json!({}), "");
        assert_eq!(
            tag(exec.execute(&mut world, "ada", &accept, 1)),
            "negotiate_accept_failed:awaiting_counterpart"
        );
        exec.execute(&mut world, "bo", &accept, 2).expect("accept");
    }

    #[test]
    fn queue_action_enqueues_for_the_tick() {
        let mut world = world();
        let d = decision(
            ActionType::QueueAction,
            None,
            json!({"kind": "speak", "message": "queued hello", "priority": 1}),
            "",
        );
        let outcome = executor().execute(&mut world, "ada", &d, 0).expect("queue");
        assert_eq!(outcome.result["priority"], 1);
        assert_eq!(world.queue().len(), 1);
        let report = world.process_queue(1);
        assert!(report.rejected.is_empty());
        assert_eq!(world.speech_log().len(), 1);
    }
}

//! DecisionPipeline: one agent's observe, request, validate, guard, execute
//! and reschedule cycle.
//!
//! Cycles run as detached tasks. The world and scheduler locks are only
//! taken for the synchronous parts; nothing here holds a lock across the
//! decision request.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::client::{DecisionClient, DecisionClientError, DecisionRequest, DecisionResponse};
use super::decision::{parse_decision, ActionType, Decision};
use super::executor::ActionExecutor;
use super::guardrails::{apply_guards, GuardRewrite};
use super::scheduler::{eligible_agents, AutonomyScheduler, AutonomySettings};
use super::speech::SpeechFilter;
use crate::runtime::{lock, ServerClock, SharedWorld};
use crate::simulator::{AgentId, TimestampMs, World};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Executed {
        action_type: ActionType,
        guard: Option<GuardRewrite>,
        next_think_at: Option<TimestampMs>,
    },
    Failed {
        stage: &'static str,
        error: String,
        failures: u32,
        disabled_until: Option<TimestampMs>,
    },
    Skipped {
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub agent_id: AgentId,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

/// Shared state behind every decision cycle: settings, the decision client,
/// the session scheduler, and the action executor.
pub struct AutonomyEngine {
    settings: AutonomySettings,
    system_prompt: String,
    client: Arc<dyn DecisionClient>,
    scheduler: Mutex<AutonomyScheduler>,
    executor: Mutex<ActionExecutor>,
}

impl std::fmt::Debug for AutonomyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomyEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AutonomyEngine {
    pub fn new(
        settings: AutonomySettings,
        system_prompt: impl Into<String>,
        client: Arc<dyn DecisionClient>,
    ) -> Self {
        let executor = ActionExecutor::new(
            settings.speech_action_types.clone(),
            SpeechFilter::new(
                settings.agent_speech_window_ms,
                settings.global_speech_window_ms,
                settings.speech_similarity,
            ),
        );
        Self {
            scheduler: Mutex::new(AutonomyScheduler::new(settings.clone())),
            executor: Mutex::new(executor),
            system_prompt: system_prompt.into(),
            client,
            settings,
        }
    }

    pub fn settings(&self) -> &AutonomySettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Mutex<AutonomyScheduler> {
        &self.scheduler
    }

    /// Claims every due session. Called from the tick with the world locked;
    /// the caller spawns one cycle per returned agent.
    pub fn claim_due(&self, world: &World, now: TimestampMs) -> Vec<AgentId> {
        if !self.settings.enabled {
            return Vec::new();
        }
        let eligible = eligible_agents(world, &self.settings);
        let (due, removed) = {
            let mut scheduler = lock(&self.scheduler);
            let due = scheduler.claim_due(&eligible, now);
            (due, scheduler.take_removed())
        };
        if !removed.is_empty() {
            let mut executor = lock(&self.executor);
            for agent_id in &removed {
                executor.forget_agent(agent_id);
            }
            tracing::debug!(count = removed.len(), "autonomy sessions closed");
        }
        due
    }

    fn fail(
        &self,
        agent_id: &str,
        attempts: u32,
        stage: &'static str,
        error: String,
        now: TimestampMs,
    ) -> CycleReport {
        let outcome = lock(&self.scheduler).record_failure(agent_id, now);
        let (failures, disabled_until) = outcome
            .map(|outcome| (outcome.failures, outcome.disabled_until))
            .unwrap_or((0, None));
        tracing::warn!(agent_id, stage, error = %error, failures, "decision cycle failed");
        if let Some(until) = disabled_until {
            tracing::info!(agent_id, failures, disabled_until = until, "autonomy circuit breaker open");
        }
        CycleReport {
            agent_id: agent_id.to_string(),
            attempts,
            outcome: CycleOutcome::Failed {
                stage,
                error,
                failures,
                disabled_until,
            },
        }
    }

    fn skip(&self, agent_id: &str, attempts: u32, reason: &'static str) -> CycleReport {
        lock(&self.scheduler).release(agent_id);
        tracing::debug!(agent_id, reason, "decision cycle skipped");
        CycleReport {
            agent_id: agent_id.to_string(),
            attempts,
            outcome: CycleOutcome::Skipped { reason },
        }
    }

    /// Settles a claimed cycle whose task ended without a report.
    pub fn abandon_cycle(&self, agent_id: &str, panicked: bool, now: TimestampMs) -> CycleReport {
        if panicked {
            self.fail(agent_id, 0, "task", "cycle_panicked".to_string(), now)
        } else {
            self.skip(agent_id, 0, "cancelled")
        }
    }

    /// Sends the request under the per-attempt deadline. Only timeouts are
    /// retried; any other error ends the cycle.
    async fn request(
        &self,
        request: &DecisionRequest,
    ) -> (u32, Result<DecisionResponse, DecisionClientError>) {
        let timeout_ms = self.settings.request_timeout_ms.max(1);
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.client.decide(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DecisionClientError::Timeout { timeout_ms }),
            };
            match result {
                Err(err) if err.is_timeout() && attempts < max_attempts => {
                    tracing::debug!(
                        agent_id = %request.agent_id,
                        attempts,
                        "decision request timed out, retrying"
                    );
                }
                other => return (attempts, other),
            }
        }
    }

    /// Runs one full cycle for a claimed agent.
    pub async fn run_cycle(
        self: Arc<Self>,
        world: SharedWorld,
        agent_id: AgentId,
        clock: ServerClock,
    ) -> CycleReport {
        let observation = lock(&world).observe(&agent_id);
        let Some(observation) = observation else {
            return self.skip(&agent_id, 0, "agent_gone");
        };
        let request = match DecisionRequest::from_observation(&observation, &self.system_prompt) {
            Ok(request) => request,
            Err(err) => return self.fail(&agent_id, 0, "observe", err.to_string(), clock.now_ms()),
        };

        let (attempts, response) = self.request(&request).await;
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                return self.fail(&agent_id, attempts, "request", err.tag().to_string(), clock.now_ms())
            }
        };
        let decision = match parse_decision(&response.output) {
            Ok(decision) => decision,
            Err(err) => return self.fail(&agent_id, attempts, "validate", err.tag(), clock.now_ms()),
        };

        let mut world = lock(&world);
        self.apply(&mut world, &agent_id, attempts, decision, clock.now_ms())
    }

    /// Guard, execute, and reschedule with the world locked.
    pub fn apply(
        &self,
        world: &mut World,
        agent_id: &str,
        attempts: u32,
        mut decision: Decision,
        now: TimestampMs,
    ) -> CycleReport {
        let Some(position) = world.positions().get(agent_id).map(|pos| pos.tile()) else {
            return self.skip(agent_id, attempts, "agent_gone");
        };
        world
            .agents_mut()
            .record_reasoning(agent_id, &decision.goal, &decision.thought);

        let guard = {
            let mut scheduler = lock(&self.scheduler);
            let Some(session) = scheduler
                .session_mut(agent_id)
                .filter(|session| !session.retired)
            else {
                drop(scheduler);
                return self.skip(agent_id, attempts, "session_closed");
            };
            apply_guards(
                &mut decision,
                session,
                position,
                world.collaborators().economy.as_ref(),
                &self.settings,
            )
        };
        if let Some(rewrite) = &guard {
            tracing::debug!(agent_id, guard = rewrite.tag(), "decision rewritten by guard");
        }

        let executed = lock(&self.executor).execute(world, agent_id, &decision, now);
        match executed {
            Ok(outcome) => {
                let next_think_at =
                    lock(&self.scheduler).record_success(agent_id, decision.next_think_ms, now);
                tracing::debug!(
                    agent_id,
                    action = outcome.action_type.as_str(),
                    next_think_at,
                    "decision executed"
                );
                CycleReport {
                    agent_id: agent_id.to_string(),
                    attempts,
                    outcome: CycleOutcome::Executed {
                        action_type: outcome.action_type,
                        guard,
                        next_think_at,
                    },
                }
            }
            Err(err) => self.fail(agent_id, attempts, "execute", err.tag(), now),
        }
    }
}

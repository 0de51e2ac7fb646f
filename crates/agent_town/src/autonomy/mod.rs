//! Agent autonomy: who thinks when, what they asked for, and what runs.
//!
//! This module is organized into submodules:
//! - `decision`: the closed action vocabulary and the strict decision parser
//! - `client`: the decision-service contract and its OpenAI-compatible client
//! - `scheduler`: per-agent sessions, wake times, backoff, circuit breaker
//! - `guardrails`: pending-application and no-progress rewrites
//! - `speech`: near-duplicate utterance filter
//! - `executor`: action validation and dispatch into the world
//! - `pipeline`: one observe-to-reschedule cycle

mod client;
mod decision;
mod executor;
mod guardrails;
mod pipeline;
mod scheduler;
mod speech;

pub use client::{
    DecisionClient, DecisionClientError, DecisionRequest, DecisionResponse, LlmSettings,
    LlmSettingsError, OpenAiDecisionClient, DEFAULT_LLM_SYSTEM_PROMPT, DEFAULT_LLM_TIMEOUT_MS,
    ENV_LLM_API_KEY, ENV_LLM_BASE_URL, ENV_LLM_MODEL, ENV_LLM_SYSTEM_PROMPT, ENV_LLM_TIMEOUT_MS,
};
pub use decision::{
    clamp_next_think_ms, extract_json_object, parse_decision, ActionSpec, ActionType, Decision,
    DecisionError, DEFAULT_NEXT_THINK_MS, MAX_NEXT_THINK_MS, MIN_NEXT_THINK_MS,
};
pub use executor::{ActionError, ActionExecutor, ExecutionOutcome};
pub use guardrails::{
    apply_guards, apply_job_target, no_progress_guard, pending_application_guard, GuardRewrite,
};
pub use pipeline::{AutonomyEngine, CycleOutcome, CycleReport};
pub use scheduler::{
    eligible_agents, AutonomyScheduler, AutonomySession, AutonomySettings, FailureOutcome,
};
pub use speech::{SpeechFilter, SpeechRejection};

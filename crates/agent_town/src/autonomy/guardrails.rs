//! Guard rails: rewrite rules applied to a validated decision before it runs.
//!
//! Two rules, in order:
//! - a repeated `apply_job` for a job the agent already applied to becomes a
//!   no-op with a longer wait;
//! - the same action signature issued from the same tile too many times in a
//!   row becomes a no-op with a longer wait.

use serde::{Deserialize, Serialize};

use super::decision::{ActionSpec, ActionType, Decision};
use super::scheduler::{AutonomySession, AutonomySettings};
use crate::collaborators::EconomyPort;
use crate::simulator::TilePos;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "guard", rename_all = "snake_case")]
pub enum GuardRewrite {
    PendingApplication { job_id: String },
    NoProgress { signature: String, repeats: u32 },
}

impl GuardRewrite {
    pub fn tag(&self) -> &'static str {
        match self {
            GuardRewrite::PendingApplication { .. } => "pending_application",
            GuardRewrite::NoProgress { .. } => "no_progress",
        }
    }
}

fn force_none(decision: &mut Decision, delay_ms: u64, settings: &AutonomySettings) {
    decision.action = ActionSpec::none();
    decision.next_think_ms = settings.clamp_think_ms(decision.next_think_ms.max(delay_ms));
}

/// Job id an `apply_job` action refers to.
pub fn apply_job_target(action: &ActionSpec) -> Option<String> {
    action.target_or(&["jobId", "job_id"])
}

pub fn pending_application_guard(
    decision: &mut Decision,
    agent_id: &str,
    economy: &dyn EconomyPort,
    settings: &AutonomySettings,
) -> Option<GuardRewrite> {
    if decision.action.kind != ActionType::ApplyJob {
        return None;
    }
    let job_id = apply_job_target(&decision.action)?;
    if !economy.has_pending_application(agent_id, &job_id) {
        return None;
    }
    force_none(decision, settings.pending_application_delay_ms, settings);
    Some(GuardRewrite::PendingApplication { job_id })
}

/// Tracks `(signature, position)` repeats on the session. The first sighting
/// counts zero and each identical repeat adds one; at the limit the action is
/// forced to a no-op. A different signature or tile resets the count. `none`
/// decisions leave the tracker untouched.
pub fn no_progress_guard(
    decision: &mut Decision,
    session: &mut AutonomySession,
    position: TilePos,
    settings: &AutonomySettings,
) -> Option<GuardRewrite> {
    if decision.action.kind == ActionType::None {
        return None;
    }
    let signature = decision.action.signature();
    let same_signature = session.last_action_signature.as_deref() == Some(signature.as_str());
    let same_position = session.last_decision_position == Some(position);

    if same_signature && same_position {
        session.repeat_no_progress_count = session.repeat_no_progress_count.saturating_add(1);
    } else {
        session.last_action_signature = Some(signature.clone());
        session.last_decision_position = Some(position);
        session.repeat_no_progress_count = 0;
    }

    let limit = settings.no_progress_repeat_limit.max(1);
    if session.repeat_no_progress_count < limit {
        return None;
    }
    let repeats = session.repeat_no_progress_count;
    force_none(decision, settings.no_progress_delay_ms, settings);
    Some(GuardRewrite::NoProgress { signature, repeats })
}

/// Runs both guards. At most one rewrite applies.
pub fn apply_guards(
    decision: &mut Decision,
    session: &mut AutonomySession,
    position: TilePos,
    economy: &dyn EconomyPort,
    settings: &AutonomySettings,
) -> Option<GuardRewrite> {
    let agent_id = session.agent_id.clone();
    pending_application_guard(decision, &agent_id, economy, settings)
        .or_else(|| no_progress_guard(decision, session, position, settings))
}

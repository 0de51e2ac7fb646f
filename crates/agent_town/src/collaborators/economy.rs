//! In-memory economy: balances, jobs, applications and hiring votes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::{
    snapshot_error, CollaboratorError, CollaboratorOutput, EconomyPort, EventTransition, JobView,
    Policy, TickCollaborator, TickContext,
};
use crate::simulator::AgentId;

const NAME: &str = "economy";
pub const STARTING_BALANCE: f64 = 100.0;
pub const VOTES_TO_HIRE: usize = 2;
/// Salary is paid once per this many ticks (one minute at 100 ms).
pub const PAYDAY_INTERVAL_TICKS: u64 = 600;

const DEFAULT_JOBS: &[(&str, &str, f64, &str)] = &[
    ("job-baker", "Baker", 12.0, "cafe"),
    ("job-librarian", "Librarian", 10.0, "library"),
    ("job-clerk", "Town Clerk", 14.0, "town-hall"),
    ("job-smith", "Smith", 15.0, "workshop"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Application {
    applicant_id: AgentId,
    votes: BTreeSet<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EconomyState {
    balances: BTreeMap<AgentId, f64>,
    jobs: BTreeMap<String, JobView>,
    /// Pending applications keyed by job id.
    applications: BTreeMap<String, Vec<Application>>,
    salary_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryEconomy {
    state: EconomyState,
}

impl Default for InMemoryEconomy {
    fn default() -> Self {
        let jobs = DEFAULT_JOBS
            .iter()
            .map(|(id, title, salary, building)| {
                (
                    id.to_string(),
                    JobView {
                        id: id.to_string(),
                        title: title.to_string(),
                        salary: *salary,
                        building_id: Some(building.to_string()),
                        holder: None,
                    },
                )
            })
            .collect();
        Self {
            state: EconomyState {
                balances: BTreeMap::new(),
                jobs,
                applications: BTreeMap::new(),
                salary_multiplier: 1.0,
            },
        }
    }
}

impl InMemoryEconomy {
    pub fn salary_multiplier(&self) -> f64 {
        self.state.salary_multiplier
    }

    fn balance_mut(&mut self, agent_id: &str) -> &mut f64 {
        self.state
            .balances
            .entry(agent_id.to_string())
            .or_insert(STARTING_BALANCE)
    }

    fn hire(&mut self, applicant_id: &str, job_id: &str) {
        if let Some(job) = self.state.jobs.get_mut(job_id) {
            job.holder = Some(applicant_id.to_string());
        }
        self.state.applications.remove(job_id);
        for pending in self.state.applications.values_mut() {
            pending.retain(|application| application.applicant_id != applicant_id);
        }
        self.state.applications.retain(|_, pending| !pending.is_empty());
    }
}

impl TickCollaborator for InMemoryEconomy {
    fn name(&self) -> &str {
        NAME
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<CollaboratorOutput, CollaboratorError> {
        for agent_id in ctx.agent_ids {
            self.balance_mut(agent_id);
        }
        if ctx.tick > 0 && ctx.tick % PAYDAY_INTERVAL_TICKS == 0 {
            let multiplier = self.state.salary_multiplier;
            let payroll: Vec<(AgentId, f64)> = self
                .state
                .jobs
                .values()
                .filter_map(|job| job.holder.clone().map(|holder| (holder, job.salary)))
                .collect();
            for (holder, salary) in payroll {
                *self.balance_mut(&holder) += salary * multiplier;
            }
        }
        Ok(CollaboratorOutput::default())
    }

    fn summary(&self) -> Value {
        let filled = self
            .state
            .jobs
            .values()
            .filter(|job| job.holder.is_some())
            .count();
        json!({
            "jobsOpen": self.state.jobs.len() - filled,
            "jobsFilled": filled,
            "pendingApplications": self.state.applications.values().map(Vec::len).sum::<usize>(),
            "salaryMultiplier": self.state.salary_multiplier,
        })
    }

    fn create_snapshot(&self) -> Option<Value> {
        serde_json::to_value(&self.state).ok()
    }

    fn load_snapshot(&mut self, snapshot: Value) -> Result<(), CollaboratorError> {
        self.state = serde_json::from_value(snapshot).map_err(|err| snapshot_error(NAME, err))?;
        Ok(())
    }
}

impl EconomyPort for InMemoryEconomy {
    fn balance(&self, agent_id: &str) -> f64 {
        self.state
            .balances
            .get(agent_id)
            .copied()
            .unwrap_or(STARTING_BALANCE)
    }

    fn job(&self, agent_id: &str) -> Option<JobView> {
        self.state
            .jobs
            .values()
            .find(|job| job.holder.as_deref() == Some(agent_id))
            .cloned()
    }

    fn open_jobs(&self, limit: usize) -> Vec<JobView> {
        self.state
            .jobs
            .values()
            .filter(|job| job.holder.is_none())
            .take(limit)
            .cloned()
            .collect()
    }

    fn has_pending_application(&self, agent_id: &str, job_id: &str) -> bool {
        self.state
            .applications
            .get(job_id)
            .map(|pending| pending.iter().any(|app| app.applicant_id == agent_id))
            .unwrap_or(false)
    }

    fn apply_job(&mut self, agent_id: &str, job_id: &str) -> Result<Value, CollaboratorError> {
        let job = self
            .state
            .jobs
            .get(job_id)
            .ok_or_else(|| CollaboratorError::not_found(NAME, "job", job_id))?;
        if job.holder.as_deref() == Some(agent_id) {
            return Err(CollaboratorError::rejected(NAME, "already_holds_job"));
        }
        if job.holder.is_some() {
            return Err(CollaboratorError::rejected(NAME, "job_taken"));
        }
        if self.has_pending_application(agent_id, job_id) {
            return Err(CollaboratorError::rejected(NAME, "application_pending"));
        }
        self.state
            .applications
            .entry(job_id.to_string())
            .or_default()
            .push(Application {
                applicant_id: agent_id.to_string(),
                votes: BTreeSet::new(),
            });
        Ok(json!({ "jobId": job_id, "status": "pending" }))
    }

    fn vote_job(
        &mut self,
        voter_id: &str,
        applicant_id: &str,
        job_id: &str,
    ) -> Result<Value, CollaboratorError> {
        if voter_id == applicant_id {
            return Err(CollaboratorError::rejected(NAME, "cannot_vote_for_self"));
        }
        let application = self
            .state
            .applications
            .get_mut(job_id)
            .and_then(|pending| {
                pending
                    .iter_mut()
                    .find(|app| app.applicant_id == applicant_id)
            })
            .ok_or_else(|| {
                CollaboratorError::not_found(NAME, "application", format!("{applicant_id}:{job_id}"))
            })?;
        application.votes.insert(voter_id.to_string());
        let votes = application.votes.len();
        if votes >= VOTES_TO_HIRE {
            self.hire(applicant_id, job_id);
            return Ok(json!({ "jobId": job_id, "status": "hired", "votes": votes }));
        }
        Ok(json!({ "jobId": job_id, "status": "voted", "votes": votes }))
    }

    fn apply_policies(&mut self, policies: &[Policy]) {
        self.state.salary_multiplier = policies
            .iter()
            .map(|policy| policy.salary_multiplier)
            .product();
    }

    fn apply_event_effects(&mut self, transitions: &[EventTransition], agent_ids: &[AgentId]) {
        let bonus: f64 = transitions.iter().map(|t| t.economy_bonus).sum();
        if bonus == 0.0 {
            return;
        }
        for agent_id in agent_ids {
            *self.balance_mut(agent_id) += bonus;
        }
    }
}

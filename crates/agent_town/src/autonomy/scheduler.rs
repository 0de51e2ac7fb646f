//! AutonomySessionScheduler: per-agent wake times, failure backoff, and the
//! circuit breaker that decides when each agent thinks next.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::decision::{ActionType, MAX_NEXT_THINK_MS, MIN_NEXT_THINK_MS};
use crate::simulator::{AgentId, AgentKind, TilePos, TimestampMs, World};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomySettings {
    pub enabled: bool,
    pub npc_autonomy: bool,
    pub min_think_ms: u64,
    pub max_think_ms: u64,
    pub think_jitter_ms: u64,
    pub initial_jitter_ms: u64,
    pub base_cooldown_ms: u64,
    pub failure_threshold: u32,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub pending_application_delay_ms: u64,
    pub no_progress_delay_ms: u64,
    pub no_progress_repeat_limit: u32,
    pub speech_action_types: Vec<ActionType>,
    pub agent_speech_window_ms: u64,
    pub global_speech_window_ms: u64,
    pub speech_similarity: f64,
    pub seed: u64,
}

impl Default for AutonomySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            npc_autonomy: true,
            min_think_ms: MIN_NEXT_THINK_MS,
            max_think_ms: MAX_NEXT_THINK_MS,
            think_jitter_ms: 1_000,
            initial_jitter_ms: 3_000,
            base_cooldown_ms: 5_000,
            failure_threshold: 3,
            request_timeout_ms: 15_000,
            max_attempts: 2,
            pending_application_delay_ms: 30_000,
            no_progress_delay_ms: 20_000,
            no_progress_repeat_limit: 3,
            speech_action_types: vec![
                ActionType::SocialAction,
                ActionType::MoveToAgent,
                ActionType::NegotiatePropose,
                ActionType::NegotiateCounter,
                ActionType::NegotiateAccept,
                ActionType::CommitmentDeclare,
                ActionType::FavorCreate,
                ActionType::FavorRepay,
            ],
            agent_speech_window_ms: 60_000,
            global_speech_window_ms: 15_000,
            speech_similarity: 0.85,
            seed: 11,
        }
    }
}

impl AutonomySettings {
    pub fn clamp_think_ms(&self, value: u64) -> u64 {
        value.clamp(self.min_think_ms, self.max_think_ms.max(self.min_think_ms))
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutonomySession {
    pub agent_id: AgentId,
    pub next_think_at: TimestampMs,
    pub disabled_until: Option<TimestampMs>,
    pub failures: u32,
    pub running: bool,
    pub last_action_signature: Option<String>,
    pub last_decision_position: Option<TilePos>,
    pub repeat_no_progress_count: u32,
    /// The agent left the eligible set while a cycle was in flight. The
    /// session is deleted when that cycle hands it back.
    #[serde(default)]
    pub retired: bool,
}

impl AutonomySession {
    pub fn new(agent_id: impl Into<AgentId>, next_think_at: TimestampMs) -> Self {
        Self {
            agent_id: agent_id.into(),
            next_think_at,
            disabled_until: None,
            failures: 0,
            running: false,
            last_action_signature: None,
            last_decision_position: None,
            repeat_no_progress_count: 0,
            retired: false,
        }
    }

    pub fn is_due(&self, now: TimestampMs) -> bool {
        !self.running
            && !self.retired
            && now >= self.next_think_at
            && self.disabled_until.map(|until| now >= until).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failures: u32,
    pub backoff_ms: u64,
    pub disabled_until: Option<TimestampMs>,
}

/// Agents allowed to think: connected humans, and NPCs when NPC autonomy is
/// on. Both need a world position.
pub fn eligible_agents(world: &World, settings: &AutonomySettings) -> Vec<AgentId> {
    world
        .agents()
        .iter()
        .filter(|profile| match profile.kind {
            AgentKind::Human => profile.connected,
            AgentKind::Npc => settings.npc_autonomy,
        })
        .filter(|profile| world.movement().position(&profile.id).is_some())
        .map(|profile| profile.id.clone())
        .collect()
}

#[derive(Debug)]
pub struct AutonomyScheduler {
    settings: AutonomySettings,
    sessions: BTreeMap<AgentId, AutonomySession>,
    removed: Vec<AgentId>,
    rng: StdRng,
}

impl AutonomyScheduler {
    pub fn new(settings: AutonomySettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        Self {
            settings,
            sessions: BTreeMap::new(),
            removed: Vec::new(),
            rng,
        }
    }

    pub fn settings(&self) -> &AutonomySettings {
        &self.settings
    }

    pub fn sessions(&self) -> &BTreeMap<AgentId, AutonomySession> {
        &self.sessions
    }

    pub fn session(&self, agent_id: &str) -> Option<&AutonomySession> {
        self.sessions.get(agent_id)
    }

    pub fn session_mut(&mut self, agent_id: &str) -> Option<&mut AutonomySession> {
        self.sessions.get_mut(agent_id)
    }

    pub fn running_count(&self) -> usize {
        self.sessions.values().filter(|session| session.running).count()
    }

    fn jitter(&mut self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..=max_ms)
        }
    }

    /// Syncs sessions with the eligible set and claims every due session.
    /// Sessions of ineligible agents are deleted, or retired while their
    /// cycle is still running; new ones wake within the initial jitter.
    /// Claimed sessions are marked running.
    pub fn claim_due(&mut self, eligible: &[AgentId], now: TimestampMs) -> Vec<AgentId> {
        let eligible_set: BTreeSet<&str> = eligible.iter().map(String::as_str).collect();
        let mut removed = Vec::new();
        self.sessions.retain(|agent_id, session| {
            if eligible_set.contains(agent_id.as_str()) {
                session.retired = false;
                true
            } else if session.running {
                session.retired = true;
                true
            } else {
                removed.push(agent_id.clone());
                false
            }
        });
        self.removed.extend(removed);

        for agent_id in eligible {
            if !self.sessions.contains_key(agent_id) {
                let wake = now + self.jitter(self.settings.initial_jitter_ms);
                self.sessions
                    .insert(agent_id.clone(), AutonomySession::new(agent_id.clone(), wake));
            }
        }

        let mut due = Vec::new();
        for session in self.sessions.values_mut() {
            if session.is_due(now) {
                session.running = true;
                due.push(session.agent_id.clone());
            }
        }
        due
    }

    /// `min(max_think_ms, base_cooldown_ms * 2^(failures - 1))`.
    pub fn backoff_ms(&self, failures: u32) -> u64 {
        let exponent = failures.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.settings
            .base_cooldown_ms
            .saturating_mul(factor)
            .min(self.settings.max_think_ms)
    }

    /// Clears failures and the breaker, then schedules the next wake at the
    /// clamped delay plus jitter.
    pub fn record_success(
        &mut self,
        agent_id: &str,
        next_think_ms: u64,
        now: TimestampMs,
    ) -> Option<TimestampMs> {
        let delay = self.settings.clamp_think_ms(next_think_ms);
        let jitter = self.jitter(self.settings.think_jitter_ms);
        let session = self.sessions.get_mut(agent_id)?;
        if session.retired {
            self.drop_session(agent_id);
            return None;
        }
        session.failures = 0;
        session.disabled_until = None;
        session.running = false;
        session.next_think_at = now + delay + jitter;
        Some(session.next_think_at)
    }

    /// Bumps the failure count and backs off. At the threshold the breaker
    /// opens until the backoff elapses.
    pub fn record_failure(&mut self, agent_id: &str, now: TimestampMs) -> Option<FailureOutcome> {
        let session = self.sessions.get(agent_id)?;
        if session.retired {
            self.drop_session(agent_id);
            return None;
        }
        let failures = session.failures.saturating_add(1);
        let backoff_ms = self.backoff_ms(failures);
        let threshold = self.settings.failure_threshold.max(1);
        let session = self.sessions.get_mut(agent_id)?;
        session.failures = failures;
        session.running = false;
        session.next_think_at = now + backoff_ms;
        if failures >= threshold {
            session.disabled_until = Some(now + backoff_ms);
        }
        Some(FailureOutcome {
            failures,
            backoff_ms,
            disabled_until: session.disabled_until,
        })
    }

    /// Lets a claimed session go without touching its schedule.
    pub fn release(&mut self, agent_id: &str) {
        let Some(session) = self.sessions.get_mut(agent_id) else {
            return;
        };
        if session.retired {
            self.drop_session(agent_id);
        } else {
            session.running = false;
        }
    }

    /// Agents whose sessions were deleted since the last call.
    pub fn take_removed(&mut self) -> Vec<AgentId> {
        std::mem::take(&mut self.removed)
    }

    fn drop_session(&mut self, agent_id: &str) {
        if self.sessions.remove(agent_id).is_some() {
            self.removed.push(agent_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> AutonomyScheduler {
        AutonomyScheduler::new(AutonomySettings {
            initial_jitter_ms: 0,
            think_jitter_ms: 0,
            ..AutonomySettings::default()
        })
    }

    fn ids(names: &[&str]) -> Vec<AgentId> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn running_session_is_not_claimed_twice() {
        let mut scheduler = scheduler();
        assert_eq!(scheduler.claim_due(&ids(&["a", "b"]), 0), ids(&["a", "b"]));
        assert!(scheduler.claim_due(&ids(&["a", "b"]), 10).is_empty());
        assert_eq!(scheduler.running_count(), 2);
    }

    #[test]
    fn ineligible_sessions_are_deleted() {
        let mut scheduler = scheduler();
        scheduler.claim_due(&ids(&["a", "b"]), 0);
        scheduler.release("a");
        scheduler.claim_due(&ids(&["b"]), 1);
        assert!(scheduler.session("a").is_none());
        assert!(scheduler.session("b").is_some());
    }

    #[test]
    fn ineligible_running_session_is_retired_until_released() {
        let mut scheduler = scheduler();
        assert_eq!(scheduler.claim_due(&ids(&["a"]), 0), ids(&["a"]));
        assert!(scheduler.claim_due(&[], 100).is_empty());
        assert!(scheduler.session("a").expect("kept while running").retired);

        // Eligible again while the first cycle is still in flight.
        assert!(scheduler.claim_due(&ids(&["a"]), 200).is_empty());
        assert_eq!(scheduler.running_count(), 1);

        assert!(scheduler.claim_due(&[], 300).is_empty());
        assert_eq!(scheduler.record_success("a", 2_000, 400), None);
        assert!(scheduler.session("a").is_none());
        assert_eq!(scheduler.take_removed(), ids(&["a"]));
        assert!(scheduler.take_removed().is_empty());

        // A fresh session starts only after the old cycle is gone.
        assert_eq!(scheduler.claim_due(&ids(&["a"]), 10_000), ids(&["a"]));
        assert!(scheduler.claim_due(&ids(&["a"]), 20_000).is_empty());
    }

    #[test]
    fn returning_agent_keeps_its_single_in_flight_cycle() {
        let mut scheduler = scheduler();
        scheduler.claim_due(&ids(&["a"]), 0);
        scheduler.claim_due(&[], 100);
        scheduler.claim_due(&ids(&["a"]), 200);
        let session = scheduler.session("a").expect("session");
        assert!(session.running);
        assert!(!session.retired);

        let wake = scheduler.record_success("a", 2_000, 300).expect("wake");
        assert_eq!(wake, 2_300);
        assert!(scheduler.claim_due(&ids(&["a"]), wake - 1).is_empty());
        assert_eq!(scheduler.claim_due(&ids(&["a"]), wake), ids(&["a"]));
    }

    #[test]
    fn retired_session_is_dropped_on_failure_or_release() {
        let mut scheduler = scheduler();
        scheduler.claim_due(&ids(&["a", "b"]), 0);
        scheduler.claim_due(&[], 1);
        assert_eq!(scheduler.record_failure("a", 1), None);
        scheduler.release("b");
        assert!(scheduler.sessions().is_empty());
        assert_eq!(scheduler.take_removed(), ids(&["a", "b"]));
    }

    #[test]
    fn success_clamps_and_resets() {
        let mut scheduler = scheduler();
        scheduler.claim_due(&ids(&["a"]), 0);
        scheduler.record_failure("a", 0);
        scheduler.claim_due(&ids(&["a"]), 100_000);
        let wake = scheduler.record_success("a", 5, 100_000).unwrap();
        assert_eq!(wake, 100_000 + MIN_NEXT_THINK_MS);
        let session = scheduler.session("a").unwrap();
        assert_eq!(session.failures, 0);
        assert_eq!(session.disabled_until, None);
        assert!(!session.running);

        scheduler.claim_due(&ids(&["a"]), wake);
        let wake = scheduler.record_success("a", u64::MAX, wake).unwrap();
        assert_eq!(wake, 100_000 + MIN_NEXT_THINK_MS + MAX_NEXT_THINK_MS);
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let scheduler = scheduler();
        let series: Vec<u64> = (1..=10).map(|f| scheduler.backoff_ms(f)).collect();
        assert_eq!(&series[..4], &[5_000, 10_000, 20_000, 40_000]);
        assert!(series.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(series[9], MAX_NEXT_THINK_MS);
        assert_eq!(scheduler.backoff_ms(200), MAX_NEXT_THINK_MS);
    }

    #[test]
    fn breaker_opens_at_threshold() {
        let mut scheduler = scheduler();
        let mut now = 0;
        scheduler.claim_due(&ids(&["a"]), now);
        for expected in 1..=3u32 {
            let outcome = scheduler.record_failure("a", now).unwrap();
            assert_eq!(outcome.failures, expected);
            assert_eq!(outcome.disabled_until.is_some(), expected >= 3);
            now += outcome.backoff_ms;
            assert_eq!(scheduler.claim_due(&ids(&["a"]), now), ids(&["a"]));
        }
        let session = scheduler.session("a").unwrap();
        assert_eq!(session.disabled_until, Some(now));
        assert!(session.running);
    }

    #[test]
    fn disabled_session_waits_for_cooldown() {
        let mut session = AutonomySession::new("a", 0);
        session.disabled_until = Some(500);
        assert!(!session.is_due(100));
        assert!(session.is_due(500));
    }

    #[test]
    fn initial_jitter_spreads_new_sessions() {
        let mut scheduler = AutonomyScheduler::new(AutonomySettings {
            initial_jitter_ms: 10_000,
            ..AutonomySettings::default()
        });
        let agents: Vec<AgentId> = (0..16).map(|i| format!("agent-{i}")).collect();
        scheduler.claim_due(&agents, 0);
        let wakes: BTreeSet<u64> = scheduler
            .sessions()
            .values()
            .map(|session| session.next_think_at)
            .collect();
        assert!(wakes.len() > 1);
        assert!(wakes.iter().all(|wake| *wake <= 10_000));
    }
}

//! Near-duplicate speech filter with a per-agent window and a global window.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::simulator::{AgentId, TimestampMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpeechRejection {
    #[error("agent repeated itself")]
    AgentDuplicate,
    #[error("someone nearby just said this")]
    GlobalDuplicate,
    #[error("nothing to say")]
    Empty,
}

impl SpeechRejection {
    pub fn tag(self) -> &'static str {
        match self {
            SpeechRejection::AgentDuplicate => "speech_duplicate_agent",
            SpeechRejection::GlobalDuplicate => "speech_duplicate_global",
            SpeechRejection::Empty => "speech_empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Spoken {
    at: TimestampMs,
    agent_id: AgentId,
    tokens: BTreeSet<String>,
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechFilter {
    agent_window_ms: u64,
    global_window_ms: u64,
    threshold: f64,
    per_agent: BTreeMap<AgentId, VecDeque<Spoken>>,
    global: VecDeque<Spoken>,
}

impl SpeechFilter {
    pub fn new(agent_window_ms: u64, global_window_ms: u64, threshold: f64) -> Self {
        Self {
            agent_window_ms,
            global_window_ms,
            threshold,
            per_agent: BTreeMap::new(),
            global: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: TimestampMs) {
        let agent_window = self.agent_window_ms;
        for lines in self.per_agent.values_mut() {
            while lines
                .front()
                .map(|line| now.saturating_sub(line.at) > agent_window)
                .unwrap_or(false)
            {
                lines.pop_front();
            }
        }
        self.per_agent.retain(|_, lines| !lines.is_empty());
        while self
            .global
            .front()
            .map(|line| now.saturating_sub(line.at) > self.global_window_ms)
            .unwrap_or(false)
        {
            self.global.pop_front();
        }
    }

    /// Checks `text` against both windows and records it when allowed.
    pub fn admit(
        &mut self,
        agent_id: &str,
        text: &str,
        now: TimestampMs,
    ) -> Result<(), SpeechRejection> {
        self.prune(now);
        let words = tokens(text);
        if words.is_empty() {
            return Err(SpeechRejection::Empty);
        }
        let own = self
            .per_agent
            .get(agent_id)
            .map(|lines| lines.iter().any(|line| jaccard(&line.tokens, &words) >= self.threshold))
            .unwrap_or(false);
        if own {
            return Err(SpeechRejection::AgentDuplicate);
        }
        if self
            .global
            .iter()
            .any(|line| jaccard(&line.tokens, &words) >= self.threshold)
        {
            return Err(SpeechRejection::GlobalDuplicate);
        }

        let spoken = Spoken {
            at: now,
            agent_id: agent_id.to_string(),
            tokens: words,
        };
        self.global.push_back(spoken.clone());
        self.per_agent
            .entry(agent_id.to_string())
            .or_default()
            .push_back(spoken);
        Ok(())
    }

    pub fn forget_agent(&mut self, agent_id: &str) {
        self.per_agent.remove(agent_id);
        self.global.retain(|line| line.agent_id != agent_id);
    }
}

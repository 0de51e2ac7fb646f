//! The consolidated per-tick payload pushed to viewers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::collaborators::EventTransition;
use crate::integrity::TickChecksum;
use crate::simulator::{
    AgentId, AgentPosition, SpeechEntry, TickId, TimestampMs, World, WorldTimeView,
};

pub const MAX_BROADCAST_SPEECH: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickBroadcast {
    pub tick: TickId,
    pub timestamp: TimestampMs,
    pub agents: BTreeMap<AgentId, AgentPosition>,
    /// Render-only positions blended along in-flight steps.
    pub interpolated: BTreeMap<AgentId, (f64, f64)>,
    pub world_time: WorldTimeView,
    pub summaries: BTreeMap<String, Value>,
    pub transitions: Vec<EventTransition>,
    pub recent_speech: Vec<SpeechEntry>,
    pub processed_events: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<TickChecksum>,
}

impl TickBroadcast {
    pub fn collect(
        world: &World,
        now: TimestampMs,
        transitions: Vec<EventTransition>,
        processed_events: usize,
        checksum: Option<TickChecksum>,
    ) -> Self {
        let interpolated = world
            .positions()
            .keys()
            .filter_map(|agent_id| {
                world
                    .movement()
                    .interpolated_position(agent_id)
                    .map(|pos| (agent_id.clone(), pos))
            })
            .collect();
        let skip = world.speech_log().len().saturating_sub(MAX_BROADCAST_SPEECH);
        Self {
            tick: world.tick(),
            timestamp: now,
            agents: world.positions().clone(),
            interpolated,
            world_time: world.clock().view(),
            summaries: world.collaborators().broadcast_summaries(),
            transitions,
            recent_speech: world.speech_log().entries().skip(skip).cloned().collect(),
            processed_events,
            checksum,
        }
    }
}

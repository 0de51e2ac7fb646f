use serde::{Deserialize, Serialize};

use crate::collaborators::EventTransition;
use crate::runtime::TickBroadcast;
use crate::simulator::{SpeechEntry, TickId};

pub const VIEWER_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerRequest {
    Hello {
        client: String,
        version: u32,
    },
    /// Replaces the connection's stream set. An empty list restores the
    /// default of full tick payloads.
    Subscribe {
        streams: Vec<ViewerStream>,
    },
    /// Resends the most recent tick the connection has seen.
    RequestLatest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerStream {
    Ticks,
    Speech,
    Events,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerResponse {
    HelloAck {
        server: String,
        version: u32,
        world_id: String,
    },
    Tick {
        payload: TickBroadcast,
    },
    Speech {
        tick: TickId,
        entries: Vec<SpeechEntry>,
    },
    Events {
        tick: TickId,
        transitions: Vec<EventTransition>,
    },
    Error {
        message: String,
    },
}

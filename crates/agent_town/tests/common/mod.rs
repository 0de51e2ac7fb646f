#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agent_town::autonomy::{
    AutonomySettings, DecisionClient, DecisionClientError, DecisionRequest, DecisionResponse,
};
use agent_town::collaborators::Collaborators;
use agent_town::runtime::lock;
use agent_town::simulator::{
    AgentKind, GridConfig, TileKind, TilePos, TimestampMs, World, WorldGrid, WorldSettings,
};
use async_trait::async_trait;

/// Replays canned decision-service replies in order, then fails every
/// request with `EmptyChoice`.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String, DecisionClientError>>>,
    requests: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Result<String, DecisionClientError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn repeating(reply: &str, count: usize) -> Arc<Self> {
        Self::new((0..count).map(|_| Ok(reply.to_string())).collect())
    }

    pub fn failing(count: usize) -> Arc<Self> {
        Self::new(
            (0..count)
                .map(|_| {
                    Err(DecisionClientError::HttpStatus {
                        code: 503,
                        message: "unavailable".to_string(),
                    })
                })
                .collect(),
        )
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<DecisionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl DecisionClient for ScriptedClient {
    async fn decide(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionClientError> {
        lock(&self.requests).push(request.clone());
        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or(Err(DecisionClientError::EmptyChoice));
        reply.map(|output| DecisionResponse {
            output,
            model: Some("scripted".to_string()),
        })
    }
}

/// Autonomy settings with jitter removed so wake times are exact.
pub fn exact_settings() -> AutonomySettings {
    AutonomySettings {
        initial_jitter_ms: 0,
        think_jitter_ms: 0,
        ..AutonomySettings::default()
    }
}

/// An all-grass world with no buildings.
pub fn open_world(width: u32, height: u32) -> World {
    let settings = WorldSettings {
        grid: GridConfig {
            width,
            height,
            tile_size: 16,
        },
        ..WorldSettings::default()
    };
    let grid = WorldGrid::filled(settings.grid, TileKind::Grass).expect("grass grid");
    World::new(settings, grid, Collaborators::default())
}

pub fn spawn(world: &mut World, agent_id: &str, kind: AgentKind, x: i32, y: i32, now: TimestampMs) {
    let placed = world
        .spawn_agent(agent_id, agent_id, kind, Some(TilePos::new(x, y)), now)
        .expect("spawn agent");
    assert_eq!(placed, TilePos::new(x, y), "spawn tile for {agent_id} was taken");
}

//! Agent town: an authoritative, tick-driven town simulation where connected
//! clients and LLM-driven residents act on a shared tile world.

pub mod autonomy;
pub mod collaborators;
pub mod config;
pub mod integrity;
pub mod runtime;
pub mod simulator;
pub mod viewer;

pub use autonomy::{
    ActionExecutor, ActionType, AutonomyEngine, AutonomySettings, CycleReport, Decision,
    DecisionClient, LlmSettings, OpenAiDecisionClient,
};
pub use config::{ConfigError, ServerConfig, DEFAULT_CONFIG_FILE_NAME};
pub use integrity::{TickChecksum, TickIntegrityMonitor};
pub use runtime::{
    RuntimeSettings, ServerClock, SharedWorld, TickBroadcast, TickReport, TickStep, WorldRuntime,
};
pub use simulator::{
    AgentId, AgentKind, AgentPosition, TilePos, TimestampMs, World, WorldError, WorldSettings,
    WorldSnapshot,
};
pub use viewer::{ViewerServer, ViewerServerConfig};

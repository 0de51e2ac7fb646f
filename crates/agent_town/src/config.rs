//! Server configuration: a TOML document with per-field defaults, then
//! environment overrides for the decision service.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::autonomy::{AutonomySettings, LlmSettings, LlmSettingsError};
use crate::collaborators::{
    Collaborators, EventCalendar, ManagerSlot, NpcRosterEntry, ScheduledEvent, ScheduledPolicy,
    StaticNpcSpawner, StaticPolicySource,
};
use crate::runtime::{RuntimeSettings, DEFAULT_TICK_MS};
use crate::simulator::{
    GridConfig, WorldSettings, DEFAULT_GRID_HEIGHT, DEFAULT_GRID_WIDTH, DEFAULT_TILE_SIZE,
};
use crate::viewer::{ViewerServerConfig, DEFAULT_VIEWER_BIND_ADDR};

pub const DEFAULT_CONFIG_FILE_NAME: &str = "agent_town.toml";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub world: WorldConfig,
    pub autonomy: AutonomySettings,
    pub llm: LlmSettings,
    pub viewer: ViewerConfig,
    pub npcs: Vec<NpcRosterEntry>,
    pub events: Vec<ScheduledEvent>,
    pub policies: Vec<ScheduledPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub tick_ms: u64,
    pub integrity_check: bool,
    pub telemetry: bool,
    pub seed: u64,
    pub continue_paths: bool,
    pub minutes_per_tick: u64,
    pub micro_events: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        let settings = WorldSettings::default();
        Self {
            width: DEFAULT_GRID_WIDTH,
            height: DEFAULT_GRID_HEIGHT,
            tile_size: DEFAULT_TILE_SIZE,
            tick_ms: DEFAULT_TICK_MS,
            integrity_check: true,
            telemetry: true,
            seed: settings.seed,
            continue_paths: settings.continue_paths,
            minutes_per_tick: settings.minutes_per_tick,
            micro_events: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub world_id: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: DEFAULT_VIEWER_BIND_ADDR.to_string(),
            world_id: "town".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file failed ({path}): {message}")]
    Read { path: String, message: String },
    #[error("parse config file failed ({path}): {message}")]
    Parse { path: String, message: String },
    #[error(transparent)]
    Llm(#[from] LlmSettingsError),
    #[error("invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ServerConfig {
    /// Reads `path`, overlays the environment, and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let mut config = Self::from_toml_str(&content).map_err(|err| match err {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        config.llm.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// The given file, else `agent_town.toml` in the working directory when
    /// it exists, else defaults. The environment applies in every case.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_FILE_NAME);
        if default_path.exists() {
            return Self::load(default_path);
        }
        let mut config = Self::default();
        config.llm.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|err| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: err.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.world.width == 0 || self.world.height == 0 {
            return invalid("world.width/height", "grid must have at least one tile");
        }
        if self.world.tile_size == 0 {
            return invalid("world.tile_size", "must be positive");
        }
        if self.world.tick_ms == 0 {
            return invalid("world.tick_ms", "tick period must be positive");
        }
        if self.autonomy.min_think_ms > self.autonomy.max_think_ms {
            return invalid("autonomy.min_think_ms", "must not exceed max_think_ms");
        }
        if self.autonomy.max_attempts == 0 {
            return invalid("autonomy.max_attempts", "must be at least 1");
        }
        if self.autonomy.failure_threshold == 0 {
            return invalid("autonomy.failure_threshold", "must be at least 1");
        }
        if self.autonomy.request_timeout_ms == 0 {
            return invalid("autonomy.request_timeout_ms", "must be positive");
        }
        if !(self.autonomy.speech_similarity > 0.0 && self.autonomy.speech_similarity <= 1.0) {
            return invalid("autonomy.speech_similarity", "must be in (0, 1]");
        }
        Ok(())
    }

    pub fn world_settings(&self) -> WorldSettings {
        WorldSettings {
            grid: GridConfig {
                width: self.world.width,
                height: self.world.height,
                tile_size: self.world.tile_size,
            },
            continue_paths: self.world.continue_paths,
            seed: self.world.seed,
            minutes_per_tick: self.world.minutes_per_tick,
            ..WorldSettings::default()
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            tick_interval: Duration::from_millis(self.world.tick_ms),
            integrity_check: self.world.integrity_check,
            telemetry: self.world.telemetry,
            ..RuntimeSettings::default()
        }
    }

    pub fn viewer_settings(&self) -> ViewerServerConfig {
        ViewerServerConfig::default()
            .with_bind_addr(self.viewer.bind_addr.clone())
            .with_world_id(self.viewer.world_id.clone())
    }

    /// Reference collaborators wired from the roster, calendar, and policy
    /// schedule.
    pub fn collaborators(&self) -> Collaborators {
        let mut collaborators = Collaborators {
            governance: Box::new(StaticPolicySource::new(self.policies.clone())),
            micro_events_enabled: self.world.micro_events,
            ..Collaborators::default()
        };
        if !self.events.is_empty() {
            collaborators = collaborators.with_manager(
                ManagerSlot::Events,
                Box::new(EventCalendar::new(self.events.clone())),
            );
        }
        if !self.npcs.is_empty() {
            collaborators = collaborators.with_manager(
                ManagerSlot::NpcSpawner,
                Box::new(StaticNpcSpawner::new(self.npcs.clone())),
            );
        }
        collaborators
    }
}

//! Persistence: the versioned world snapshot document and its errors.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use super::action_queue::QueuedAction;
use super::agents::AgentProfile;
use super::clock::WorldClock;
use super::grid::GridConfig;
use super::movement::MovementState;
use super::types::{AgentId, AgentPosition, TickId, SNAPSHOT_VERSION};

// ============================================================================
// Snapshot
// ============================================================================

fn default_snapshot_version() -> u32 {
    SNAPSHOT_VERSION
}

/// The core's part of a save: tick count, grid configuration, agents with
/// their positions and in-flight movement, the queue verbatim, and the clock.
/// Collaborator state rides along as opaque documents keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldSnapshot {
    #[serde(default = "default_snapshot_version")]
    pub version: u32,
    pub tick: TickId,
    pub grid: GridConfig,
    #[serde(default)]
    pub agents: BTreeMap<AgentId, AgentProfile>,
    pub positions: BTreeMap<AgentId, AgentPosition>,
    #[serde(default)]
    pub movements: BTreeMap<AgentId, MovementState>,
    #[serde(default)]
    pub queue: Vec<QueuedAction>,
    #[serde(default)]
    pub next_action_seq: u64,
    pub clock: WorldClock,
    #[serde(default)]
    pub collaborators: BTreeMap<String, Value>,
}

impl WorldSnapshot {
    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self, PersistError> {
        let snapshot: Self = serde_json::from_str(input)?;
        snapshot.validate_version()?;
        Ok(snapshot)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        write_json_to_path(self, path.as_ref())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let snapshot: Self = read_json_from_path(path.as_ref())?;
        snapshot.validate_version()?;
        Ok(snapshot)
    }

    pub(crate) fn validate_version(&self) -> Result<(), PersistError> {
        if self.version == SNAPSHOT_VERSION {
            Ok(())
        } else {
            Err(PersistError::UnsupportedVersion {
                kind: "snapshot".to_string(),
                version: self.version,
                expected: SNAPSHOT_VERSION,
            })
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serde error: {0}")]
    Serde(String),
    #[error("unsupported {kind} version {version} (expected {expected})")]
    UnsupportedVersion {
        kind: String,
        version: u32,
        expected: u32,
    },
    #[error("snapshot grid {actual:?} does not match world grid {expected:?}")]
    GridMismatch {
        expected: GridConfig,
        actual: GridConfig,
    },
    #[error("collaborator snapshot rejected: {0}")]
    Collaborator(String),
}

impl PersistError {
    pub fn tag(&self) -> &'static str {
        match self {
            PersistError::Io(_) => "io",
            PersistError::Serde(_) => "serde",
            PersistError::UnsupportedVersion { .. } => "unsupported_version",
            PersistError::GridMismatch { .. } => "grid_mismatch",
            PersistError::Collaborator(_) => "collaborator",
        }
    }
}

impl From<io::Error> for PersistError {
    fn from(err: io::Error) -> Self {
        PersistError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::Serde(err.to_string())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

pub(crate) fn write_json_to_path<T: Serialize>(value: &T, path: &Path) -> Result<(), PersistError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(path, data)?;
    Ok(())
}

pub(crate) fn read_json_from_path<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

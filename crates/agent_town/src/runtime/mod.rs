//! World runtime: the fixed-rate tick orchestrator and what it emits.
//!
//! - `orchestrator`: `WorldRuntime`, the eleven-step tick and the run loop
//! - `broadcast`: the consolidated per-tick payload pushed to viewers
//! - `perf`: rolling tick and per-step duration series

mod broadcast;
mod orchestrator;
mod perf;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::simulator::{TimestampMs, World};

pub use broadcast::{TickBroadcast, MAX_BROADCAST_SPEECH};
pub use orchestrator::{
    CollaboratorFailure, RuntimeSettings, TickReport, TickStep, WorldRuntime, DEFAULT_TICK_MS,
};
pub use perf::{PerfHealth, PerfSeriesSnapshot, TickPerfCollector, TickPerfSnapshot};

/// The world behind the one lock every mutation path takes.
pub type SharedWorld = Arc<Mutex<World>>;

/// Locks a runtime mutex. A panic while holding it leaves the data as the
/// panicking step left it; the tick keeps going on that state.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Millisecond wall time anchored at runtime start and advanced by the tokio
/// clock, so paused-time tests drive it deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerClock {
    epoch_ms: TimestampMs,
    origin: Option<tokio::time::Instant>,
}

impl ServerClock {
    pub fn start() -> Self {
        let epoch_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        Self {
            epoch_ms,
            origin: Some(tokio::time::Instant::now()),
        }
    }

    /// A clock frozen at `epoch_ms`.
    pub fn fixed(epoch_ms: TimestampMs) -> Self {
        Self {
            epoch_ms,
            origin: None,
        }
    }

    pub fn now_ms(&self) -> TimestampMs {
        let elapsed = self
            .origin
            .map(|origin| u64::try_from(origin.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        self.epoch_ms.saturating_add(elapsed)
    }
}

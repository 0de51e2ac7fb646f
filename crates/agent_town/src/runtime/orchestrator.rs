//! `WorldRuntime`: the fixed-order tick and the fixed-rate loop driving it.
//!
//! A tick holds the world lock from start to finish, so ticks never overlap
//! and decision cycles only ever see state between ticks. Decision cycles are
//! claimed inside the tick and spawned onto a `JoinSet` once the lock is
//! released; the tick never awaits them.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use super::broadcast::TickBroadcast;
use super::perf::{TickPerfCollector, TickPerfSnapshot};
use super::{lock, ServerClock, SharedWorld};
use crate::autonomy::{AutonomyEngine, CycleReport};
use crate::collaborators::{
    CollaboratorError, CollaboratorOutput, EventTransition, ManagerSlot, TickCollaborator,
    TickContext,
};
use crate::integrity::{
    Expectation, NodeId, StateGraph, StateNode, TickChecksum, TickIntegrityMonitor,
};
use crate::simulator::{
    AgentId, AgentKind, QueueRejection, TickId, TimestampMs, World, WorldSnapshot,
};

pub const DEFAULT_TICK_MS: u64 = 100;
const DEFAULT_BROADCAST_CAPACITY: usize = 64;

// ============================================================================
// Settings and Reports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub tick_interval: Duration,
    pub integrity_check: bool,
    pub telemetry: bool,
    pub broadcast_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            integrity_check: true,
            telemetry: true,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// The eleven tick steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TickStep {
    IntegrityStart,
    Physics,
    ActionQueue,
    Housekeeping,
    Policies,
    Collaborators,
    Autonomy,
    Events,
    IntegrityFinish,
    Broadcast,
    Telemetry,
}

impl TickStep {
    pub const ALL: [TickStep; 11] = [
        TickStep::IntegrityStart,
        TickStep::Physics,
        TickStep::ActionQueue,
        TickStep::Housekeeping,
        TickStep::Policies,
        TickStep::Collaborators,
        TickStep::Autonomy,
        TickStep::Events,
        TickStep::IntegrityFinish,
        TickStep::Broadcast,
        TickStep::Telemetry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TickStep::IntegrityStart => "integrity_start",
            TickStep::Physics => "physics",
            TickStep::ActionQueue => "action_queue",
            TickStep::Housekeeping => "housekeeping",
            TickStep::Policies => "policies",
            TickStep::Collaborators => "collaborators",
            TickStep::Autonomy => "autonomy",
            TickStep::Events => "events",
            TickStep::IntegrityFinish => "integrity_finish",
            TickStep::Broadcast => "broadcast",
            TickStep::Telemetry => "telemetry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorFailure {
    pub collaborator: String,
    pub error: CollaboratorError,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickReport {
    pub tick: TickId,
    pub now: TimestampMs,
    /// Steps that ran, in order. Integrity steps are absent when the check is
    /// off.
    pub steps: Vec<TickStep>,
    pub processed_actions: usize,
    pub rejected_actions: Vec<QueueRejection>,
    pub removed_agents: Vec<AgentId>,
    pub transitions: Vec<EventTransition>,
    pub spawned: Vec<AgentId>,
    pub despawned: Vec<AgentId>,
    pub collaborator_failures: Vec<CollaboratorFailure>,
    pub dispatched: Vec<AgentId>,
    /// Actions drained plus event-status transitions.
    pub processed_events: usize,
    pub checksum: Option<TickChecksum>,
    pub integrity_matched: Option<bool>,
    pub duration: Duration,
}

// ============================================================================
// Runtime
// ============================================================================

pub struct WorldRuntime {
    world: SharedWorld,
    settings: RuntimeSettings,
    clock: ServerClock,
    autonomy: Option<Arc<AutonomyEngine>>,
    integrity: TickIntegrityMonitor,
    perf: TickPerfCollector,
    broadcast_tx: broadcast::Sender<Arc<TickBroadcast>>,
    last_broadcast: Option<Arc<TickBroadcast>>,
    cycles: JoinSet<(CycleReport, Duration)>,
    cycle_agents: HashMap<TaskId, AgentId>,
}

impl std::fmt::Debug for WorldRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldRuntime")
            .field("settings", &self.settings)
            .field("autonomy", &self.autonomy.is_some())
            .field("in_flight_cycles", &self.cycles.len())
            .finish_non_exhaustive()
    }
}

impl WorldRuntime {
    pub fn new(world: World, settings: RuntimeSettings, clock: ServerClock) -> Self {
        let (broadcast_tx, _) = broadcast::channel(settings.broadcast_capacity.max(1));
        Self {
            world: Arc::new(std::sync::Mutex::new(world)),
            perf: TickPerfCollector::new(settings.tick_interval),
            integrity: TickIntegrityMonitor::new(),
            settings,
            clock,
            autonomy: None,
            broadcast_tx,
            last_broadcast: None,
            cycles: JoinSet::new(),
            cycle_agents: HashMap::new(),
        }
    }

    pub fn with_autonomy(mut self, engine: Arc<AutonomyEngine>) -> Self {
        self.autonomy = Some(engine);
        self
    }

    pub fn world(&self) -> SharedWorld {
        Arc::clone(&self.world)
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn clock(&self) -> ServerClock {
        self.clock
    }

    pub fn autonomy(&self) -> Option<&Arc<AutonomyEngine>> {
        self.autonomy.as_ref()
    }

    pub fn integrity(&self) -> &TickIntegrityMonitor {
        &self.integrity
    }

    pub fn perf(&self) -> TickPerfSnapshot {
        self.perf.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TickBroadcast>> {
        self.broadcast_tx.subscribe()
    }

    /// A sender clone for components that subscribe later, such as the
    /// viewer server.
    pub fn broadcaster(&self) -> broadcast::Sender<Arc<TickBroadcast>> {
        self.broadcast_tx.clone()
    }

    pub fn last_broadcast(&self) -> Option<Arc<TickBroadcast>> {
        self.last_broadcast.clone()
    }

    pub fn in_flight_cycles(&self) -> usize {
        self.cycles.len()
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        lock(&self.world).snapshot()
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// Runs one tick through all steps in their fixed order.
    pub fn tick(&mut self) -> TickReport {
        let started = Instant::now();
        let now = self.clock.now_ms();
        self.reap_cycles();

        let shared = Arc::clone(&self.world);
        let mut world = lock(&shared);
        let tick = world.advance_tick();
        let mut report = TickReport {
            tick,
            now,
            ..TickReport::default()
        };
        let mut timer = StepTimer::new();
        let moving_at_start = world.movement().any_moving();

        // 1. Integrity start
        if self.settings.integrity_check {
            let (graph, root) = integrity_state(&world);
            self.integrity.start_tick(tick, &graph, root);
            timer.lap(&mut report, TickStep::IntegrityStart);
        }

        // 2. Physics
        let physics = world.physics_tick(now);
        if let Some(weather) = physics.weather_changed {
            tracing::debug!(tick, ?weather, "weather changed");
        }
        timer.lap(&mut report, TickStep::Physics);

        // 3. Action queue
        let queue = world.process_queue(now);
        report.processed_actions = queue.processed;
        report.rejected_actions = queue.rejected;
        timer.lap(&mut report, TickStep::ActionQueue);

        // 4. Housekeeping
        report.removed_agents = world.housekeeping(now);
        timer.lap(&mut report, TickStep::Housekeeping);

        // 5. Policies
        let policies = world.collaborators().governance.active_policies();
        world.collaborators_mut().economy.apply_policies(&policies);
        timer.lap(&mut report, TickStep::Policies);

        // 6. Collaborators
        let output = self.tick_collaborators(&mut world, tick, now, &mut report);
        report.transitions = output.transitions;
        for spawn in output.spawns {
            match world.spawn_agent(&spawn.agent_id, &spawn.name, AgentKind::Npc, spawn.preferred, now) {
                Ok(_) => report.spawned.push(spawn.agent_id),
                Err(err) => {
                    tracing::warn!(tick, agent_id = %spawn.agent_id, error = %err, "npc spawn failed")
                }
            }
        }
        for agent_id in output.despawns {
            if world.despawn_agent(&agent_id) {
                report.despawned.push(agent_id);
            }
        }
        timer.lap(&mut report, TickStep::Collaborators);

        // 7. Autonomy: claim only; the cycles start once the lock is released.
        if let Some(engine) = &self.autonomy {
            report.dispatched = engine.claim_due(&world, now);
        }
        timer.lap(&mut report, TickStep::Autonomy);

        // 8. Events
        report.processed_events = report.processed_actions + report.transitions.len();
        if !report.transitions.is_empty() {
            let agent_ids = world.agent_ids();
            let collaborators = world.collaborators_mut();
            collaborators
                .economy
                .apply_event_effects(&report.transitions, &agent_ids);
            collaborators
                .social
                .apply_event_effects(&report.transitions, &agent_ids);
        }
        timer.lap(&mut report, TickStep::Events);

        // 9. Integrity finish
        if self.settings.integrity_check {
            let (graph, root) = integrity_state(&world);
            let checksum = self.integrity.finish_tick(tick, &graph, root);
            let expectation = expectation_for(&report, moving_at_start);
            report.integrity_matched = Some(self.integrity.check(&checksum, expectation));
            report.checksum = Some(checksum);
            timer.lap(&mut report, TickStep::IntegrityFinish);
        }

        // 10. Broadcast
        let payload = Arc::new(TickBroadcast::collect(
            &world,
            now,
            report.transitions.clone(),
            report.processed_events,
            report.checksum.clone(),
        ));
        // No subscribers is the normal idle state.
        let _ = self.broadcast_tx.send(Arc::clone(&payload));
        self.last_broadcast = Some(payload);
        timer.lap(&mut report, TickStep::Broadcast);
        drop(world);

        self.spawn_cycles(&report.dispatched);

        // 11. Telemetry
        report.duration = started.elapsed();
        report.steps.push(TickStep::Telemetry);
        if self.settings.telemetry {
            self.perf.record_tick(report.duration);
            for (step, duration) in &timer.laps {
                self.perf.record_step(step.as_str(), *duration);
            }
        }
        for rejection in &report.rejected_actions {
            tracing::debug!(
                tick,
                agent_id = %rejection.agent_id,
                action = %rejection.action_type,
                error = %rejection.error,
                "queued action rejected"
            );
        }
        report
    }

    /// Economy, voting, governance, the favor ledger, then the remaining
    /// manager slots in slot order. A failing collaborator is logged and
    /// skipped; the rest still tick.
    fn tick_collaborators(
        &mut self,
        world: &mut World,
        tick: TickId,
        now: TimestampMs,
        report: &mut TickReport,
    ) -> CollaboratorOutput {
        let agent_ids = world.agent_ids();
        let time = world.clock().view();
        let ctx = TickContext {
            tick,
            now,
            live_agents: world.agents().live_count(),
            agent_ids: &agent_ids,
            time: &time,
        };
        let mut output = CollaboratorOutput::default();
        let mut runner = CollaboratorRunner {
            ctx: &ctx,
            output: &mut output,
            failures: &mut report.collaborator_failures,
            perf: self.settings.telemetry.then_some(&mut self.perf),
        };

        let collaborators = world.collaborators_mut();
        let micro_events = collaborators.micro_events_enabled;
        runner.run(collaborators.economy.as_mut());
        if let Some(voting) = collaborators.manager_mut(ManagerSlot::Voting) {
            runner.run(voting);
        }
        runner.run(collaborators.governance.as_mut());
        runner.run(collaborators.social.as_mut());
        for (slot, manager) in collaborators.managers.iter_mut() {
            match slot {
                ManagerSlot::Voting => continue,
                ManagerSlot::MicroEvents if !micro_events => continue,
                _ => runner.run(manager.as_mut()),
            }
        }
        output
    }

    fn spawn_cycles(&mut self, agent_ids: &[AgentId]) {
        let Some(engine) = &self.autonomy else {
            return;
        };
        for agent_id in agent_ids {
            let engine = Arc::clone(engine);
            let world = Arc::clone(&self.world);
            let clock = self.clock;
            let task_agent = agent_id.clone();
            let handle = self.cycles.spawn(async move {
                let started = Instant::now();
                let report = engine.run_cycle(world, task_agent, clock).await;
                (report, started.elapsed())
            });
            self.cycle_agents.insert(handle.id(), agent_id.clone());
        }
    }

    /// Collects finished cycles without waiting.
    pub fn reap_cycles(&mut self) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        while let Some(joined) = self.cycles.try_join_next_with_id() {
            if let Some(report) = self.record_cycle(joined) {
                reports.push(report);
            }
        }
        reports
    }

    /// Waits for every in-flight cycle.
    pub async fn wait_for_cycles(&mut self) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        while let Some(joined) = self.cycles.join_next_with_id().await {
            if let Some(report) = self.record_cycle(joined) {
                reports.push(report);
            }
        }
        reports
    }

    /// A cycle task that died without reporting still hands its session
    /// back: a panic counts as a failure, a cancellation just releases.
    fn record_cycle(
        &mut self,
        joined: Result<(TaskId, (CycleReport, Duration)), JoinError>,
    ) -> Option<CycleReport> {
        match joined {
            Ok((id, (report, duration))) => {
                self.cycle_agents.remove(&id);
                if self.settings.telemetry {
                    self.perf.record_decision_cycle(duration);
                }
                Some(report)
            }
            Err(err) => {
                let agent_id = self.cycle_agents.remove(&err.id());
                tracing::error!(agent_id = ?agent_id, error = %err, "decision cycle task failed");
                let engine = self.autonomy.as_ref()?;
                Some(engine.abandon_cycle(&agent_id?, err.is_panic(), self.clock.now_ms()))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------------

    /// Ticks at the configured period until `shutdown` resolves or
    /// `max_ticks` have run. Late ticks are skipped, never bunched. Returns the
    /// number of ticks run.
    pub async fn run<F>(&mut self, shutdown: F, max_ticks: Option<u64>) -> u64
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        let mut ticks = 0u64;
        tracing::info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            integrity = self.settings.integrity_check,
            autonomy = self.autonomy.is_some(),
            "world runtime started"
        );
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let report = self.tick();
                    ticks += 1;
                    if report.duration > self.settings.tick_interval {
                        tracing::warn!(
                            tick = report.tick,
                            duration_ms = report.duration.as_millis() as u64,
                            "tick overran its period"
                        );
                    }
                    if max_ticks.is_some_and(|max| ticks >= max) {
                        break;
                    }
                }
            }
        }
        tracing::info!(ticks, in_flight = self.cycles.len(), "world runtime stopped");
        ticks
    }

    /// Cancels decision cycles still in flight.
    pub fn shutdown(&mut self) {
        self.cycles.abort_all();
        self.cycle_agents.clear();
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct StepTimer {
    last: Instant,
    laps: Vec<(TickStep, Duration)>,
}

impl StepTimer {
    fn new() -> Self {
        Self {
            last: Instant::now(),
            laps: Vec::with_capacity(TickStep::ALL.len()),
        }
    }

    fn lap(&mut self, report: &mut TickReport, step: TickStep) {
        let now = Instant::now();
        self.laps.push((step, now.duration_since(self.last)));
        self.last = now;
        report.steps.push(step);
    }
}

struct CollaboratorRunner<'r, 'c> {
    ctx: &'r TickContext<'c>,
    output: &'r mut CollaboratorOutput,
    failures: &'r mut Vec<CollaboratorFailure>,
    perf: Option<&'r mut TickPerfCollector>,
}

impl CollaboratorRunner<'_, '_> {
    fn run<T: TickCollaborator + ?Sized>(&mut self, collaborator: &mut T) {
        let started = Instant::now();
        let result = collaborator.tick(self.ctx);
        if let Some(perf) = self.perf.as_deref_mut() {
            perf.record_collaborator(collaborator.name(), started.elapsed());
        }
        match result {
            Ok(mut output) => {
                self.output.transitions.append(&mut output.transitions);
                self.output.spawns.append(&mut output.spawns);
                self.output.despawns.append(&mut output.despawns);
            }
            Err(error) => {
                tracing::warn!(
                    tick = self.ctx.tick,
                    collaborator = collaborator.name(),
                    error = %error,
                    "collaborator tick failed"
                );
                self.failures.push(CollaboratorFailure {
                    collaborator: collaborator.name().to_string(),
                    error,
                });
            }
        }
    }
}

/// What the tick is expected to do to the integrity state. In-flight steps
/// always advance; roster and event changes always show. Drained actions may
/// or may not touch positions.
fn expectation_for(report: &TickReport, moving_at_start: bool) -> Expectation {
    if moving_at_start
        || !report.transitions.is_empty()
        || !report.spawned.is_empty()
        || !report.despawned.is_empty()
        || !report.removed_agents.is_empty()
    {
        Expectation::Change
    } else if report.processed_actions > 0 {
        Expectation::Unknown
    } else {
        Expectation::NoChange
    }
}

/// Tick counter, every agent position with its in-flight step, building
/// occupancy, and the active-event summary.
fn integrity_state(world: &World) -> (StateGraph, NodeId) {
    let mut graph = StateGraph::new();
    let tick = graph.number(world.tick() as f64);

    let mut positions = Vec::with_capacity(world.positions().len());
    let mut occupancy: std::collections::BTreeMap<&str, Vec<NodeId>> =
        std::collections::BTreeMap::new();
    for (agent_id, position) in world.positions() {
        let key = graph.string(agent_id.clone());
        let mut record = json!({
            "x": position.x,
            "y": position.y,
            "facing": position.facing,
            "state": position.state,
        });
        if let Some(movement) = world.movement().movement(agent_id) {
            record["step"] = json!({
                "to": [movement.to_x, movement.to_y],
                "progress": movement.progress,
            });
        }
        let value = graph.import_json(&record);
        positions.push((key, value));
        if let Some(building_id) = &position.current_building {
            let member = graph.string(agent_id.clone());
            occupancy.entry(building_id.as_str()).or_default().push(member);
        }
    }
    let positions = graph.push(StateNode::Map(positions));

    let mut occupants = Vec::with_capacity(occupancy.len());
    for (building_id, members) in occupancy {
        let members = graph.push(StateNode::Set(members));
        occupants.push((building_id.to_string(), members));
    }
    let occupancy = graph.push(StateNode::Object(occupants));

    let events = graph.import_json(&event_summary(world));
    let root = graph.push(StateNode::Object(vec![
        ("tick".to_string(), tick),
        ("positions".to_string(), positions),
        ("occupancy".to_string(), occupancy),
        ("events".to_string(), events),
    ]));
    (graph, root)
}

fn event_summary(world: &World) -> Value {
    let managers = &world.collaborators().managers;
    let summary = |slot: ManagerSlot| {
        managers
            .get(&slot)
            .map(|manager| manager.summary())
            .unwrap_or(Value::Null)
    };
    json!({
        "events": summary(ManagerSlot::Events),
        "scheduled": summary(ManagerSlot::ScheduledEvents),
    })
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use agent_town::autonomy::{
    ActionType, AutonomyEngine, AutonomySettings, CycleOutcome, DecisionClient,
    DecisionClientError, DecisionRequest, DecisionResponse,
};
use agent_town::runtime::{lock, RuntimeSettings, ServerClock, WorldRuntime};
use agent_town::simulator::{AgentKind, MotionState, QueuedAction, QueuedActionKind, TilePos};
use async_trait::async_trait;
use common::{exact_settings, open_world, spawn, ScriptedClient};

const NOW: u64 = 1_000;

/// Never answers inside any sane deadline.
struct StalledClient;

#[async_trait]
impl DecisionClient for StalledClient {
    async fn decide(&self, _request: &DecisionRequest) -> Result<DecisionResponse, DecisionClientError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Err(DecisionClientError::EmptyChoice)
    }
}

struct PanickingClient;

#[async_trait]
impl DecisionClient for PanickingClient {
    async fn decide(&self, _request: &DecisionRequest) -> Result<DecisionResponse, DecisionClientError> {
        panic!("decision client blew up");
    }
}

fn runtime_with_engine(
    agents: &[(&str, AgentKind, i32, i32)],
    settings: AutonomySettings,
    client: Arc<dyn DecisionClient>,
) -> WorldRuntime {
    let mut world = open_world(12, 8);
    for (agent_id, kind, x, y) in agents {
        spawn(&mut world, agent_id, *kind, *x, *y, NOW);
    }
    let engine = AutonomyEngine::new(settings, "stay in character", client);
    WorldRuntime::new(world, RuntimeSettings::default(), ServerClock::fixed(NOW))
        .with_autonomy(Arc::new(engine))
}

#[test]
fn queued_actions_run_in_priority_then_time_then_id_order() {
    let mut world = open_world(8, 8);
    for (index, agent_id) in ["a", "b", "c", "d"].into_iter().enumerate() {
        spawn(&mut world, agent_id, AgentKind::Human, index as i32, 0, NOW);
    }
    for (agent_id, priority, timestamp) in [("d", 1, 100), ("c", 2, 200), ("b", 1, 300), ("a", 1, 300)] {
        world
            .enqueue_action(QueuedAction::new(
                format!("act-{agent_id}"),
                agent_id,
                priority,
                timestamp,
                QueuedActionKind::Wait,
            ))
            .expect("enqueue");
    }
    let mut runtime = WorldRuntime::new(world, RuntimeSettings::default(), ServerClock::fixed(NOW));

    let report = runtime.tick();
    assert_eq!(report.processed_actions, 4);
    assert!(report.rejected_actions.is_empty());

    let world = runtime.world();
    let world = lock(&world);
    let order: Vec<&str> = world
        .action_log()
        .entries()
        .map(|entry| entry.agent_id.as_str())
        .collect();
    assert_eq!(order, vec!["d", "a", "b", "c"]);
    assert!(world.queue().is_empty());
}

#[test]
fn a_rejected_action_does_not_stop_the_rest() {
    let mut world = open_world(8, 8);
    spawn(&mut world, "ada", AgentKind::Human, 1, 1, NOW);
    world
        .enqueue("ada", 0, QueuedActionKind::MoveTo { x: 40, y: 40 }, NOW)
        .expect("enqueue off-map move");
    world
        .enqueue("ada", 1, QueuedActionKind::Speak { message: "still here".to_string() }, NOW)
        .expect("enqueue speech");
    let mut runtime = WorldRuntime::new(world, RuntimeSettings::default(), ServerClock::fixed(NOW));

    let report = runtime.tick();
    assert_eq!(report.processed_actions, 2);
    assert_eq!(report.rejected_actions.len(), 1);
    assert_eq!(report.rejected_actions[0].action_type, "move_to");

    let broadcast = runtime.last_broadcast().expect("broadcast after tick");
    assert_eq!(broadcast.tick, 1);
    assert_eq!(broadcast.recent_speech.len(), 1);
    assert_eq!(broadcast.recent_speech[0].message, "still here");
}

#[tokio::test]
async fn dispatched_decision_moves_the_agent_on_later_ticks() {
    let reply = r#"{"goal":"explore","action":{"type":"move_to_position","params":{"x":5,"y":2}},"nextThinkMs":2000}"#;
    let client = ScriptedClient::repeating(reply, 1);
    let mut runtime = runtime_with_engine(
        &[("ada", AgentKind::Npc, 2, 2)],
        exact_settings(),
        client.clone(),
    );

    let first = runtime.tick();
    assert_eq!(first.dispatched, vec!["ada".to_string()]);
    let cycles = runtime.wait_for_cycles().await;
    assert_eq!(cycles.len(), 1);
    assert!(matches!(
        cycles[0].outcome,
        CycleOutcome::Executed {
            action_type: ActionType::MoveToPosition,
            guard: None,
            next_think_at: Some(3_000),
        }
    ));
    assert_eq!(runtime.in_flight_cycles(), 0);

    let moving = runtime.tick();
    assert!(moving.dispatched.is_empty());
    assert!(moving.checksum.expect("checksum").changed);
    assert_eq!(
        lock(&runtime.world()).positions()["ada"].state,
        MotionState::Moving
    );

    for _ in 0..100 {
        runtime.tick();
    }
    let world = runtime.world();
    let world = lock(&world);
    let ada = &world.positions()["ada"];
    assert_eq!(ada.tile(), TilePos::new(5, 2));
    assert_eq!(ada.state, MotionState::Idle);
    assert_eq!(runtime.integrity().anomalies(), 0);
    assert_eq!(client.request_count(), 1);
}

#[tokio::test]
async fn social_utterance_reaches_the_next_broadcast() {
    let reply = r#"{"action":{"type":"social_action","target":"bob","params":{"kind":"greet"}},"utterance":"Morning, Bob!","nextThinkMs":5000}"#;
    let settings = AutonomySettings {
        npc_autonomy: false,
        ..exact_settings()
    };
    let mut runtime = runtime_with_engine(
        &[("ada", AgentKind::Human, 2, 2), ("bob", AgentKind::Npc, 3, 2)],
        settings,
        ScriptedClient::repeating(reply, 1),
    );
    let mut ticks = runtime.subscribe();

    let first = runtime.tick();
    assert_eq!(first.dispatched, vec!["ada".to_string()]);
    let first_payload = ticks.try_recv().expect("first broadcast");
    assert!(first_payload.recent_speech.is_empty());

    let cycles = runtime.wait_for_cycles().await;
    assert!(matches!(
        cycles[0].outcome,
        CycleOutcome::Executed {
            action_type: ActionType::SocialAction,
            ..
        }
    ));

    runtime.tick();
    let second_payload = ticks.try_recv().expect("second broadcast");
    assert_eq!(second_payload.tick, 2);
    let said: Vec<(&str, &str)> = second_payload
        .recent_speech
        .iter()
        .map(|entry| (entry.agent_id.as_str(), entry.message.as_str()))
        .collect();
    assert_eq!(said, vec![("ada", "Morning, Bob!")]);
}

#[tokio::test]
async fn disabled_autonomy_dispatches_nothing() {
    let settings = AutonomySettings {
        enabled: false,
        ..exact_settings()
    };
    let client = ScriptedClient::repeating(r#"{"action":{"type":"none"}}"#, 1);
    let mut runtime =
        runtime_with_engine(&[("ada", AgentKind::Npc, 1, 1)], settings, client.clone());
    for _ in 0..3 {
        assert!(runtime.tick().dispatched.is_empty());
    }
    assert!(runtime.wait_for_cycles().await.is_empty());
    assert_eq!(client.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_request_times_out_while_ticks_keep_running() {
    let settings = exact_settings();
    let deadline = Duration::from_millis(settings.request_timeout_ms);
    let mut runtime = runtime_with_engine(
        &[("ada", AgentKind::Npc, 2, 2)],
        settings.clone(),
        Arc::new(StalledClient),
    );

    assert_eq!(runtime.tick().dispatched, vec!["ada".to_string()]);
    let step = deadline / 4;
    let mut last_tick = 1;
    // Two full deadlines minus one step: the second attempt is still pending.
    for _ in 0..7 {
        tokio::time::sleep(step).await;
        let report = runtime.tick();
        assert_eq!(report.tick, last_tick + 1);
        assert!(report.dispatched.is_empty(), "ada dispatched twice");
        assert_eq!(runtime.in_flight_cycles(), 1);
        last_tick = report.tick;
    }

    let cycles = runtime.wait_for_cycles().await;
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].attempts, settings.max_attempts);
    match &cycles[0].outcome {
        CycleOutcome::Failed {
            stage,
            error,
            failures,
            ..
        } => {
            assert_eq!(*stage, "request");
            assert_eq!(error, "timeout");
            assert_eq!(*failures, 1);
        }
        other => panic!("expected request failure, got {other:?}"),
    }
    let engine = runtime.autonomy().expect("engine").clone();
    let session = lock(engine.scheduler())
        .session("ada")
        .cloned()
        .expect("session");
    assert!(!session.running);
    assert_eq!(session.next_think_at, NOW + settings.base_cooldown_ms);
}

#[tokio::test]
async fn panicked_cycle_backs_off_instead_of_wedging_the_agent() {
    let mut runtime = runtime_with_engine(
        &[("ada", AgentKind::Npc, 2, 2)],
        exact_settings(),
        Arc::new(PanickingClient),
    );
    assert_eq!(runtime.tick().dispatched, vec!["ada".to_string()]);

    let cycles = runtime.wait_for_cycles().await;
    assert_eq!(cycles.len(), 1);
    assert!(matches!(
        cycles[0].outcome,
        CycleOutcome::Failed {
            stage: "task",
            failures: 1,
            ..
        }
    ));
    let engine = runtime.autonomy().expect("engine").clone();
    let session = lock(engine.scheduler())
        .session("ada")
        .cloned()
        .expect("session");
    assert!(!session.running);
    assert_eq!(session.next_think_at, NOW + exact_settings().base_cooldown_ms);
}

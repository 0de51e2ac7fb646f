use super::*;
use std::fs;

#[test]
fn world_snapshot_roundtrip_through_disk() {
    let mut world = town(true);
    populate(&mut world);
    let target = walkable_target(&world, TilePos::new(12, 20));
    world.move_agent("bo", target, 0).expect("move");
    for tick in 1..=7 {
        world.advance_tick();
        world.physics_tick(tick * 100);
    }
    world.speak("ada", "morning all", 700).expect("speak");
    world
        .enqueue("cy", 3, QueuedActionKind::Wait, 700)
        .expect("enqueue");

    let tmp_dir = std::env::temp_dir().join("agent-town-snapshot-test");
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir).unwrap();
    }
    let path = tmp_dir.join("world.json");
    world.snapshot().save_json(&path).unwrap();

    let loaded = WorldSnapshot::load_json(&path).unwrap();
    let mut restored = town(true);
    restored.restore(loaded).unwrap();

    assert_eq!(restored.tick(), 7);
    assert_eq!(restored.positions(), world.positions());
    assert_eq!(restored.movement().movements(), world.movement().movements());
    assert_eq!(restored.queue().actions(), world.queue().actions());
    assert_eq!(restored.clock(), world.clock());
    assert_eq!(
        restored.agents().get("ada").unwrap().memory.len(),
        world.agents().get("ada").unwrap().memory.len()
    );

    for tick in 8..=400 {
        world.physics_tick(tick * 100);
        restored.physics_tick(tick * 100);
    }
    assert_eq!(restored.positions(), world.positions());

    fs::remove_dir_all(&tmp_dir).unwrap();
}

#[test]
fn unsupported_snapshot_version_fails_loudly() {
    let world = town(true);
    let mut snapshot = world.snapshot();
    snapshot.version = SNAPSHOT_VERSION + 1;
    let json = snapshot.to_json().unwrap();
    let err = WorldSnapshot::from_json(&json).unwrap_err();
    assert!(matches!(
        err,
        PersistError::UnsupportedVersion { version, .. } if version == SNAPSHOT_VERSION + 1
    ));

    let mut other = town(true);
    assert_eq!(other.restore(snapshot).unwrap_err().tag(), "unsupported_version");
}

#[test]
fn grid_mismatch_is_rejected() {
    let world = town(true);
    let mut snapshot = world.snapshot();
    snapshot.grid.width += 1;
    let mut other = town(true);
    assert!(matches!(
        other.restore(snapshot),
        Err(PersistError::GridMismatch { .. })
    ));
}

#[test]
fn occupancy_is_rebuilt_from_positions() {
    let mut world = town(true);
    let cafe = world.grid().building("cafe").expect("cafe").clone();
    world
        .spawn_agent("ada", "Ada", AgentKind::Human, Some(cafe.entrance()), 0)
        .expect("spawn");
    let snapshot = world.snapshot();

    let mut restored = town(true);
    restored.restore(snapshot).unwrap();
    assert!(restored
        .grid()
        .building("cafe")
        .unwrap()
        .occupancy
        .contains("ada"));
    assert_eq!(
        restored.positions()["ada"].current_building.as_deref(),
        Some("cafe")
    );
}

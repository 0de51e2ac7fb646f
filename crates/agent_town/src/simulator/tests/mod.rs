//! Tests for the simulator module.

use super::*;
use crate::collaborators::Collaborators;

mod persist;

fn town(continue_paths: bool) -> World {
    let settings = WorldSettings {
        grid: GridConfig {
            width: 32,
            height: 32,
            tile_size: 16,
        },
        continue_paths,
        ..WorldSettings::default()
    };
    World::generate(settings, Collaborators::default()).expect("generate town")
}

fn populate(world: &mut World) {
    for (index, id) in ["ada", "bo", "cy"].iter().enumerate() {
        world
            .spawn_agent(
                id,
                &id.to_uppercase(),
                AgentKind::Npc,
                Some(TilePos::new(4 + index as i32 * 3, 4)),
                0,
            )
            .expect("spawn");
    }
}

fn walkable_target(world: &World, near: TilePos) -> TilePos {
    world
        .grid()
        .find_spawn_point(near, &Default::default())
        .expect("walkable target")
}

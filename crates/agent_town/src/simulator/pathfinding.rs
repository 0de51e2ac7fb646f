//! A* search over the tile grid.
//!
//! Eight-connected moves, orthogonal cost 1 and diagonal cost √2, Manhattan
//! heuristic. The open set is a plain list scanned for the lowest f-score; the
//! first entry with the strictly lowest score wins, so ties resolve by insertion
//! order and the search is fully deterministic. Only in-bounds walkable tiles
//! are neighbors; other agents are never obstacles.

use std::collections::{BTreeSet, HashMap};
use std::f64::consts::SQRT_2;

use super::grid::WorldGrid;
use super::types::{TilePos, PATHFINDING_MAX_ITERATIONS};

const NEIGHBOR_OFFSETS: [(i32, i32); 8] = [
    (0, -1),
    (1, 0),
    (0, 1),
    (-1, 0),
    (1, -1),
    (1, 1),
    (-1, 1),
    (-1, -1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pathfinder {
    max_iterations: usize,
}

impl Default for Pathfinder {
    fn default() -> Self {
        Self {
            max_iterations: PATHFINDING_MAX_ITERATIONS,
        }
    }
}

impl Pathfinder {
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Returns the tile sequence from `start` to `end` inclusive, or `None` when
    /// the goal is unwalkable, unreachable, or the iteration cap is hit before
    /// the goal is expanded. Partial paths are never returned.
    pub fn find_path(&self, grid: &WorldGrid, start: TilePos, end: TilePos) -> Option<Vec<TilePos>> {
        if !grid.in_bounds(start) || !grid.is_walkable(end) {
            return None;
        }
        if start == end {
            return Some(vec![start]);
        }

        let mut open: Vec<TilePos> = vec![start];
        let mut in_open: BTreeSet<TilePos> = BTreeSet::from([start]);
        let mut closed: BTreeSet<TilePos> = BTreeSet::new();
        let mut g_score: HashMap<TilePos, f64> = HashMap::from([(start, 0.0)]);
        let mut f_score: HashMap<TilePos, f64> =
            HashMap::from([(start, heuristic(start, end))]);
        let mut came_from: HashMap<TilePos, TilePos> = HashMap::new();

        let mut iterations = 0;
        while !open.is_empty() {
            if iterations >= self.max_iterations {
                return None;
            }
            iterations += 1;

            let mut best_index = 0;
            let mut best_f = f64::INFINITY;
            for (index, pos) in open.iter().enumerate() {
                let f = f_score.get(pos).copied().unwrap_or(f64::INFINITY);
                if f < best_f {
                    best_f = f;
                    best_index = index;
                }
            }
            let current = open.remove(best_index);
            in_open.remove(&current);

            if current == end {
                return Some(reconstruct_path(&came_from, current));
            }
            closed.insert(current);

            let current_g = g_score.get(&current).copied().unwrap_or(f64::INFINITY);
            for (dx, dy) in NEIGHBOR_OFFSETS {
                let neighbor = TilePos::new(current.x + dx, current.y + dy);
                if closed.contains(&neighbor) || !grid.is_walkable(neighbor) {
                    continue;
                }
                let step_cost = if dx != 0 && dy != 0 { SQRT_2 } else { 1.0 };
                let tentative = current_g + step_cost;
                let known = g_score.get(&neighbor).copied().unwrap_or(f64::INFINITY);
                if tentative < known {
                    came_from.insert(neighbor, current);
                    g_score.insert(neighbor, tentative);
                    f_score.insert(neighbor, tentative + heuristic(neighbor, end));
                    if in_open.insert(neighbor) {
                        open.push(neighbor);
                    }
                }
            }
        }
        None
    }
}

fn heuristic(from: TilePos, to: TilePos) -> f64 {
    f64::from(from.manhattan(to))
}

fn reconstruct_path(came_from: &HashMap<TilePos, TilePos>, goal: TilePos) -> Vec<TilePos> {
    let mut path = vec![goal];
    let mut cursor = goal;
    while let Some(prev) = came_from.get(&cursor) {
        path.push(*prev);
        cursor = *prev;
    }
    path.reverse();
    path
}

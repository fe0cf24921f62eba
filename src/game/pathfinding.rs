//! The pathfinding seam.
//!
//! The kernel only owns the request queue and the result plumbing; the
//! planner itself is an external collaborator behind `plan_path`. Requests
//! are serviced FIFO with a per-tick budget. Re-requesting moves a unit to
//! the back of the queue, discarding its stale pending work.
//!
//! The built-in planner produces a direct route to the goal, which is enough
//! for flat or lightly obstructed ground; a hierarchical planner can be
//! swapped in behind the same contract without touching the kernel.

use crate::game::math::{SimScalar, SimVector};
use crate::game::simulation::GameSimulation;
use crate::game::unit::{MovingStateGoal, NavigationStateInfo, UnitId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathRequest {
    pub unit_id: UnitId,
}

#[derive(Clone, Debug)]
pub struct UnitPath {
    pub waypoints: Vec<SimVector>,
}

/// The closest world-space point on a footprint rectangle's boundary,
/// measured from `position`. Used to walk to (or escape from) a rectangle.
pub fn find_closest_point_to_footprint_xz(
    sim: &GameSimulation,
    rect: crate::game::grid::DiscreteRect,
    position: SimVector,
) -> SimVector {
    let top_left = sim.terrain.heightmap_index_to_world_corner(rect.x, rect.y);
    let bottom_right = sim
        .terrain
        .heightmap_index_to_world_corner(rect.x + rect.width as i32, rect.y + rect.height as i32);

    let clamped_x = position.x.clamp(top_left.x, bottom_right.x);
    let clamped_z = position.z.clamp(top_left.z, bottom_right.z);

    let inside = clamped_x == position.x && clamped_z == position.z;
    let (x, z) = if inside {
        // Push out through the nearest edge.
        let dx_left = position.x - top_left.x;
        let dx_right = bottom_right.x - position.x;
        let dz_top = position.z - top_left.z;
        let dz_bottom = bottom_right.z - position.z;
        let min = dx_left.min(dx_right).min(dz_top).min(dz_bottom);
        if min == dx_left {
            (top_left.x, position.z)
        } else if min == dx_right {
            (bottom_right.x, position.z)
        } else if min == dz_top {
            (position.x, top_left.z)
        } else {
            (position.x, bottom_right.z)
        }
    } else {
        (clamped_x, clamped_z)
    };

    let y = sim.terrain.get_height_at(x, z);
    SimVector::new(x, y, z)
}

fn resolve_goal_position(sim: &GameSimulation, unit_id: UnitId, goal: &MovingStateGoal) -> SimVector {
    match goal {
        MovingStateGoal::Position(v) => *v,
        MovingStateGoal::Rect(rect) => {
            let position = sim
                .units
                .get(unit_id)
                .map(|u| u.position)
                .unwrap_or(SimVector::ZERO);
            find_closest_point_to_footprint_xz(sim, *rect, position)
        }
    }
}

/// Plans a path for a unit towards its current desired destination.
fn plan_path(sim: &GameSimulation, unit_id: UnitId, goal: &MovingStateGoal) -> UnitPath {
    let destination = resolve_goal_position(sim, unit_id, goal);
    let mut waypoints = Vec::with_capacity(1);
    if let Some(unit) = sim.units.get(unit_id) {
        // A midpoint keeps long legs responsive to re-planning on collision.
        let to_goal = destination - unit.position;
        if to_goal.xz().length_squared() > SimScalar::from_num(128 * 128) {
            let mid = unit.position + to_goal / SimScalar::from_num(2);
            waypoints.push(SimVector::new(
                mid.x,
                sim.terrain.get_height_at(mid.x, mid.z),
                mid.z,
            ));
        }
    }
    waypoints.push(destination);
    UnitPath { waypoints }
}

/// Services queued path requests, oldest first, up to the per-tick budget.
pub fn service_path_requests(sim: &mut GameSimulation, budget: usize) {
    for _ in 0..budget {
        let Some(request) = sim.path_requests.pop_front() else {
            return;
        };

        let goal = match sim.units.get(request.unit_id) {
            Some(unit) => match &unit.navigation_state.state {
                NavigationStateInfo::Moving { destination, .. } => Some(*destination),
                _ => None,
            },
            None => None,
        };
        let Some(goal) = goal else {
            continue;
        };

        let path = plan_path(sim, request.unit_id, &goal);
        let created = sim.game_time;
        if let Some(unit) = sim.units.get_mut(request.unit_id) {
            if let NavigationStateInfo::Moving {
                path: path_slot,
                path_requested,
                ..
            } = &mut unit.navigation_state.state
            {
                *path_slot = Some(crate::game::unit::PathFollowingInfo::new(path, created));
                *path_requested = false;
            }
        }
    }
}

/// True when a unit has arrived at the given goal.
///
/// Path following only brings a unit within its waypoint radius; orders
/// complete on this tighter check, with the final approach steered directly.
pub fn has_reached_goal(
    sim: &GameSimulation,
    position: SimVector,
    goal: &MovingStateGoal,
) -> bool {
    match goal {
        MovingStateGoal::Position(dest) => {
            position.xz().distance_squared(dest.xz()) < SimScalar::ONE
        }
        MovingStateGoal::Rect(rect) => {
            let closest = find_closest_point_to_footprint_xz(sim, *rect, position);
            position.xz().distance_squared(closest.xz()) < SimScalar::ONE
        }
    }
}

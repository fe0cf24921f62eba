//! Steering primitives and firing-geometry solvers for the behavior engine.

use crate::game::angle::{self, SimAngle};
use crate::game::definitions::{ProjectilePhysicsType, UnitDefinition};
use crate::game::grid::DiscreteRect;
use crate::game::math::{clamp, SimScalar, SimVector};
use crate::game::simulation::GameSimulation;
use crate::game::terrain::MapTerrain;
use crate::game::unit::{SteeringInfo, UnitPhysicsInfoGround, UnitState};

pub fn are_closer_than(a: SimVector, b: SimVector, distance: SimScalar) -> bool {
    a.distance_squared(b) < distance * distance
}

/// Head straight for the destination at full speed.
pub fn seek(unit: &UnitState, definition: &UnitDefinition, dest: SimVector) -> SteeringInfo {
    SteeringInfo {
        target_angle: UnitState::to_rotation(dest.xz() - unit.position.xz()),
        target_speed: definition.max_speed,
        should_take_off: false,
    }
}

/// Like `seek`, but slow down inside braking distance of the destination.
pub fn arrive(
    unit: &UnitState,
    definition: &UnitDefinition,
    physics: &UnitPhysicsInfoGround,
    dest: SimVector,
) -> SteeringInfo {
    let mut steering = seek(unit, definition, dest);
    if definition.brake_rate > SimScalar::ZERO {
        let braking_distance = (physics.current_speed * physics.current_speed)
            / (SimScalar::from_num(2) * definition.brake_rate);
        if braking_distance > SimScalar::ZERO {
            let distance = (dest.xz() - unit.position.xz()).length();
            let scale = clamp(
                distance / braking_distance,
                SimScalar::ZERO,
                SimScalar::ONE,
            );
            steering.target_speed = steering.target_speed * scale;
        }
    }
    steering
}

/// Advances a ground unit's forward speed towards the steering target,
/// applying acceleration or braking and the underwater speed penalty.
pub fn compute_new_ground_unit_speed(
    terrain: &MapTerrain,
    unit: &UnitState,
    definition: &UnitDefinition,
    physics: &UnitPhysicsInfoGround,
) -> SimScalar {
    let mut effective_max = definition.max_speed;
    if unit.position.y < terrain.get_sea_level() {
        effective_max = effective_max / SimScalar::from_num(2);
    }
    let target = clamp(physics.steering.target_speed, SimScalar::ZERO, effective_max);

    let current = physics.current_speed;
    if target > current {
        (current + definition.acceleration).min(target)
    } else {
        let braked = current - definition.brake_rate;
        braked.max(target)
    }
}

/// Advances a flying unit's velocity towards its target position.
pub fn compute_new_air_unit_velocity(
    unit: &UnitState,
    definition: &UnitDefinition,
    target_position: Option<SimVector>,
    current_velocity: SimVector,
) -> SimVector {
    let desired = match target_position {
        Some(target) => {
            let to_target = target - unit.position;
            let distance = to_target.length();
            if distance == SimScalar::ZERO {
                SimVector::ZERO
            } else if distance < definition.max_speed {
                to_target
            } else {
                to_target * (definition.max_speed / distance)
            }
        }
        None => SimVector::ZERO,
    };

    let delta = desired - current_velocity;
    let delta_len = delta.length();
    if delta_len <= definition.acceleration {
        desired
    } else {
        current_velocity + delta * (definition.acceleration / delta_len)
    }
}

/// The heading (relative to the unit's rotation) and pitch a weapon must aim
/// at to hit `target` from `aim_from`.
pub fn compute_heading_and_pitch(
    rotation: SimAngle,
    aim_from: SimVector,
    target: SimVector,
    projectile_speed: SimScalar,
    gravity: SimScalar,
    ballistic_z_offset: SimScalar,
    physics_type: &ProjectilePhysicsType,
) -> (SimAngle, SimAngle) {
    let delta = target - aim_from;
    let heading = UnitState::to_rotation(delta.xz()) - rotation;

    let pitch = match physics_type {
        ProjectilePhysicsType::LineOfSight | ProjectilePhysicsType::Tracking { .. } => {
            line_of_sight_pitch(delta)
        }
        ProjectilePhysicsType::Ballistic => {
            let horizontal = delta.xz().length() - ballistic_z_offset;
            ballistic_pitch(projectile_speed, gravity, horizontal, delta.y)
        }
    };

    (heading, pitch)
}

/// Heading and pitch straight down the line to the target, used for build
/// arms and beam-style weapons.
pub fn compute_line_of_sight_heading_and_pitch(
    rotation: SimAngle,
    from: SimVector,
    to: SimVector,
) -> (SimAngle, SimAngle) {
    let delta = to - from;
    let heading = UnitState::to_rotation(delta.xz()) - rotation;
    (heading, line_of_sight_pitch(delta))
}

fn line_of_sight_pitch(delta: SimVector) -> SimAngle {
    let horizontal = delta.xz().length();
    angle::atan2(delta.y, horizontal)
}

/// Low-arc firing solution for a ballistic projectile:
/// `tan(pitch) = (v^2 - sqrt(v^4 - g(g d^2 + 2 y v^2))) / (g d)`.
/// Out-of-range targets get the maximum-range 45 degree arc.
fn ballistic_pitch(
    speed: SimScalar,
    gravity: SimScalar,
    horizontal: SimScalar,
    dy: SimScalar,
) -> SimAngle {
    if gravity <= SimScalar::ZERO || horizontal <= SimScalar::ZERO {
        return line_of_sight_pitch(SimVector::new(horizontal, dy, SimScalar::ZERO));
    }

    let v2 = speed * speed;
    let discriminant =
        v2 * v2 - gravity * (gravity * horizontal * horizontal + SimScalar::from_num(2) * dy * v2);
    if discriminant < SimScalar::ZERO {
        return SimAngle::new(0x2000);
    }

    angle::atan2(v2 - discriminant.sqrt(), gravity * horizontal)
}

/// Searches outward from the unit's footprint in deterministic ring order for
/// the nearest clear, walkable cell rectangle to land on.
pub fn find_landing_location(sim: &GameSimulation, unit_id: crate::game::unit::UnitId) -> Option<SimVector> {
    let unit = sim.units.get(unit_id)?;
    let definition = sim.try_get_unit_definition(&unit.unit_type)?;
    let footprint = sim.compute_footprint_region_for(unit.position, &definition.movement_collision_info);
    let movement_class = sim.resolve_movement_class(&definition.movement_collision_info);

    const MAX_SEARCH_RADIUS: i32 = 16;
    for radius in 0..=MAX_SEARCH_RADIUS {
        let mut best: Option<(i32, i32)> = None;
        for dz in -radius..=radius {
            for dx in -radius..=radius {
                if dx.abs() != radius && dz.abs() != radius {
                    continue;
                }
                let candidate = DiscreteRect::new(
                    footprint.x + dx,
                    footprint.y + dz,
                    footprint.width,
                    footprint.height,
                );
                if sim.is_collision_at(&candidate) {
                    continue;
                }
                if !sim
                    .terrain
                    .is_grid_point_walkable(&movement_class, candidate.x, candidate.y)
                {
                    continue;
                }
                best = Some((candidate.x, candidate.y));
                break;
            }
            if best.is_some() {
                break;
            }
        }
        if let Some((x, y)) = best {
            let corner = sim.terrain.heightmap_index_to_world_corner(x, y);
            let half_x = SimScalar::from_num(
                footprint.width as i64 * crate::game::terrain::HEIGHT_TILE_WIDTH_IN_WORLD_UNITS,
            ) / SimScalar::from_num(2);
            let half_z = SimScalar::from_num(
                footprint.height as i64 * crate::game::terrain::HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS,
            ) / SimScalar::from_num(2);
            let cx = corner.x + half_x;
            let cz = corner.z + half_z;
            return Some(SimVector::new(cx, sim.terrain.get_height_at(cx, cz), cz));
        }
    }
    None
}

/// The cruise height for a flying unit over a given map position.
pub fn get_target_altitude(
    terrain: &MapTerrain,
    x: SimScalar,
    z: SimScalar,
    definition: &UnitDefinition,
) -> SimScalar {
    terrain.get_height_at(x, z).max(terrain.get_sea_level()) + definition.cruise_altitude
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballistic_pitch_is_flat_for_close_fast_shots() {
        // Very fast projectile, short range: pitch approaches zero.
        let pitch = ballistic_pitch(
            SimScalar::from_num(100),
            SimScalar::from_num(0.124),
            SimScalar::from_num(50),
            SimScalar::ZERO,
        );
        assert!(pitch.value < 0x0100, "pitch {} too steep", pitch.value);
    }

    #[test]
    fn ballistic_pitch_caps_at_quarter_arc_when_out_of_range() {
        let pitch = ballistic_pitch(
            SimScalar::from_num(1),
            SimScalar::from_num(0.124),
            SimScalar::from_num(10_000),
            SimScalar::ZERO,
        );
        assert_eq!(pitch, SimAngle::new(0x2000));
    }

    #[test]
    fn line_of_sight_pitch_matches_elevation() {
        // 45 degrees up.
        let pitch = line_of_sight_pitch(SimVector::from_num(10, 10, 0));
        assert!(angle::angle_between(pitch, SimAngle::new(0x2000)).value < 0x0100);
    }
}

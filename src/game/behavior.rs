//! The per-unit behavior engine.
//!
//! `update` runs once per unit per tick, before piece animation and script
//! execution. It pumps the build queue and order queue, drives the weapon and
//! factory state machines, resolves navigation into steering, applies
//! steering to rotation/speed/position, and evaluates ground/air transitions.

use crate::game::angle::{self, SimAngle};
use crate::game::behavior_util::{
    are_closer_than, arrive, compute_heading_and_pitch,
    compute_line_of_sight_heading_and_pitch, compute_new_air_unit_velocity,
    compute_new_ground_unit_speed, find_landing_location, get_target_altitude, seek,
};
use crate::game::cob::{run_cob_query, run_unit_cob_scripts};
use crate::game::definitions::{ProjectilePhysicsType, UnitDefinition};
use crate::game::events::GameEvent;
use crate::game::math::{rotate_direction_xz, SimScalar, SimVector};
use crate::game::pathfinding::{find_closest_point_to_footprint_xz, has_reached_goal};
use crate::game::player::{Energy, Metal};
use crate::game::simulation::{gravity_per_tick, GameSimulation};
use crate::game::unit::{
    AirMovementState, AttackTarget, FactoryBehaviorState, MovingStateGoal, NavigationGoal,
    NavigationStateInfo, SteeringInfo, UnitBehaviorState, UnitCreationStatus, UnitFireOrders,
    UnitId, UnitOrder, UnitPhysicsInfo, UnitPhysicsInfoGround, UnitState, UnitWeaponState,
    WeaponAttackInfo,
};
use crate::game::{delta_seconds_to_ticks, GameTime, SimError};

use std::sync::Arc;

fn get_aim_script_name(weapon_index: usize) -> &'static str {
    ["AimPrimary", "AimSecondary", "AimTertiary"][weapon_index]
}

fn get_aim_from_script_name(weapon_index: usize) -> &'static str {
    ["AimFromPrimary", "AimFromSecondary", "AimFromTertiary"][weapon_index]
}

fn get_query_script_name(weapon_index: usize) -> &'static str {
    ["QueryPrimary", "QuerySecondary", "QueryTertiary"][weapon_index]
}

fn get_fire_script_name(weapon_index: usize) -> &'static str {
    ["FirePrimary", "FireSecondary", "FireTertiary"][weapon_index]
}

/// Runs a unit's creation-time scripts and measures weapon geometry.
pub fn on_create(sim: &mut GameSimulation, unit_id: UnitId) -> Result<(), SimError> {
    let definition = {
        let unit = sim.get_unit(unit_id)?;
        sim.get_unit_definition(&unit.unit_type)?
    };

    sim.get_unit_mut(unit_id)?
        .cob_env
        .create_thread("Create", Vec::new());

    // Metal extractors are told how rich their patch is.
    if definition.extracts_metal != Metal::ZERO {
        let position = sim.get_unit(unit_id)?.position;
        let footprint =
            sim.compute_footprint_region_for(position, &definition.movement_collision_info);
        let region = sim.metal_grid.clip_region(footprint);
        let metal_value = sim
            .metal_grid
            .accumulate(region, 0u32, |acc, v| acc + *v as u32);
        sim.get_unit_mut(unit_id)?
            .cob_env
            .create_thread("SetSpeed", vec![metal_value as i32]);
    }

    run_unit_cob_scripts(sim, unit_id)?;

    // Measure firing-point depth for the ballistic solver.
    for weapon_index in 0..3 {
        if sim.get_unit(unit_id)?.weapons[weapon_index].is_none() {
            continue;
        }
        let aiming = get_local_aiming_point(sim, unit_id, weapon_index)?;
        let firing = get_local_firing_point(sim, unit_id, weapon_index)?;
        if let Some(weapon) = &mut sim.get_unit_mut(unit_id)?.weapons[weapon_index] {
            weapon.ballistic_z_offset = firing.z - aiming.z;
        }
    }

    Ok(())
}

/// The per-tick behavior pipeline for one unit.
pub fn update(sim: &mut GameSimulation, unit_id: UnitId) -> Result<(), SimError> {
    let definition = match sim.units.get(unit_id) {
        Some(unit) => sim.get_unit_definition(&unit.unit_type)?,
        None => return Ok(()),
    };

    // Clear transient steering and navigation targets.
    {
        let unit = sim.get_unit_mut(unit_id)?;
        let rotation = unit.rotation;
        let position = unit.position;
        match &mut unit.physics {
            UnitPhysicsInfo::Ground(ground) => {
                ground.steering = SteeringInfo {
                    target_angle: rotation,
                    target_speed: SimScalar::ZERO,
                    should_take_off: false,
                };
            }
            UnitPhysicsInfo::Air(AirMovementState::Flying {
                target_position, ..
            }) => {
                *target_position = Some(position);
            }
            UnitPhysicsInfo::Air(_) => {}
        }
        unit.navigation_state.desired_destination = None;
    }

    let being_built = {
        let unit = sim.get_unit(unit_id)?;
        unit.is_being_built(&definition)
    };

    if !being_built {
        // Build-queue pump (factories).
        let queue_front = sim
            .get_unit(unit_id)?
            .build_queue
            .front()
            .map(|(t, _)| t.clone());
        match queue_front {
            Some(build_type) => {
                if handle_build(sim, unit_id, &definition, &build_type)? {
                    let unit = sim.get_unit_mut(unit_id)?;
                    if let Some(entry) = unit.build_queue.front_mut() {
                        if entry.1 > 1 {
                            entry.1 -= 1;
                        } else {
                            unit.build_queue.pop_front();
                        }
                    }
                }
            }
            None => clear_build(sim, unit_id)?,
        }

        // Order pump.
        let current_order = sim.get_unit(unit_id)?.orders.front().cloned();
        if let Some(order) = current_order {
            if handle_order(sim, unit_id, &definition, &order)? {
                let unit = sim.get_unit_mut(unit_id)?;
                unit.orders.pop_front();
                unit.build_order_unit_id = None;
            }
        } else {
            let is_flying_idle = matches!(
                sim.get_unit(unit_id)?.physics,
                UnitPhysicsInfo::Air(AirMovementState::Flying { .. })
            );
            if is_flying_idle {
                if navigate_to(sim, unit_id, NavigationGoal::LandingLocation)? {
                    if let UnitPhysicsInfo::Air(AirMovementState::Flying {
                        should_land, ..
                    }) = &mut sim.get_unit_mut(unit_id)?.physics
                    {
                        *should_land = true;
                    }
                }
            } else if !matches!(
                sim.get_unit(unit_id)?.physics,
                UnitPhysicsInfo::Air(_)
            ) {
                change_state(sim, unit_id, UnitBehaviorState::Idle)?;
            }
        }

        for weapon_index in 0..3 {
            update_weapon(sim, unit_id, weapon_index)?;
        }
    }

    if definition.is_mobile {
        update_navigation(sim, unit_id, &definition)?;

        apply_unit_steering(sim, unit_id, &definition)?;

        let previously_was_moving = {
            let unit = sim.get_unit(unit_id)?;
            !are_closer_than(unit.previous_position, unit.position, SimScalar::from_num(0.1))
        };

        update_unit_position(sim, unit_id, &definition)?;

        let currently_is_moving = {
            let unit = sim.get_unit(unit_id)?;
            !are_closer_than(unit.previous_position, unit.position, SimScalar::from_num(0.1))
        };

        if currently_is_moving && !previously_was_moving {
            sim.get_unit_mut(unit_id)?
                .cob_env
                .create_thread("StartMoving", Vec::new());
        } else if !currently_is_moving && previously_was_moving {
            sim.get_unit_mut(unit_id)?
                .cob_env
                .create_thread("StopMoving", Vec::new());
        }

        update_physics_transitions(sim, unit_id, &definition)?;
    }

    Ok(())
}

// ============================================================================
// Navigation
// ============================================================================

/// Declares the unit's destination for this tick and reports whether the
/// unit has already reached it.
fn navigate_to(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    goal: NavigationGoal,
) -> Result<bool, SimError> {
    let unit = sim.get_unit_mut(unit_id)?;
    unit.navigation_state.desired_destination = Some(goal);
    let position = unit.position;

    let reached = match &goal {
        NavigationGoal::Goal(g) => has_reached_goal(sim, position, g),
        NavigationGoal::LandingLocation => {
            match &sim.get_unit(unit_id)?.navigation_state.state {
                NavigationStateInfo::MovingToLandingSpot { landing_location } => {
                    are_closer_than(
                        position.xz(),
                        landing_location.xz(),
                        SimScalar::from_num(8),
                    )
                }
                _ => false,
            }
        }
    };
    Ok(reached)
}

/// Resolves the desired destination into concrete movement for this tick.
fn update_navigation(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<(), SimError> {
    let goal = sim.get_unit(unit_id)?.navigation_state.desired_destination;

    let Some(goal) = goal else {
        sim.get_unit_mut(unit_id)?.navigation_state.state = NavigationStateInfo::Idle;
        return Ok(());
    };

    let resolved = match goal {
        NavigationGoal::LandingLocation => {
            let existing = match &sim.get_unit(unit_id)?.navigation_state.state {
                NavigationStateInfo::MovingToLandingSpot { landing_location } => {
                    Some(*landing_location)
                }
                _ => None,
            };
            match existing {
                Some(location) => Some(MovingStateGoal::Position(location)),
                None => match find_landing_location(sim, unit_id) {
                    Some(location) => {
                        sim.get_unit_mut(unit_id)?.navigation_state.state =
                            NavigationStateInfo::MovingToLandingSpot {
                                landing_location: location,
                            };
                        Some(MovingStateGoal::Position(location))
                    }
                    None => None,
                },
            }
        }
        NavigationGoal::Goal(g) => Some(g),
    };

    match resolved {
        Some(goal) => {
            move_to(sim, unit_id, definition, goal)?;
        }
        None => {
            sim.get_unit_mut(unit_id)?.navigation_state.state = NavigationStateInfo::Idle;
        }
    }
    Ok(())
}

fn move_to(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    goal: MovingStateGoal,
) -> Result<bool, SimError> {
    if definition.can_fly {
        flying_unit_move_to(sim, unit_id, definition, goal)
    } else {
        ground_unit_move_to(sim, unit_id, definition, goal)
    }
}

fn ground_unit_move_to(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    goal: MovingStateGoal,
) -> Result<bool, SimError> {
    let needs_new_state = match &sim.get_unit(unit_id)?.navigation_state.state {
        NavigationStateInfo::Moving { destination, .. } => *destination != goal,
        _ => true,
    };
    if needs_new_state {
        sim.get_unit_mut(unit_id)?.navigation_state.state = NavigationStateInfo::Moving {
            destination: goal,
            path: None,
            path_requested: true,
        };
        sim.request_path(unit_id);
        return Ok(false);
    }

    // A collision invalidates the current path once it has had time to age.
    let should_re_request = {
        let unit = sim.get_unit(unit_id)?;
        let in_collision = unit.in_collision;
        match &unit.navigation_state.state {
            NavigationStateInfo::Moving {
                path,
                path_requested,
                ..
            } if in_collision && !path_requested => match path {
                None => true,
                Some(p) => sim.game_time - p.path_creation_time >= 30,
            },
            _ => false,
        }
    };
    if should_re_request {
        sim.request_path(unit_id);
        if let NavigationStateInfo::Moving { path_requested, .. } =
            &mut sim.get_unit_mut(unit_id)?.navigation_state.state
        {
            *path_requested = true;
        }
    }

    let has_path = matches!(
        &sim.get_unit(unit_id)?.navigation_state.state,
        NavigationStateInfo::Moving { path: Some(_), .. }
    );

    if has_path {
        if follow_path(sim, unit_id, definition)? {
            // The path is spent; close the remaining distance directly.
            if let NavigationStateInfo::Moving { path, .. } =
                &mut sim.get_unit_mut(unit_id)?.navigation_state.state
            {
                *path = None;
            }
            return Ok(true);
        }
    } else {
        // No path (yet, or any more): approach the goal directly when close.
        let (position, destination) = {
            let unit = sim.get_unit(unit_id)?;
            let dest = resolve_goal_destination(sim, unit.position, &goal);
            (unit.position, dest)
        };
        if are_closer_than(position.xz(), destination.xz(), SimScalar::from_num(16)) {
            let steering = {
                let unit = sim.get_unit(unit_id)?;
                match &unit.physics {
                    UnitPhysicsInfo::Ground(ground) => {
                        Some(arrive(unit, definition, ground, destination))
                    }
                    _ => None,
                }
            };
            if let Some(steering) = steering {
                set_ground_steering(sim, unit_id, steering)?;
            }
        }
    }

    Ok(false)
}

fn resolve_goal_destination(
    sim: &GameSimulation,
    position: SimVector,
    goal: &MovingStateGoal,
) -> SimVector {
    match goal {
        MovingStateGoal::Position(v) => *v,
        MovingStateGoal::Rect(rect) => find_closest_point_to_footprint_xz(sim, *rect, position),
    }
}

/// Advances along the current path. Returns true when the final waypoint has
/// been reached.
fn follow_path(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<bool, SimError> {
    let (steering, advance, complete) = {
        let unit = sim.get_unit(unit_id)?;
        let NavigationStateInfo::Moving {
            path: Some(info), ..
        } = &unit.navigation_state.state
        else {
            return Ok(false);
        };

        let destination = info.path.waypoints[info.current_waypoint];
        let distance_squared = unit
            .position
            .xz()
            .distance_squared(destination.xz());
        let is_final = info.current_waypoint + 1 == info.path.waypoints.len();

        if is_final {
            if distance_squared < SimScalar::from_num(8 * 8) {
                (None, false, true)
            } else {
                let UnitPhysicsInfo::Ground(ground) = &unit.physics else {
                    return Ok(false);
                };
                (
                    Some(arrive(unit, definition, ground, destination)),
                    false,
                    false,
                )
            }
        } else if distance_squared < SimScalar::from_num(16 * 16) {
            (None, true, false)
        } else {
            (Some(seek(unit, definition, destination)), false, false)
        }
    };

    if let Some(steering) = steering {
        set_ground_steering(sim, unit_id, steering)?;
    }
    if advance {
        if let NavigationStateInfo::Moving {
            path: Some(info), ..
        } = &mut sim.get_unit_mut(unit_id)?.navigation_state.state
        {
            info.current_waypoint += 1;
        }
    }
    Ok(complete)
}

fn set_ground_steering(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    steering: SteeringInfo,
) -> Result<(), SimError> {
    if let UnitPhysicsInfo::Ground(ground) = &mut sim.get_unit_mut(unit_id)?.physics {
        ground.steering = steering;
    }
    Ok(())
}

fn flying_unit_move_to(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    goal: MovingStateGoal,
) -> Result<bool, SimError> {
    let is_ground = matches!(sim.get_unit(unit_id)?.physics, UnitPhysicsInfo::Ground(_));
    if is_ground {
        if let UnitPhysicsInfo::Ground(ground) = &mut sim.get_unit_mut(unit_id)?.physics {
            ground.steering.should_take_off = true;
        }
        return Ok(false);
    }
    fly_towards_goal(sim, unit_id, definition, goal)
}

fn fly_towards_goal(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    goal: MovingStateGoal,
) -> Result<bool, SimError> {
    let (position, destination) = {
        let unit = sim.get_unit(unit_id)?;
        let destination = resolve_goal_destination(sim, unit.position, &goal);
        (unit.position, destination)
    };

    if are_closer_than(position.xz(), destination.xz(), SimScalar::from_num(8)) {
        return Ok(true);
    }

    let target_height =
        get_target_altitude(&sim.terrain, destination.x, destination.z, definition);
    let destination_at_altitude = SimVector::new(destination.x, target_height, destination.z);

    match &mut sim.get_unit_mut(unit_id)?.physics {
        UnitPhysicsInfo::Air(AirMovementState::Flying {
            target_position, ..
        }) => {
            *target_position = Some(destination_at_altitude);
        }
        UnitPhysicsInfo::Air(AirMovementState::Landing { should_abort, .. }) => {
            *should_abort = true;
        }
        _ => {}
    }
    Ok(false)
}

// ============================================================================
// Orders
// ============================================================================

fn handle_order(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    order: &UnitOrder,
) -> Result<bool, SimError> {
    match order {
        UnitOrder::Move(destination) => handle_move_order(sim, unit_id, definition, *destination),
        UnitOrder::Attack(target) => attack_target(sim, unit_id, definition, target),
        UnitOrder::Build {
            unit_type,
            position,
        } => build_unit(sim, unit_id, definition, unit_type, *position),
        UnitOrder::BuggerOff(rect) => {
            let (fx, fz) = sim.get_footprint_xz(&definition.movement_collision_info);
            let expanded = rect.expand(fx as i32 * 3 - 4, fz as i32 * 3 - 4);
            navigate_to(sim, unit_id, expanded.into())
        }
        UnitOrder::CompleteBuild(target) => build_existing_unit(sim, unit_id, definition, *target),
        UnitOrder::Guard(target) => handle_guard_order(sim, unit_id, definition, *target),
    }
}

fn handle_move_order(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    destination: SimVector,
) -> Result<bool, SimError> {
    if !definition.is_mobile {
        return Ok(false);
    }
    if navigate_to(sim, unit_id, destination.into())? {
        sim.events.push(GameEvent::UnitArrived { unit_id });
        return Ok(true);
    }
    Ok(false)
}

fn get_target_position(
    sim: &mut GameSimulation,
    target: &AttackTarget,
) -> Result<Option<SimVector>, SimError> {
    match target {
        AttackTarget::Ground(v) => Ok(Some(*v)),
        AttackTarget::Unit(unit_id) => try_get_sweet_spot(sim, *unit_id),
    }
}

fn attack_target(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    _definition: &Arc<UnitDefinition>,
    target: &AttackTarget,
) -> Result<bool, SimError> {
    let weapon_type = match &sim.get_unit(unit_id)?.weapons[0] {
        Some(weapon) => weapon.weapon_type.clone(),
        // No weapon, nothing to do with this order.
        None => return Ok(true),
    };
    let weapon_definition = sim.get_weapon_definition(&weapon_type)?;

    let Some(target_position) = get_target_position(sim, target)? else {
        // Target has gone away; throw away this order.
        return Ok(true);
    };

    let position = sim.get_unit(unit_id)?.position;
    let max_range_squared = weapon_definition.max_range * weapon_definition.max_range;
    if position.distance_squared(target_position) > max_range_squared {
        navigate_to(sim, unit_id, target_position.into())?;
    } else {
        let unit = sim.get_unit_mut(unit_id)?;
        for weapon_index in 0..2 {
            unit.set_weapon_target(weapon_index, *target);
        }
    }

    Ok(false)
}

fn handle_guard_order(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    target_id: UnitId,
) -> Result<bool, SimError> {
    let owner = sim.get_unit(unit_id)?.owner;
    let target_info = sim.units.get(target_id).map(|t| {
        (
            t.is_owned_by(owner),
            t.position,
            match &t.behavior_state {
                UnitBehaviorState::Building { target_unit, .. } => Some(*target_unit),
                _ => None,
            },
            match &t.factory_state {
                FactoryBehaviorState::Building {
                    target_unit: Some((id, _)),
                } => Some(*id),
                _ => None,
            },
        )
    });

    let Some((friendly, target_position, assisting_build, assisting_factory)) = target_info else {
        // Target is dead; abandon the order.
        return Ok(true);
    };
    if !friendly {
        return Ok(true);
    }

    if definition.builder {
        if let Some(build_target) = assisting_build {
            build_existing_unit(sim, unit_id, definition, build_target)?;
            return Ok(false);
        }
        if let Some(factory_target) = assisting_factory {
            build_existing_unit(sim, unit_id, definition, factory_target)?;
            return Ok(false);
        }
    }

    // Stay close.
    let position = sim.get_unit(unit_id)?.position;
    if definition.can_move
        && position.distance_squared(target_position) > SimScalar::from_num(200 * 200)
    {
        navigate_to(sim, unit_id, target_position.into())?;
    }
    Ok(false)
}

// ============================================================================
// Building (mobile builders)
// ============================================================================

fn create_new_unit(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    _definition: &Arc<UnitDefinition>,
    unit_type: &str,
    position: SimVector,
) -> Result<UnitCreationStatus, SimError> {
    if let UnitBehaviorState::CreatingUnit {
        unit_type: pending_type,
        position: pending_position,
        status,
        ..
    } = &sim.get_unit(unit_id)?.behavior_state
    {
        if pending_type == unit_type && *pending_position == position {
            return Ok(*status);
        }
    }

    let target_definition = sim.get_unit_definition(&unit_type.to_uppercase())?;
    let footprint =
        sim.compute_footprint_region_for(position, &target_definition.movement_collision_info);
    if navigate_to(sim, unit_id, footprint.into())? {
        let owner = sim.get_unit(unit_id)?.owner;
        change_state(
            sim,
            unit_id,
            UnitBehaviorState::CreatingUnit {
                unit_type: unit_type.to_uppercase(),
                owner,
                position,
                status: UnitCreationStatus::Pending,
            },
        )?;
        sim.unit_creation_requests.push_back(unit_id);
    }

    Ok(UnitCreationStatus::Pending)
}

fn build_unit(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    unit_type: &str,
    position: SimVector,
) -> Result<bool, SimError> {
    let build_order_unit = sim.get_unit(unit_id)?.build_order_unit_id;
    let Some(target_id) = build_order_unit else {
        return match create_new_unit(sim, unit_id, definition, unit_type, position)? {
            UnitCreationStatus::Pending => Ok(false),
            UnitCreationStatus::Failed => Ok(true),
            UnitCreationStatus::Done { unit_id: new_id } => {
                sim.get_unit_mut(unit_id)?.build_order_unit_id = Some(new_id);
                deploy_build_arm(sim, unit_id, definition, new_id)
            }
        };
    };

    deploy_build_arm(sim, unit_id, definition, target_id)
}

fn build_existing_unit(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    target_id: UnitId,
) -> Result<bool, SimError> {
    let target_viable = match sim.units.get(target_id) {
        Some(target) => {
            let target_definition = sim.get_unit_definition(&target.unit_type)?;
            !target.is_dead() && target.is_being_built(&target_definition)
        }
        None => false,
    };
    if !target_viable {
        change_state(sim, unit_id, UnitBehaviorState::Idle)?;
        return Ok(true);
    }

    let position = sim.get_unit(unit_id)?.position;
    let target_position = sim.get_unit(target_id)?.position;
    let build_distance_squared = definition.build_distance * definition.build_distance;
    if position.distance_squared(target_position) > build_distance_squared {
        navigate_to(sim, unit_id, target_position.into())?;
        return Ok(false);
    }

    deploy_build_arm(sim, unit_id, definition, target_id)
}

fn deploy_build_arm(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    target_id: UnitId,
) -> Result<bool, SimError> {
    let target_state = sim.units.get(target_id).map(|t| {
        (
            t.unit_type.clone(),
            t.position,
            t.is_dead(),
        )
    });
    let Some((target_type, target_position, target_dead)) = target_state else {
        change_state(sim, unit_id, UnitBehaviorState::Idle)?;
        return Ok(true);
    };
    let target_definition = sim.get_unit_definition(&target_type)?;
    if target_dead || !sim.get_unit(target_id)?.is_being_built(&target_definition) {
        change_state(sim, unit_id, UnitBehaviorState::Idle)?;
        return Ok(true);
    }

    let building_target = match &sim.get_unit(unit_id)?.behavior_state {
        UnitBehaviorState::Building { target_unit, .. } => Some(*target_unit),
        _ => None,
    };

    match building_target {
        Some(current_target) => {
            if current_target != target_id {
                change_state(sim, unit_id, UnitBehaviorState::Idle)?;
                return build_existing_unit(sim, unit_id, definition, target_id);
            }

            if !sim.get_unit(unit_id)?.in_build_stance {
                // Not yet in the stance to build; wait.
                return Ok(false);
            }

            let costs = sim
                .get_unit(target_id)?
                .get_build_cost_info(&target_definition, definition.worker_time_per_tick);
            let apparent = amortised_build_cost(&target_definition, definition.worker_time_per_tick);
            let got_resources = sim.add_resource_delta_split(
                unit_id,
                -apparent.0,
                -apparent.1,
                -costs.energy_cost,
                -costs.metal_cost,
            )?;

            if !got_resources {
                if let UnitBehaviorState::Building {
                    nano_particle_origin,
                    ..
                } = &mut sim.get_unit_mut(unit_id)?.behavior_state
                {
                    *nano_particle_origin = None;
                }
                return Ok(false);
            }

            let nano = get_nano_point(sim, unit_id)?;
            if let UnitBehaviorState::Building {
                nano_particle_origin,
                ..
            } = &mut sim.get_unit_mut(unit_id)?.behavior_state
            {
                *nano_particle_origin = Some(nano);
            }

            let complete = sim
                .get_unit_mut(target_id)?
                .add_build_progress(&target_definition, definition.worker_time_per_tick);
            if complete {
                sim.events.push(GameEvent::UnitComplete { unit_id: target_id });
                if target_definition.activate_when_built {
                    sim.activate_unit(target_id);
                }
                change_state(sim, unit_id, UnitBehaviorState::Idle)?;
                return Ok(true);
            }
            Ok(false)
        }
        None => {
            let rotation = sim.get_unit(unit_id)?.rotation;
            let nano = get_nano_point(sim, unit_id)?;
            let (heading, pitch) =
                compute_line_of_sight_heading_and_pitch(rotation, nano, target_position);

            change_state(
                sim,
                unit_id,
                UnitBehaviorState::Building {
                    target_unit: target_id,
                    nano_particle_origin: None,
                },
            )?;
            sim.get_unit_mut(unit_id)?.cob_env.create_thread(
                "StartBuilding",
                vec![
                    heading.to_ta_angle().value,
                    pitch.to_ta_angle().value,
                ],
            );
            Ok(false)
        }
    }
}

/// Leaving the `Building` state always stops the nanolathe script.
fn change_state(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    new_state: UnitBehaviorState,
) -> Result<(), SimError> {
    let unit = sim.get_unit_mut(unit_id)?;
    if matches!(unit.behavior_state, UnitBehaviorState::Building { .. }) {
        unit.cob_env.create_thread("StopBuilding", Vec::new());
    }
    unit.behavior_state = new_state;
    Ok(())
}

/// Per-tick share of the target's total cost, by worker time.
fn amortised_build_cost(
    target_definition: &Arc<UnitDefinition>,
    worker_time_per_tick: u32,
) -> (Energy, Metal) {
    let factor = SimScalar::from_num(worker_time_per_tick)
        / SimScalar::from_num(target_definition.build_time);
    (
        Energy(target_definition.build_cost_energy.0 * factor),
        Metal(target_definition.build_cost_metal.0 * factor),
    )
}

// ============================================================================
// Factory behavior
// ============================================================================

fn handle_build(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    unit_type: &str,
) -> Result<bool, SimError> {
    let state = std::mem::take(&mut sim.get_unit_mut(unit_id)?.factory_state);
    match state {
        FactoryBehaviorState::Idle => {
            sim.activate_unit(unit_id);
            sim.get_unit_mut(unit_id)?.factory_state =
                FactoryBehaviorState::Building { target_unit: None };
            Ok(false)
        }
        FactoryBehaviorState::CreatingUnit {
            unit_type: pending_type,
            owner,
            position,
            rotation,
            status,
        } => match status {
            UnitCreationStatus::Pending => {
                sim.get_unit_mut(unit_id)?.factory_state = FactoryBehaviorState::CreatingUnit {
                    unit_type: pending_type,
                    owner,
                    position,
                    rotation,
                    status,
                };
                Ok(false)
            }
            UnitCreationStatus::Done { unit_id: new_id } => {
                let factory = sim.get_unit_mut(unit_id)?;
                factory.cob_env.create_thread("StartBuilding", Vec::new());
                factory.factory_state = FactoryBehaviorState::Building {
                    target_unit: Some((new_id, None)),
                };
                Ok(false)
            }
            UnitCreationStatus::Failed => {
                sim.get_unit_mut(unit_id)?.factory_state =
                    FactoryBehaviorState::Building { target_unit: None };
                Ok(false)
            }
        },
        FactoryBehaviorState::Building { target_unit } => {
            // Restore before the early-outs below.
            sim.get_unit_mut(unit_id)?.factory_state =
                FactoryBehaviorState::Building { target_unit };
            factory_build_step(sim, unit_id, definition, unit_type, target_unit)
        }
    }
}

fn factory_build_step(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    unit_type: &str,
    target_unit: Option<(UnitId, Option<SimVector>)>,
) -> Result<bool, SimError> {
    if !sim.get_unit(unit_id)?.in_build_stance {
        return Ok(false);
    }

    let build_piece = get_build_piece_info(sim, unit_id)?;

    let Some((target_id, _)) = target_unit else {
        let owner = sim.get_unit(unit_id)?.owner;
        sim.get_unit_mut(unit_id)?.factory_state = FactoryBehaviorState::CreatingUnit {
            unit_type: unit_type.to_uppercase(),
            owner,
            position: build_piece.position,
            rotation: build_piece.rotation,
            status: UnitCreationStatus::Pending,
        };
        sim.unit_creation_requests.push_back(unit_id);
        return Ok(false);
    };

    if !sim.unit_exists(target_id) {
        let owner = sim.get_unit(unit_id)?.owner;
        sim.get_unit_mut(unit_id)?.factory_state = FactoryBehaviorState::CreatingUnit {
            unit_type: unit_type.to_uppercase(),
            owner,
            position: build_piece.position,
            rotation: build_piece.rotation,
            status: UnitCreationStatus::Pending,
        };
        sim.unit_creation_requests.push_back(unit_id);
        return Ok(false);
    }

    let (target_type, target_dead) = {
        let target = sim.get_unit(target_id)?;
        (target.unit_type.clone(), target.is_dead())
    };
    let target_definition = sim.get_unit_definition(&target_type)?;

    if target_type != unit_type.to_uppercase() {
        // The queue changed under us; scrap the frame and start over.
        let target_being_built = sim.get_unit(target_id)?.is_being_built(&target_definition);
        if target_being_built && !target_dead {
            sim.quietly_kill_unit(target_id);
        }
        sim.get_unit_mut(unit_id)?.factory_state =
            FactoryBehaviorState::Building { target_unit: None };
        return Ok(false);
    }

    if target_dead {
        sim.get_unit_mut(unit_id)?
            .cob_env
            .create_thread("StopBuilding", Vec::new());
        sim.deactivate_unit(unit_id);
        sim.get_unit_mut(unit_id)?.factory_state = FactoryBehaviorState::Idle;
        return Ok(true);
    }

    if !sim.get_unit(target_id)?.is_being_built(&target_definition) {
        // Finished: hand over orders and release the pad.
        let factory_orders = sim.get_unit(unit_id)?.orders.clone();
        if factory_orders.is_empty() {
            let position = sim.get_unit(unit_id)?.position;
            let footprint =
                sim.compute_footprint_region_for(position, &definition.movement_collision_info);
            sim.tell_to_bugger_off(target_id, footprint);
        } else {
            sim.get_unit_mut(target_id)?.replace_orders(factory_orders);
        }
        sim.get_unit_mut(unit_id)?
            .cob_env
            .create_thread("StopBuilding", Vec::new());
        sim.deactivate_unit(unit_id);
        sim.get_unit_mut(unit_id)?.factory_state = FactoryBehaviorState::Idle;
        return Ok(true);
    }

    // The frame rides the build platform.
    let mut pad_position = build_piece.position;
    if target_definition.floater || target_definition.can_hover {
        pad_position.y = pad_position.y.max(sim.terrain.get_sea_level());
    }
    try_apply_movement_to_position(sim, target_id, &target_definition, pad_position)?;
    sim.get_unit_mut(target_id)?.rotation = build_piece.rotation;

    let costs = sim
        .get_unit(target_id)?
        .get_build_cost_info(&target_definition, definition.worker_time_per_tick);
    let apparent = amortised_build_cost(&target_definition, definition.worker_time_per_tick);
    let got_resources = sim.add_resource_delta_split(
        unit_id,
        -apparent.0,
        -apparent.1,
        -costs.energy_cost,
        -costs.metal_cost,
    )?;

    if !got_resources {
        if let FactoryBehaviorState::Building {
            target_unit: Some((_, nano)),
        } = &mut sim.get_unit_mut(unit_id)?.factory_state
        {
            *nano = None;
        }
        return Ok(false);
    }

    let nano_point = get_nano_point(sim, unit_id)?;
    if let FactoryBehaviorState::Building {
        target_unit: Some((_, nano)),
    } = &mut sim.get_unit_mut(unit_id)?.factory_state
    {
        *nano = Some(nano_point);
    }

    let complete = sim
        .get_unit_mut(target_id)?
        .add_build_progress(&target_definition, definition.worker_time_per_tick);
    if complete {
        sim.events.push(GameEvent::UnitComplete { unit_id: target_id });
        if target_definition.activate_when_built {
            sim.activate_unit(target_id);
        }
    }

    Ok(false)
}

fn clear_build(sim: &mut GameSimulation, unit_id: UnitId) -> Result<(), SimError> {
    let state = std::mem::take(&mut sim.get_unit_mut(unit_id)?.factory_state);
    match state {
        FactoryBehaviorState::Idle => {}
        FactoryBehaviorState::CreatingUnit { status, .. } => {
            if let UnitCreationStatus::Done { unit_id: new_id } = status {
                sim.quietly_kill_unit(new_id);
            }
            sim.deactivate_unit(unit_id);
        }
        FactoryBehaviorState::Building { target_unit } => {
            if let Some((target_id, _)) = target_unit {
                sim.quietly_kill_unit(target_id);
                sim.get_unit_mut(unit_id)?
                    .cob_env
                    .create_thread("StopBuilding", Vec::new());
            }
            sim.deactivate_unit(unit_id);
        }
    }
    Ok(())
}

// ============================================================================
// Weapons
// ============================================================================

fn update_weapon(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    weapon_index: usize,
) -> Result<(), SimError> {
    let weapon_snapshot = match &sim.get_unit(unit_id)?.weapons[weapon_index] {
        Some(weapon) => (weapon.weapon_type.clone(), weapon.state),
        None => return Ok(()),
    };
    let (weapon_type, weapon_state) = weapon_snapshot;
    let weapon_definition = sim.get_weapon_definition(&weapon_type)?;

    match weapon_state {
        UnitWeaponState::Idle => {
            // Attempt to acquire a target. First hostile in unit-map order
            // wins; the scan is not range-sorted.
            let (owner, position, fire_orders) = {
                let unit = sim.get_unit(unit_id)?;
                (unit.owner, unit.position, unit.fire_orders)
            };
            if !weapon_definition.command_fire && fire_orders == UnitFireOrders::FireAtWill {
                let max_range_squared =
                    weapon_definition.max_range * weapon_definition.max_range;
                let mut target = None;
                for (other_id, other) in sim.units.iter() {
                    if other.is_dead() || other.is_owned_by(owner) {
                        continue;
                    }
                    if position.distance_squared(other.position) > max_range_squared {
                        continue;
                    }
                    target = Some(other_id);
                    break;
                }
                if let Some(target) = target {
                    if let Some(weapon) = &mut sim.get_unit_mut(unit_id)?.weapons[weapon_index] {
                        weapon.state = UnitWeaponState::Attacking {
                            target: AttackTarget::Unit(target),
                            attack_info: WeaponAttackInfo::Idle,
                        };
                    }
                }
            }
            Ok(())
        }
        UnitWeaponState::Attacking {
            target,
            attack_info,
        } => {
            if matches!(attack_info, WeaponAttackInfo::Fire { .. }) {
                return try_fire_weapon(sim, unit_id, weapon_index);
            }

            // Outside fire-at-will, a self-acquired unit target is dropped
            // unless an explicit attack order names it.
            let fire_orders = sim.get_unit(unit_id)?.fire_orders;
            if fire_orders != UnitFireOrders::FireAtWill {
                if let AttackTarget::Unit(target_unit) = target {
                    let explicit = match sim.get_unit(unit_id)?.orders.front() {
                        Some(UnitOrder::Attack(AttackTarget::Unit(ordered))) => {
                            *ordered == target_unit
                        }
                        _ => false,
                    };
                    if !explicit {
                        sim.get_unit_mut(unit_id)?.clear_weapon_target(weapon_index);
                        return Ok(());
                    }
                }
            }

            let target_position = get_target_position(sim, &target)?;
            let (position, rotation) = {
                let unit = sim.get_unit(unit_id)?;
                (unit.position, unit.rotation)
            };

            let max_range_squared = weapon_definition.max_range * weapon_definition.max_range;
            let Some(target_position) = target_position.filter(|t| {
                position.distance_squared(*t) <= max_range_squared
            }) else {
                sim.get_unit_mut(unit_id)?.clear_weapon_target(weapon_index);
                return Ok(());
            };

            match attack_info {
                WeaponAttackInfo::Idle => {
                    let aim_from = get_aiming_point(sim, unit_id, weapon_index)?;
                    let ballistic_z_offset = sim.get_unit(unit_id)?.weapons[weapon_index]
                        .as_ref()
                        .map(|w| w.ballistic_z_offset)
                        .unwrap_or(SimScalar::ZERO);
                    let (heading, pitch) = compute_heading_and_pitch(
                        rotation,
                        aim_from,
                        target_position,
                        weapon_definition.velocity,
                        gravity_per_tick(),
                        ballistic_z_offset,
                        &weapon_definition.physics_type,
                    );

                    let thread = sim.get_unit_mut(unit_id)?.cob_env.create_thread(
                        get_aim_script_name(weapon_index),
                        vec![
                            heading.to_ta_angle().value,
                            pitch.to_ta_angle().value,
                        ],
                    );

                    let new_info = match thread {
                        Some(thread) => WeaponAttackInfo::Aim {
                            thread,
                            last_heading: heading,
                            last_pitch: pitch,
                        },
                        // No aim script: go straight to firing.
                        None => WeaponAttackInfo::Fire {
                            heading,
                            pitch,
                            target_position,
                            firing_piece: None,
                            bursts_fired: 0,
                            ready_time: GameTime::new(0),
                        },
                    };
                    let fire_now = matches!(new_info, WeaponAttackInfo::Fire { .. });
                    set_attack_info(sim, unit_id, weapon_index, new_info)?;
                    if fire_now {
                        try_fire_weapon(sim, unit_id, weapon_index)?;
                    }
                    Ok(())
                }
                WeaponAttackInfo::Aim {
                    thread,
                    last_heading,
                    last_pitch,
                } => {
                    let reaped = sim
                        .get_unit_mut(unit_id)?
                        .cob_env
                        .try_reap_thread(thread);
                    let Some(return_value) = reaped else {
                        return Ok(());
                    };

                    set_attack_info(sim, unit_id, weapon_index, WeaponAttackInfo::Idle)?;

                    if return_value != 0 {
                        // Aiming succeeded; correct for drift, then fire if
                        // the solution is still inside tolerance.
                        let aim_from = get_aiming_point(sim, unit_id, weapon_index)?;
                        let ballistic_z_offset = sim.get_unit(unit_id)?.weapons[weapon_index]
                            .as_ref()
                            .map(|w| w.ballistic_z_offset)
                            .unwrap_or(SimScalar::ZERO);
                        let (heading, pitch) = compute_heading_and_pitch(
                            rotation,
                            aim_from,
                            target_position,
                            weapon_definition.velocity,
                            gravity_per_tick(),
                            ballistic_z_offset,
                            &weapon_definition.physics_type,
                        );
                        if angle::angle_between_is_less_or_equal(
                            heading,
                            last_heading,
                            weapon_definition.tolerance,
                        ) && angle::angle_between_is_less_or_equal(
                            pitch,
                            last_pitch,
                            weapon_definition.pitch_tolerance,
                        ) {
                            set_attack_info(
                                sim,
                                unit_id,
                                weapon_index,
                                WeaponAttackInfo::Fire {
                                    heading,
                                    pitch,
                                    target_position,
                                    firing_piece: None,
                                    bursts_fired: 0,
                                    ready_time: GameTime::new(0),
                                },
                            )?;
                            try_fire_weapon(sim, unit_id, weapon_index)?;
                        }
                    }
                    Ok(())
                }
                WeaponAttackInfo::Fire { .. } => Ok(()),
            }
        }
    }
}

fn set_attack_info(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    weapon_index: usize,
    info: WeaponAttackInfo,
) -> Result<(), SimError> {
    if let Some(weapon) = &mut sim.get_unit_mut(unit_id)?.weapons[weapon_index] {
        if let UnitWeaponState::Attacking { attack_info, .. } = &mut weapon.state {
            *attack_info = info;
        }
    }
    Ok(())
}

/// Perturbs a firing direction by a random angle within the spray cone.
fn change_direction_by_random_angle(
    sim: &mut GameSimulation,
    direction: SimVector,
    max_angle: SimAngle,
) -> SimVector {
    let mut spread = SimAngle::new(sim.rng.next_in_range(0, max_angle.value as u32) as u16);
    if sim.rng.next_bool() {
        spread = -spread;
    }
    rotate_direction_xz(direction, spread)
}

fn try_fire_weapon(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    weapon_index: usize,
) -> Result<(), SimError> {
    let snapshot = match &sim.get_unit(unit_id)?.weapons[weapon_index] {
        Some(weapon) => match weapon.state {
            UnitWeaponState::Attacking {
                target,
                attack_info:
                    WeaponAttackInfo::Fire {
                        heading,
                        pitch,
                        target_position,
                        firing_piece,
                        bursts_fired,
                        ready_time,
                    },
            } => Some((
                weapon.weapon_type.clone(),
                weapon.ready_time,
                target,
                heading,
                pitch,
                target_position,
                firing_piece,
                bursts_fired,
                ready_time,
            )),
            _ => None,
        },
        None => None,
    };
    let Some((
        weapon_type,
        weapon_ready_time,
        target,
        heading,
        pitch,
        target_position,
        firing_piece,
        bursts_fired,
        ready_time,
    )) = snapshot
    else {
        return Ok(());
    };

    let game_time = sim.game_time;

    // Wait for the reload before the first shot of a burst, and for the
    // burst interval between shots.
    if bursts_fired == 0 && game_time < weapon_ready_time {
        return Ok(());
    }
    if game_time < ready_time {
        return Ok(());
    }

    let weapon_definition = sim.get_weapon_definition(&weapon_type)?;

    // Resolve the firing piece on the first shot.
    let firing_piece = match firing_piece {
        Some(piece) => piece,
        None => run_cob_query(sim, unit_id, get_query_script_name(weapon_index))?
            .unwrap_or(0) as usize,
    };

    let (rotation, owner) = {
        let unit = sim.get_unit(unit_id)?;
        (unit.rotation, unit.owner)
    };
    let firing_point = {
        let local = get_piece_local_position(sim, unit_id, firing_piece)?;
        sim.get_unit(unit_id)?.get_transform() * local
    };

    let mut direction = match weapon_definition.physics_type {
        ProjectilePhysicsType::LineOfSight | ProjectilePhysicsType::Tracking { .. } => {
            (target_position - firing_point).normalized()
        }
        ProjectilePhysicsType::Ballistic => {
            pitched_direction(heading + rotation, pitch)
        }
    };

    if weapon_definition.spray_angle != SimAngle::ZERO {
        direction = change_direction_by_random_angle(sim, direction, weapon_definition.spray_angle);
    }

    let target_unit = match target {
        AttackTarget::Unit(id) => Some(id),
        AttackTarget::Ground(_) => None,
    };
    let distance_to_target = (target_position - firing_point).length();
    sim.spawn_projectile(
        owner,
        &weapon_type,
        firing_point,
        direction,
        distance_to_target,
        target_unit,
    )?;

    sim.events.push(GameEvent::FireWeapon {
        weapon_type: weapon_type.clone(),
        shot_number: bursts_fired,
        fire_point: firing_point,
    });

    // Starting the burst also starts the reload clock.
    if bursts_fired == 0 {
        sim.get_unit_mut(unit_id)?
            .cob_env
            .create_thread(get_fire_script_name(weapon_index), Vec::new());
        let reload_ticks = delta_seconds_to_ticks(weapon_definition.reload_time);
        if let Some(weapon) = &mut sim.get_unit_mut(unit_id)?.weapons[weapon_index] {
            weapon.ready_time = game_time + reload_ticks;
        }
    }

    let new_bursts = bursts_fired + 1;
    let new_info = if new_bursts >= weapon_definition.burst {
        // Burst complete, reloading now.
        WeaponAttackInfo::Idle
    } else {
        WeaponAttackInfo::Fire {
            heading,
            pitch,
            target_position,
            firing_piece: Some(firing_piece),
            bursts_fired: new_bursts,
            ready_time: game_time + delta_seconds_to_ticks(weapon_definition.burst_interval),
        }
    };
    set_attack_info(sim, unit_id, weapon_index, new_info)
}

/// The world direction for a relative heading and pitch.
fn pitched_direction(absolute_heading: SimAngle, pitch: SimAngle) -> SimVector {
    let flat = UnitState::to_direction(absolute_heading);
    let cos_pitch = angle::cos(pitch);
    SimVector::new(
        flat.x * cos_pitch,
        angle::sin(pitch),
        flat.z * cos_pitch,
    )
}

// ============================================================================
// Script query helpers
// ============================================================================

fn get_piece_local_position(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    piece_id: usize,
) -> Result<SimVector, SimError> {
    let piece_name = {
        let unit = sim.get_unit(unit_id)?;
        unit.cob_env
            .script
            .piece_name(piece_id)
            .cloned()
            .ok_or_else(|| SimError::UnknownPiece {
                unit_type: unit.unit_type.clone(),
                piece: format!("<piece {}>", piece_id),
            })?
    };
    let transform = sim.get_unit_piece_local_transform(unit_id, &piece_name)?;
    Ok(transform * SimVector::ZERO)
}

fn get_piece_position(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    piece_id: usize,
) -> Result<SimVector, SimError> {
    let local = get_piece_local_position(sim, unit_id, piece_id)?;
    Ok(sim.get_unit(unit_id)?.get_transform() * local)
}

fn get_local_firing_point(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    weapon_index: usize,
) -> Result<SimVector, SimError> {
    match run_cob_query(sim, unit_id, get_query_script_name(weapon_index))? {
        Some(piece_id) => get_piece_local_position(sim, unit_id, piece_id as usize),
        None => Ok(SimVector::ZERO),
    }
}

fn get_local_aiming_point(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    weapon_index: usize,
) -> Result<SimVector, SimError> {
    match run_cob_query(sim, unit_id, get_aim_from_script_name(weapon_index))? {
        Some(piece_id) => get_piece_local_position(sim, unit_id, piece_id as usize),
        None => get_local_firing_point(sim, unit_id, weapon_index),
    }
}

fn get_aiming_point(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    weapon_index: usize,
) -> Result<SimVector, SimError> {
    let local = get_local_aiming_point(sim, unit_id, weapon_index)?;
    Ok(sim.get_unit(unit_id)?.get_transform() * local)
}

/// The preferred aim point of a target unit, exposed by its `SweetSpot`
/// script; falls back to the unit's origin.
fn get_sweet_spot(sim: &mut GameSimulation, unit_id: UnitId) -> Result<SimVector, SimError> {
    match run_cob_query(sim, unit_id, "SweetSpot")? {
        Some(piece_id) => get_piece_position(sim, unit_id, piece_id as usize),
        None => Ok(sim.get_unit(unit_id)?.position),
    }
}

fn try_get_sweet_spot(
    sim: &mut GameSimulation,
    unit_id: UnitId,
) -> Result<Option<SimVector>, SimError> {
    if !sim.unit_exists(unit_id) {
        return Ok(None);
    }
    Ok(Some(get_sweet_spot(sim, unit_id)?))
}

/// Where a factory's build pad currently is, from its `QueryBuildInfo` piece.
struct BuildPieceInfo {
    position: SimVector,
    rotation: SimAngle,
}

fn get_build_piece_info(
    sim: &mut GameSimulation,
    unit_id: UnitId,
) -> Result<BuildPieceInfo, SimError> {
    match run_cob_query(sim, unit_id, "QueryBuildInfo")? {
        Some(piece_id) => {
            let position = get_piece_position(sim, unit_id, piece_id as usize)?;
            let rotation = get_piece_xz_rotation(sim, unit_id, piece_id as usize)?;
            Ok(BuildPieceInfo { position, rotation })
        }
        None => {
            let unit = sim.get_unit(unit_id)?;
            Ok(BuildPieceInfo {
                position: unit.position,
                rotation: unit.rotation,
            })
        }
    }
}

fn get_piece_xz_rotation(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    piece_id: usize,
) -> Result<SimAngle, SimError> {
    let piece_name = {
        let unit = sim.get_unit(unit_id)?;
        unit.cob_env
            .script
            .piece_name(piece_id)
            .cloned()
            .ok_or_else(|| SimError::UnknownPiece {
                unit_type: unit.unit_type.clone(),
                piece: format!("<piece {}>", piece_id),
            })?
    };
    let transform = sim.get_unit_piece_transform(unit_id, &piece_name)?;
    let forward = transform.mult3x3(SimVector::from_num(0, 0, 1));
    if forward.xz().length_squared() == SimScalar::ZERO {
        return Ok(SimAngle::ZERO);
    }
    Ok(UnitState::to_rotation(forward.xz()))
}

fn get_nano_point(sim: &mut GameSimulation, unit_id: UnitId) -> Result<SimVector, SimError> {
    match run_cob_query(sim, unit_id, "QueryNanoPiece")? {
        Some(piece_id) => get_piece_position(sim, unit_id, piece_id as usize),
        None => Ok(sim.get_unit(unit_id)?.position),
    }
}

// ============================================================================
// Steering application and physics
// ============================================================================

fn apply_unit_steering(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<(), SimError> {
    update_unit_rotation(sim, unit_id, definition)?;
    update_unit_speed(sim, unit_id, definition)
}

fn update_unit_rotation(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<(), SimError> {
    let turn_rate = definition.turn_rate;
    let unit = sim.get_unit_mut(unit_id)?;
    unit.previous_rotation = unit.rotation;
    let position = unit.position;

    match &unit.physics {
        UnitPhysicsInfo::Ground(ground) => {
            let target = ground.steering.target_angle;
            unit.rotation = angle::turn_towards(unit.rotation, target, turn_rate);
        }
        UnitPhysicsInfo::Air(AirMovementState::Flying {
            target_position: Some(target),
            ..
        }) => {
            let direction = *target - position;
            if direction.xz().length_squared() > SimScalar::ZERO {
                let target_angle = UnitState::to_rotation(direction.xz());
                unit.rotation = angle::turn_towards(unit.rotation, target_angle, turn_rate);
            }
        }
        UnitPhysicsInfo::Air(_) => {}
    }
    Ok(())
}

fn update_unit_speed(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<(), SimError> {
    let computed = {
        let unit = sim.get_unit(unit_id)?;
        match &unit.physics {
            UnitPhysicsInfo::Ground(ground) => Some(ComputedSpeed::Ground(
                compute_new_ground_unit_speed(&sim.terrain, unit, definition, ground),
            )),
            UnitPhysicsInfo::Air(AirMovementState::Flying {
                target_position,
                current_velocity,
                ..
            }) => Some(ComputedSpeed::Air(compute_new_air_unit_velocity(
                unit,
                definition,
                *target_position,
                *current_velocity,
            ))),
            UnitPhysicsInfo::Air(_) => None,
        }
    };

    match computed {
        Some(ComputedSpeed::Ground(speed)) => {
            if let UnitPhysicsInfo::Ground(ground) = &mut sim.get_unit_mut(unit_id)?.physics {
                ground.current_speed = speed;
            }
        }
        Some(ComputedSpeed::Air(velocity)) => {
            if let UnitPhysicsInfo::Air(AirMovementState::Flying {
                current_velocity, ..
            }) = &mut sim.get_unit_mut(unit_id)?.physics
            {
                *current_velocity = velocity;
            }
        }
        None => {}
    }
    Ok(())
}

enum ComputedSpeed {
    Ground(SimScalar),
    Air(SimVector),
}

fn update_unit_position(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<(), SimError> {
    {
        let unit = sim.get_unit_mut(unit_id)?;
        unit.previous_position = unit.position;
        unit.in_collision = false;
    }

    let physics = sim.get_unit(unit_id)?.physics;
    match physics {
        UnitPhysicsInfo::Ground(ground) => {
            update_ground_unit_position(sim, unit_id, definition, &ground)
        }
        UnitPhysicsInfo::Air(AirMovementState::Flying {
            current_velocity, ..
        }) => {
            let new_position = sim.get_unit(unit_id)?.position + current_velocity;
            try_apply_movement_to_position(sim, unit_id, definition, new_position)?;
            Ok(())
        }
        UnitPhysicsInfo::Air(AirMovementState::TakingOff) => {
            climb_to_cruise_altitude(sim, unit_id, definition)?;
            Ok(())
        }
        UnitPhysicsInfo::Air(AirMovementState::Landing { .. }) => {
            descend_to_ground_level(sim, unit_id)?;
            Ok(())
        }
    }
}

fn update_ground_unit_position(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    physics: &UnitPhysicsInfoGround,
) -> Result<(), SimError> {
    if physics.current_speed <= SimScalar::ZERO {
        return Ok(());
    }

    let (position, rotation) = {
        let unit = sim.get_unit(unit_id)?;
        (unit.position, unit.rotation)
    };
    let direction = UnitState::to_direction(rotation);

    let settle = |sim: &GameSimulation, mut p: SimVector| {
        p.y = sim.terrain.get_height_at(p.x, p.z);
        if definition.floater || definition.can_hover {
            p.y = p.y.max(sim.terrain.get_sea_level());
        }
        p
    };

    let new_position = settle(sim, position + direction * physics.current_speed);

    if !try_apply_movement_to_position(sim, unit_id, definition, new_position)? {
        sim.get_unit_mut(unit_id)?.in_collision = true;

        // Try each axis separately to allow sliding along obstacles.
        let mask_x = SimVector::from_num(0, 1, 1);
        let mask_z = SimVector::from_num(1, 1, 0);
        let (first, second) = if direction.x > direction.z {
            (mask_z, mask_x)
        } else {
            (mask_x, mask_z)
        };

        let pos1 = settle(sim, position + direction * first * physics.current_speed);
        let pos2 = settle(sim, position + direction * second * physics.current_speed);

        if !try_apply_movement_to_position(sim, unit_id, definition, pos1)? {
            try_apply_movement_to_position(sim, unit_id, definition, pos2)?;
        }
    }
    Ok(())
}

/// Attempts to move the unit to `new_position`, updating its claim on the
/// occupied grid. Fails (without side effects) when the new footprint
/// collides or the terrain there is not traversable.
fn try_apply_movement_to_position(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
    new_position: SimVector,
) -> Result<bool, SimError> {
    // Flying units pass over everything.
    if matches!(sim.get_unit(unit_id)?.physics, UnitPhysicsInfo::Air(_)) {
        sim.get_unit_mut(unit_id)?.position = new_position;
        return Ok(true);
    }

    let new_footprint =
        sim.compute_footprint_region_for(new_position, &definition.movement_collision_info);
    if sim.is_collision_at_excluding(&new_footprint, unit_id) {
        return Ok(false);
    }

    // Collision checks use the attributes on the unit itself, not its
    // pathfinding movement class.
    let movement_class = sim.resolve_movement_class(&definition.movement_collision_info);
    if !sim
        .terrain
        .is_grid_point_walkable(&movement_class, new_footprint.x, new_footprint.y)
    {
        return Ok(false);
    }

    let old_position = sim.get_unit(unit_id)?.position;
    let old_footprint =
        sim.compute_footprint_region_for(old_position, &definition.movement_collision_info);
    sim.move_unit_occupied_area(&old_footprint, &new_footprint, unit_id);

    let sea_level = sim.terrain.get_sea_level();
    let old_below_sea = sim.terrain.get_height_at(old_position.x, old_position.z) < sea_level;

    sim.get_unit_mut(unit_id)?.position = new_position;

    let new_below_sea = sim.terrain.get_height_at(new_position.x, new_position.z) < sea_level;

    // Entering or leaving water notifies the unit's script.
    if old_below_sea && !new_below_sea {
        sim.get_unit_mut(unit_id)?
            .cob_env
            .create_thread("setSFXoccupy", vec![4]);
    } else if !old_below_sea && new_below_sea {
        sim.get_unit_mut(unit_id)?
            .cob_env
            .create_thread("setSFXoccupy", vec![2]);
    }

    Ok(true)
}

fn climb_to_cruise_altitude(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<bool, SimError> {
    let position = sim.get_unit(unit_id)?.position;
    let target_height = get_target_altitude(&sim.terrain, position.x, position.z, definition);
    let unit = sim.get_unit_mut(unit_id)?;
    unit.position.y = (unit.position.y + SimScalar::ONE).min(target_height);
    Ok(unit.position.y == target_height)
}

fn descend_to_ground_level(sim: &mut GameSimulation, unit_id: UnitId) -> Result<bool, SimError> {
    let position = sim.get_unit(unit_id)?.position;
    let terrain_height = sim.terrain.get_height_at(position.x, position.z);
    let unit = sim.get_unit_mut(unit_id)?;
    unit.position.y = (unit.position.y - SimScalar::ONE).max(terrain_height);
    Ok(unit.position.y == terrain_height)
}

fn update_physics_transitions(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<(), SimError> {
    let physics = sim.get_unit(unit_id)?.physics;
    match physics {
        UnitPhysicsInfo::Ground(ground) => {
            if ground.steering.should_take_off {
                transition_from_ground_to_air(sim, unit_id, definition)?;
            }
        }
        UnitPhysicsInfo::Air(AirMovementState::TakingOff) => {
            let position = sim.get_unit(unit_id)?.position;
            let target_height =
                get_target_altitude(&sim.terrain, position.x, position.z, definition);
            if position.y == target_height {
                sim.get_unit_mut(unit_id)?.physics =
                    UnitPhysicsInfo::Air(AirMovementState::flying());
            }
        }
        UnitPhysicsInfo::Air(AirMovementState::Landing {
            should_abort,
            ..
        }) => {
            if should_abort {
                let unit = sim.get_unit_mut(unit_id)?;
                unit.activate();
                unit.physics = UnitPhysicsInfo::Air(AirMovementState::flying());
            } else {
                let position = sim.get_unit(unit_id)?.position;
                let terrain_height = sim.terrain.get_height_at(position.x, position.z);
                if position.y == terrain_height
                    && !try_transition_from_air_to_ground(sim, unit_id, definition)?
                {
                    if let UnitPhysicsInfo::Air(AirMovementState::Landing {
                        landing_failed,
                        ..
                    }) = &mut sim.get_unit_mut(unit_id)?.physics
                    {
                        *landing_failed = true;
                    }
                }
            }
        }
        UnitPhysicsInfo::Air(AirMovementState::Flying { should_land, .. }) => {
            if should_land {
                let unit = sim.get_unit_mut(unit_id)?;
                unit.physics = UnitPhysicsInfo::Air(AirMovementState::landing());
                unit.deactivate();
            }
        }
    }
    Ok(())
}

/// Lifting off releases the unit's grid footprint and registers it in the
/// flying set.
fn transition_from_ground_to_air(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<(), SimError> {
    {
        let unit = sim.get_unit_mut(unit_id)?;
        unit.activate();
        unit.physics = UnitPhysicsInfo::Air(AirMovementState::TakingOff);
    }

    let position = sim.get_unit(unit_id)?.position;
    let footprint =
        sim.compute_footprint_region_for(position, &definition.movement_collision_info);
    if let Some(region) = sim.occupied_grid.try_to_region(footprint) {
        sim.occupied_grid.for_each_mut(region, |cell| {
            if cell.occupied_type == crate::game::occupied_grid::OccupiedType::Unit(unit_id) {
                cell.occupied_type = crate::game::occupied_grid::OccupiedType::None;
            }
        });
    }
    sim.flying_units_set.insert(unit_id);
    Ok(())
}

/// Landing re-claims the footprint, which can fail if something moved in
/// underneath.
fn try_transition_from_air_to_ground(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    definition: &Arc<UnitDefinition>,
) -> Result<bool, SimError> {
    let position = sim.get_unit(unit_id)?.position;
    let footprint =
        sim.compute_footprint_region_for(position, &definition.movement_collision_info);
    let Some(region) = sim.occupied_grid.try_to_region(footprint) else {
        return Ok(false);
    };

    if crate::game::occupied_grid::is_region_colliding(&sim.occupied_grid, region) {
        return Ok(false);
    }

    sim.occupied_grid.for_each_mut(region, |cell| {
        cell.occupied_type = crate::game::occupied_grid::OccupiedType::Unit(unit_id);
    });
    sim.flying_units_set.remove(&unit_id);

    sim.get_unit_mut(unit_id)?.physics =
        UnitPhysicsInfo::Ground(UnitPhysicsInfoGround::default());
    Ok(true)
}

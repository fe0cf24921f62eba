//! Per-unit simulation state.
//!
//! A unit owns its piece animation state and its script environment; all
//! references to other entities are ids. The tagged sum types here (orders,
//! physics, weapon states, factory states) are the state machines the
//! behavior engine drives each tick.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::game::angle::{self, SimAngle};
use crate::game::cob::CobEnvironment;
use crate::game::collections::TypedId;
use crate::game::definitions::UnitDefinition;
use crate::game::grid::DiscreteRect;
use crate::game::math::{Matrix4x, SimScalar, SimVector};
use crate::game::pathfinding::UnitPath;
use crate::game::player::{Energy, Metal, PlayerId};
use crate::game::unit_mesh::{
    MoveOperation, SimAxis, SpinOperation, StopSpinOperation, TurnOperation, TurnOperationUnion,
    UnitMesh,
};
use crate::game::{GameTime, SimError};

pub struct UnitIdTag;
pub type UnitId = TypedId<UnitIdTag>;

// ============================================================================
// Orders
// ============================================================================

/// The target of an attack order or weapon: a unit, or a patch of ground.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AttackTarget {
    Unit(UnitId),
    Ground(SimVector),
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum UnitOrder {
    Move(SimVector),
    Attack(AttackTarget),
    Build { unit_type: String, position: SimVector },
    BuggerOff(DiscreteRect),
    CompleteBuild(UnitId),
    Guard(UnitId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnitFireOrders {
    HoldFire,
    ReturnFire,
    FireAtWill,
}

// ============================================================================
// Navigation
// ============================================================================

/// A concrete place to move to: a point, or anywhere clear of a rectangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MovingStateGoal {
    Position(SimVector),
    Rect(DiscreteRect),
}

/// What the current order wants from navigation this tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NavigationGoal {
    Goal(MovingStateGoal),
    /// Resolved lazily against the landing-spot finder.
    LandingLocation,
}

impl From<SimVector> for NavigationGoal {
    fn from(v: SimVector) -> Self {
        NavigationGoal::Goal(MovingStateGoal::Position(v))
    }
}

impl From<DiscreteRect> for NavigationGoal {
    fn from(r: DiscreteRect) -> Self {
        NavigationGoal::Goal(MovingStateGoal::Rect(r))
    }
}

#[derive(Clone, Debug)]
pub struct PathFollowingInfo {
    pub path: UnitPath,
    pub path_creation_time: GameTime,
    pub current_waypoint: usize,
}

impl PathFollowingInfo {
    pub fn new(path: UnitPath, creation_time: GameTime) -> Self {
        Self {
            path,
            path_creation_time: creation_time,
            current_waypoint: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub enum NavigationStateInfo {
    #[default]
    Idle,
    Moving {
        destination: MovingStateGoal,
        path: Option<PathFollowingInfo>,
        path_requested: bool,
    },
    MovingToLandingSpot {
        landing_location: SimVector,
    },
}

#[derive(Clone, Debug, Default)]
pub struct NavigationState {
    pub desired_destination: Option<NavigationGoal>,
    pub state: NavigationStateInfo,
}

// ============================================================================
// Physics
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SteeringInfo {
    /// The angle we are trying to steer towards.
    pub target_angle: SimAngle,
    /// The speed we are trying to accelerate/decelerate to.
    pub target_speed: SimScalar,
    /// True if the unit should attempt to take off into the air.
    pub should_take_off: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UnitPhysicsInfoGround {
    pub steering: SteeringInfo,
    /// Rate at which the unit is travelling forwards in world units/tick.
    pub current_speed: SimScalar,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AirMovementState {
    TakingOff,
    Flying {
        target_position: Option<SimVector>,
        /// True if the unit should attempt to land at the current position.
        should_land: bool,
        /// World units per tick.
        current_velocity: SimVector,
    },
    Landing {
        should_abort: bool,
        landing_failed: bool,
    },
}

impl AirMovementState {
    pub fn flying() -> Self {
        AirMovementState::Flying {
            target_position: None,
            should_land: false,
            current_velocity: SimVector::ZERO,
        }
    }

    pub fn landing() -> Self {
        AirMovementState::Landing {
            should_abort: false,
            landing_failed: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnitPhysicsInfo {
    Ground(UnitPhysicsInfoGround),
    Air(AirMovementState),
}

pub fn is_flying(physics: &UnitPhysicsInfo) -> bool {
    matches!(physics, UnitPhysicsInfo::Air(_))
}

// ============================================================================
// Weapons
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WeaponAttackInfo {
    Idle,
    Aim {
        thread: usize,
        last_heading: SimAngle,
        last_pitch: SimAngle,
    },
    Fire {
        heading: SimAngle,
        pitch: SimAngle,
        target_position: SimVector,
        firing_piece: Option<usize>,
        bursts_fired: u32,
        ready_time: GameTime,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnitWeaponState {
    Idle,
    Attacking {
        target: AttackTarget,
        attack_info: WeaponAttackInfo,
    },
}

#[derive(Clone, Debug)]
pub struct UnitWeapon {
    pub weapon_type: String,
    /// Firing-point to aiming-point depth, measured once at creation and fed
    /// into the ballistic solver.
    pub ballistic_z_offset: SimScalar,
    /// Tick at which the weapon has finished reloading.
    pub ready_time: GameTime,
    pub state: UnitWeaponState,
}

impl UnitWeapon {
    pub fn new(weapon_type: String) -> Self {
        Self {
            weapon_type,
            ballistic_z_offset: SimScalar::ZERO,
            ready_time: GameTime::new(0),
            state: UnitWeaponState::Idle,
        }
    }
}

// ============================================================================
// Behavior and factory state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitCreationStatus {
    Pending,
    Failed,
    Done { unit_id: UnitId },
}

#[derive(Clone, Debug, Default)]
pub enum UnitBehaviorState {
    #[default]
    Idle,
    CreatingUnit {
        unit_type: String,
        owner: PlayerId,
        position: SimVector,
        status: UnitCreationStatus,
    },
    Building {
        target_unit: UnitId,
        /// Origin of the nanolathe beam while resources are flowing.
        nano_particle_origin: Option<SimVector>,
    },
}

#[derive(Clone, Debug, Default)]
pub enum FactoryBehaviorState {
    #[default]
    Idle,
    CreatingUnit {
        unit_type: String,
        owner: PlayerId,
        position: SimVector,
        rotation: SimAngle,
        status: UnitCreationStatus,
    },
    Building {
        /// The unit on the build pad and the nanolathe origin, once known.
        target_unit: Option<(UnitId, Option<SimVector>)>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifeState {
    Alive,
    Dead { leave_corpse: bool },
}

// ============================================================================
// UnitState
// ============================================================================

pub struct UnitState {
    pub unit_type: String,
    pub pieces: Vec<UnitMesh>,
    pub piece_name_to_indices: FxHashMap<String, usize>,
    pub position: SimVector,
    pub previous_position: SimVector,
    pub cob_env: CobEnvironment,
    pub owner: PlayerId,

    /// Anticlockwise rotation of the unit around the Y axis.
    pub rotation: SimAngle,
    pub previous_rotation: SimAngle,

    pub physics: UnitPhysicsInfo,

    pub hit_points: u32,
    pub life_state: LifeState,

    pub orders: VecDeque<UnitOrder>,
    pub behavior_state: UnitBehaviorState,

    /// State remembered for the current build order; cleared when the order
    /// completes.
    pub build_order_unit_id: Option<UnitId>,

    pub in_build_stance: bool,
    pub yard_open: bool,

    /// True if the unit attempted to move last tick and was limited or
    /// stopped entirely by a collision.
    pub in_collision: bool,

    pub weapons: [Option<UnitWeapon>; 3],
    pub fire_orders: UnitFireOrders,

    pub build_time_completed: u32,

    pub activated: bool,
    pub is_sufficiently_powered: bool,

    pub energy_production_buffer: Energy,
    pub metal_production_buffer: Metal,
    pub previous_energy_consumption_buffer: Energy,
    pub previous_metal_consumption_buffer: Metal,
    pub energy_consumption_buffer: Energy,
    pub metal_consumption_buffer: Metal,

    pub build_queue: VecDeque<(String, u32)>,
    pub factory_state: FactoryBehaviorState,

    pub navigation_state: NavigationState,
}

fn create_piece_index(pieces: &[UnitMesh]) -> FxHashMap<String, usize> {
    pieces
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.to_uppercase(), i))
        .collect()
}

impl UnitState {
    pub fn new(unit_type: String, pieces: Vec<UnitMesh>, cob_env: CobEnvironment) -> Self {
        let piece_name_to_indices = create_piece_index(&pieces);
        Self {
            unit_type,
            pieces,
            piece_name_to_indices,
            position: SimVector::ZERO,
            previous_position: SimVector::ZERO,
            cob_env,
            owner: PlayerId(0),
            rotation: SimAngle::ZERO,
            previous_rotation: SimAngle::ZERO,
            physics: UnitPhysicsInfo::Ground(UnitPhysicsInfoGround::default()),
            hit_points: 0,
            life_state: LifeState::Alive,
            orders: VecDeque::new(),
            behavior_state: UnitBehaviorState::Idle,
            build_order_unit_id: None,
            in_build_stance: false,
            yard_open: false,
            in_collision: false,
            weapons: [None, None, None],
            fire_orders: UnitFireOrders::FireAtWill,
            build_time_completed: 0,
            activated: false,
            is_sufficiently_powered: false,
            energy_production_buffer: Energy::ZERO,
            metal_production_buffer: Metal::ZERO,
            previous_energy_consumption_buffer: Energy::ZERO,
            previous_metal_consumption_buffer: Metal::ZERO,
            energy_consumption_buffer: Energy::ZERO,
            metal_consumption_buffer: Metal::ZERO,
            build_queue: VecDeque::new(),
            factory_state: FactoryBehaviorState::Idle,
            navigation_state: NavigationState::default(),
        }
    }

    /// The rotation whose forward direction points along `direction`.
    /// Rotation 0 faces `+x`; a quarter turn faces `+z`.
    pub fn to_rotation(direction: SimVector) -> SimAngle {
        angle::atan2(direction.z, direction.x)
    }

    /// The unit-length forward direction of a rotation.
    pub fn to_direction(rotation: SimAngle) -> SimVector {
        SimVector::new(angle::cos(rotation), SimScalar::ZERO, angle::sin(rotation))
    }

    pub fn is_being_built(&self, definition: &UnitDefinition) -> bool {
        self.build_time_completed < definition.build_time
    }

    pub fn get_build_percent_left(&self, definition: &UnitDefinition) -> u32 {
        100 - ((self.build_time_completed * 100) / definition.build_time)
    }

    pub fn is_owned_by(&self, player: PlayerId) -> bool {
        self.owner == player
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.life_state, LifeState::Alive)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.life_state, LifeState::Dead { .. })
    }

    pub fn mark_as_dead(&mut self) {
        self.life_state = LifeState::Dead { leave_corpse: true };
    }

    pub fn mark_as_dead_no_corpse(&mut self) {
        self.life_state = LifeState::Dead {
            leave_corpse: false,
        };
    }

    pub fn finish_building(&mut self, definition: &UnitDefinition) {
        self.hit_points = definition.max_hit_points;
        self.build_time_completed = definition.build_time;
    }

    // ------------------------------------------------------------------
    // Build progress
    // ------------------------------------------------------------------

    /// Energy and metal owed for contributing `build_time_contribution` worker
    /// time to this unit, as the delta between the old and new paid-up cost.
    pub fn get_build_cost_info(
        &self,
        definition: &UnitDefinition,
        build_time_contribution: u32,
    ) -> BuildCostInfo {
        let remaining = definition.build_time - self.build_time_completed;
        let contribution = build_time_contribution.min(remaining);

        let cost_at = |completed: u32| {
            let factor = SimScalar::from_num(completed) / SimScalar::from_num(definition.build_time);
            (
                Energy(definition.build_cost_energy.0 * factor),
                Metal(definition.build_cost_metal.0 * factor),
            )
        };

        let (old_energy, old_metal) = cost_at(self.build_time_completed);
        let (new_energy, new_metal) = cost_at(self.build_time_completed + contribution);

        BuildCostInfo {
            worker_time: contribution,
            energy_cost: new_energy - old_energy,
            metal_cost: new_metal - old_metal,
        }
    }

    /// Applies worker time; returns true when the unit reaches full build.
    pub fn add_build_progress(
        &mut self,
        definition: &UnitDefinition,
        build_time_contribution: u32,
    ) -> bool {
        let remaining = definition.build_time - self.build_time_completed;
        let contribution = build_time_contribution.min(remaining);

        let old_hp = (self.build_time_completed as u64 * definition.max_hit_points as u64)
            / definition.build_time as u64;
        self.build_time_completed += contribution;
        let new_hp = (self.build_time_completed as u64 * definition.max_hit_points as u64)
            / definition.build_time as u64;

        let delta_hp = (new_hp - old_hp) as u32;
        self.hit_points = (self.hit_points + delta_hp).min(definition.max_hit_points);

        self.build_time_completed == definition.build_time
    }

    // ------------------------------------------------------------------
    // Pieces
    // ------------------------------------------------------------------

    pub fn find_piece(&self, piece_name: &str) -> Option<&UnitMesh> {
        self.piece_name_to_indices
            .get(&piece_name.to_uppercase())
            .map(|&i| &self.pieces[i])
    }

    pub fn find_piece_mut(&mut self, piece_name: &str) -> Option<&mut UnitMesh> {
        let i = *self.piece_name_to_indices.get(&piece_name.to_uppercase())?;
        Some(&mut self.pieces[i])
    }

    fn require_piece_mut(&mut self, piece_name: &str) -> Result<&mut UnitMesh, SimError> {
        let unit_type = self.unit_type.clone();
        self.find_piece_mut(piece_name)
            .ok_or(SimError::UnknownPiece {
                unit_type,
                piece: piece_name.to_string(),
            })
    }

    pub fn move_piece(
        &mut self,
        piece_name: &str,
        axis: SimAxis,
        target_position: SimScalar,
        speed: SimScalar,
    ) -> Result<(), SimError> {
        let piece = self.require_piece_mut(piece_name)?;
        *piece.move_operation_mut(axis) = Some(MoveOperation {
            target_position,
            speed,
        });
        Ok(())
    }

    pub fn move_piece_now(
        &mut self,
        piece_name: &str,
        axis: SimAxis,
        target_position: SimScalar,
    ) -> Result<(), SimError> {
        let piece = self.require_piece_mut(piece_name)?;
        *piece.offset_component_mut(axis) = target_position;
        *piece.move_operation_mut(axis) = None;
        Ok(())
    }

    pub fn turn_piece(
        &mut self,
        piece_name: &str,
        axis: SimAxis,
        target_angle: SimAngle,
        speed: SimScalar,
    ) -> Result<(), SimError> {
        let piece = self.require_piece_mut(piece_name)?;
        *piece.turn_operation_mut(axis) = Some(TurnOperationUnion::Turn(TurnOperation {
            target_angle,
            speed,
        }));
        Ok(())
    }

    pub fn turn_piece_now(
        &mut self,
        piece_name: &str,
        axis: SimAxis,
        target_angle: SimAngle,
    ) -> Result<(), SimError> {
        let piece = self.require_piece_mut(piece_name)?;
        *piece.rotation_component_mut(axis) = target_angle;
        *piece.turn_operation_mut(axis) = None;
        Ok(())
    }

    pub fn spin_piece(
        &mut self,
        piece_name: &str,
        axis: SimAxis,
        speed: SimScalar,
        acceleration: SimScalar,
    ) -> Result<(), SimError> {
        let piece = self.require_piece_mut(piece_name)?;
        *piece.turn_operation_mut(axis) = Some(TurnOperationUnion::Spin(SpinOperation {
            current_speed: if acceleration == SimScalar::ZERO {
                speed
            } else {
                SimScalar::ZERO
            },
            target_speed: speed,
            acceleration,
        }));
        Ok(())
    }

    pub fn stop_spin_piece(
        &mut self,
        piece_name: &str,
        axis: SimAxis,
        deceleration: SimScalar,
    ) -> Result<(), SimError> {
        let piece = self.require_piece_mut(piece_name)?;
        let slot = piece.turn_operation_mut(axis);
        if let Some(TurnOperationUnion::Spin(spin)) = *slot {
            if deceleration == SimScalar::ZERO {
                *slot = None;
            } else {
                *slot = Some(TurnOperationUnion::StopSpin(StopSpinOperation {
                    current_speed: spin.current_speed,
                    deceleration,
                }));
            }
        }
        Ok(())
    }

    pub fn is_move_in_progress(&self, piece_name: &str, axis: SimAxis) -> bool {
        self.find_piece(piece_name)
            .map(|p| p.is_move_in_progress(axis))
            .unwrap_or(false)
    }

    pub fn is_turn_in_progress(&self, piece_name: &str, axis: SimAxis) -> bool {
        self.find_piece(piece_name)
            .map(|p| p.is_turn_in_progress(axis))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub fn clear_orders(&mut self) {
        self.orders.clear();
        self.build_order_unit_id = None;
        self.clear_weapon_targets();
    }

    pub fn replace_orders(&mut self, new_orders: VecDeque<UnitOrder>) {
        self.orders = new_orders;
    }

    pub fn add_order(&mut self, order: UnitOrder) {
        self.orders.push_back(order);
    }

    // ------------------------------------------------------------------
    // Weapons
    // ------------------------------------------------------------------

    pub fn set_weapon_target(&mut self, weapon_index: usize, target: AttackTarget) {
        let already_attacking = match &self.weapons[weapon_index] {
            Some(w) => matches!(
                &w.state,
                UnitWeaponState::Attacking { target: t, .. } if *t == target
            ),
            None => return,
        };
        if !already_attacking {
            self.clear_weapon_target(weapon_index);
            if let Some(weapon) = &mut self.weapons[weapon_index] {
                weapon.state = UnitWeaponState::Attacking {
                    target,
                    attack_info: WeaponAttackInfo::Idle,
                };
            }
        }
    }

    pub fn clear_weapon_target(&mut self, weapon_index: usize) {
        if let Some(weapon) = &mut self.weapons[weapon_index] {
            weapon.state = UnitWeaponState::Idle;
            self.cob_env
                .create_thread("TargetCleared", vec![weapon_index as i32]);
        }
    }

    pub fn clear_weapon_targets(&mut self) {
        for i in 0..self.weapons.len() {
            self.clear_weapon_target(i);
        }
    }

    // ------------------------------------------------------------------
    // Activation and resources
    // ------------------------------------------------------------------

    pub fn activate(&mut self) {
        self.activated = true;
        self.cob_env.create_thread("Activate", Vec::new());
    }

    pub fn deactivate(&mut self) {
        self.activated = false;
        self.cob_env.create_thread("Deactivate", Vec::new());
    }

    pub fn get_metal_make(&self) -> Metal {
        self.metal_production_buffer
    }

    pub fn get_energy_make(&self) -> Energy {
        self.energy_production_buffer
    }

    pub fn get_metal_use(&self) -> Metal {
        self.previous_metal_consumption_buffer
    }

    pub fn get_energy_use(&self) -> Energy {
        self.previous_energy_consumption_buffer
    }

    pub fn add_energy_delta(&mut self, energy: Energy) {
        if energy >= Energy::ZERO {
            self.energy_production_buffer += energy;
        } else {
            self.energy_consumption_buffer -= energy;
        }
    }

    pub fn add_metal_delta(&mut self, metal: Metal) {
        if metal >= Metal::ZERO {
            self.metal_production_buffer += metal;
        } else {
            self.metal_consumption_buffer -= metal;
        }
    }

    pub fn reset_resource_buffers(&mut self) {
        self.energy_production_buffer = Energy::ZERO;
        self.metal_production_buffer = Metal::ZERO;
        self.previous_energy_consumption_buffer = self.energy_consumption_buffer;
        self.previous_metal_consumption_buffer = self.metal_consumption_buffer;
        self.energy_consumption_buffer = Energy::ZERO;
        self.metal_consumption_buffer = Metal::ZERO;
    }

    // ------------------------------------------------------------------
    // Build queue
    // ------------------------------------------------------------------

    /// Appends instances for positive counts; removes up to `-count`
    /// instances from the back of the queue for negative counts.
    pub fn modify_build_queue(&mut self, unit_type: &str, count: i32) {
        if count > 0 {
            self.build_queue
                .push_back((unit_type.to_string(), count as u32));
            return;
        }

        let mut to_remove = (-count) as u32;
        while to_remove > 0 {
            let Some(pos) = self
                .build_queue
                .iter()
                .rposition(|(t, _)| t == unit_type)
            else {
                return;
            };
            let entry = &mut self.build_queue[pos];
            if entry.1 > to_remove {
                entry.1 -= to_remove;
                return;
            }
            to_remove -= entry.1;
            self.build_queue.remove(pos);
        }
    }

    pub fn get_build_queue_total(&self, unit_type: &str) -> u32 {
        self.build_queue
            .iter()
            .filter(|(t, _)| t == unit_type)
            .map(|(_, c)| c)
            .sum()
    }

    /// The active nanolathe beam, if any: target unit and beam origin.
    pub fn get_active_nanolathe_target(&self) -> Option<(UnitId, SimVector)> {
        if let UnitBehaviorState::Building {
            target_unit,
            nano_particle_origin: Some(origin),
        } = &self.behavior_state
        {
            return Some((*target_unit, *origin));
        }

        if let FactoryBehaviorState::Building {
            target_unit: Some((target, Some(origin))),
        } = &self.factory_state
        {
            return Some((*target, *origin));
        }

        None
    }

    // ------------------------------------------------------------------
    // Transforms
    // ------------------------------------------------------------------

    /// World transform mapping model space (forward = `+z`) so that model
    /// forward points along `to_direction(rotation)`.
    pub fn get_transform(&self) -> Matrix4x {
        Matrix4x::translation(self.position)
            * Matrix4x::rotation_y_sin_cos(angle::cos(self.rotation), angle::sin(self.rotation))
    }

    pub fn get_inverse_transform(&self) -> Matrix4x {
        Matrix4x::rotation_y_sin_cos(-angle::cos(self.rotation), angle::sin(self.rotation))
            * Matrix4x::translation(-self.position)
    }
}

pub struct BuildCostInfo {
    pub worker_time: u32,
    pub energy_cost: Energy,
    pub metal_cost: Metal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::cob::CobScript;
    use std::sync::Arc;

    fn test_unit() -> UnitState {
        UnitState::new(
            "TESTUNIT".to_string(),
            vec![UnitMesh::new("base"), UnitMesh::new("turret")],
            CobEnvironment::new(Arc::new(CobScript::default())),
        )
    }

    fn test_definition() -> UnitDefinition {
        crate::game::testing::minimal_definition("TESTUNIT")
    }

    #[test]
    fn build_queue_modification_sums_and_removes_from_back() {
        let mut unit = test_unit();
        unit.modify_build_queue("SCOUT", 2);
        unit.modify_build_queue("TANK", 1);
        unit.modify_build_queue("SCOUT", 3);
        assert_eq!(unit.get_build_queue_total("SCOUT"), 5);

        unit.modify_build_queue("SCOUT", -4);
        assert_eq!(unit.get_build_queue_total("SCOUT"), 1);
        assert_eq!(unit.get_build_queue_total("TANK"), 1);

        unit.modify_build_queue("SCOUT", -5);
        assert_eq!(unit.get_build_queue_total("SCOUT"), 0);
    }

    #[test]
    fn build_progress_clamps_to_build_time() {
        let mut unit = test_unit();
        let mut def = test_definition();
        def.build_time = 100;
        def.max_hit_points = 500;

        assert!(!unit.add_build_progress(&def, 60));
        assert_eq!(unit.build_time_completed, 60);
        assert_eq!(unit.hit_points, 300);

        // Final contribution larger than what remains still lands exactly.
        assert!(unit.add_build_progress(&def, 60));
        assert_eq!(unit.build_time_completed, 100);
        assert_eq!(unit.hit_points, 500);
    }

    #[test]
    fn build_cost_deltas_sum_to_total_cost() {
        let mut unit = test_unit();
        let mut def = test_definition();
        def.build_time = 90;
        def.build_cost_energy = Energy::from_num(300);
        def.build_cost_metal = Metal::from_num(90);

        let mut total_energy = Energy::ZERO;
        while unit.build_time_completed < def.build_time {
            let info = unit.get_build_cost_info(&def, 40);
            total_energy += info.energy_cost;
            unit.add_build_progress(&def, 40);
        }
        assert_eq!(total_energy, Energy::from_num(300));
    }

    #[test]
    fn direction_rotation_round_trip() {
        for units in [0u16, 0x2000, 0x4000, 0x9000, 0xE000] {
            let rot = SimAngle::new(units);
            let dir = UnitState::to_direction(rot);
            let back = UnitState::to_rotation(dir);
            assert!(angle::angle_between(rot, back).value < 160);
        }
    }

    #[test]
    fn clear_orders_is_idempotent() {
        let mut unit = test_unit();
        unit.add_order(UnitOrder::Move(SimVector::from_num(5, 0, 5)));
        unit.clear_orders();
        let orders_after_first = unit.orders.clone();
        let build_order_after_first = unit.build_order_unit_id;
        unit.clear_orders();
        assert_eq!(unit.orders, orders_after_first);
        assert_eq!(unit.build_order_unit_id, build_order_after_first);
    }
}

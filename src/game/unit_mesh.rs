//! Per-piece animation state for a unit's model.
//!
//! Each piece carries an offset and a rotation per axis, plus at most one
//! in-progress operation per axis in each of the two families (translation
//! and rotation). Operations advance every tick by the fixed tick delta and
//! clear themselves on completion, which is what releases script threads
//! blocked on `WAIT_FOR_MOVE` / `WAIT_FOR_TURN`.

use crate::game::angle::{self, SimAngle};
use crate::game::math::{SimScalar, SimVector};

/// Axis selector shared with the script VM. Encoding: 0 = X, 1 = Y, 2 = Z.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimAxis {
    X,
    Y,
    Z,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveOperation {
    pub target_position: SimScalar,
    /// World units per second.
    pub speed: SimScalar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnOperation {
    pub target_angle: SimAngle,
    /// Angle units per second.
    pub speed: SimScalar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpinOperation {
    /// Signed angle units per second.
    pub current_speed: SimScalar,
    pub target_speed: SimScalar,
    pub acceleration: SimScalar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopSpinOperation {
    pub current_speed: SimScalar,
    pub deceleration: SimScalar,
}

/// The rotation-family operations share the per-axis slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOperationUnion {
    Turn(TurnOperation),
    Spin(SpinOperation),
    StopSpin(StopSpinOperation),
}

#[derive(Clone, Debug)]
pub struct UnitMesh {
    pub name: String,
    pub visible: bool,
    pub shaded: bool,
    pub offset: SimVector,
    pub rotation_x: SimAngle,
    pub rotation_y: SimAngle,
    pub rotation_z: SimAngle,
    pub x_move_operation: Option<MoveOperation>,
    pub y_move_operation: Option<MoveOperation>,
    pub z_move_operation: Option<MoveOperation>,
    pub x_turn_operation: Option<TurnOperationUnion>,
    pub y_turn_operation: Option<TurnOperationUnion>,
    pub z_turn_operation: Option<TurnOperationUnion>,
}

impl UnitMesh {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visible: true,
            shaded: true,
            offset: SimVector::ZERO,
            rotation_x: SimAngle::ZERO,
            rotation_y: SimAngle::ZERO,
            rotation_z: SimAngle::ZERO,
            x_move_operation: None,
            y_move_operation: None,
            z_move_operation: None,
            x_turn_operation: None,
            y_turn_operation: None,
            z_turn_operation: None,
        }
    }

    pub fn offset_component(&self, axis: SimAxis) -> SimScalar {
        match axis {
            SimAxis::X => self.offset.x,
            SimAxis::Y => self.offset.y,
            SimAxis::Z => self.offset.z,
        }
    }

    pub fn offset_component_mut(&mut self, axis: SimAxis) -> &mut SimScalar {
        match axis {
            SimAxis::X => &mut self.offset.x,
            SimAxis::Y => &mut self.offset.y,
            SimAxis::Z => &mut self.offset.z,
        }
    }

    pub fn rotation_component_mut(&mut self, axis: SimAxis) -> &mut SimAngle {
        match axis {
            SimAxis::X => &mut self.rotation_x,
            SimAxis::Y => &mut self.rotation_y,
            SimAxis::Z => &mut self.rotation_z,
        }
    }

    pub fn move_operation(&self, axis: SimAxis) -> &Option<MoveOperation> {
        match axis {
            SimAxis::X => &self.x_move_operation,
            SimAxis::Y => &self.y_move_operation,
            SimAxis::Z => &self.z_move_operation,
        }
    }

    pub fn move_operation_mut(&mut self, axis: SimAxis) -> &mut Option<MoveOperation> {
        match axis {
            SimAxis::X => &mut self.x_move_operation,
            SimAxis::Y => &mut self.y_move_operation,
            SimAxis::Z => &mut self.z_move_operation,
        }
    }

    pub fn turn_operation(&self, axis: SimAxis) -> &Option<TurnOperationUnion> {
        match axis {
            SimAxis::X => &self.x_turn_operation,
            SimAxis::Y => &self.y_turn_operation,
            SimAxis::Z => &self.z_turn_operation,
        }
    }

    pub fn turn_operation_mut(&mut self, axis: SimAxis) -> &mut Option<TurnOperationUnion> {
        match axis {
            SimAxis::X => &mut self.x_turn_operation,
            SimAxis::Y => &mut self.y_turn_operation,
            SimAxis::Z => &mut self.z_turn_operation,
        }
    }

    pub fn is_move_in_progress(&self, axis: SimAxis) -> bool {
        self.move_operation(axis).is_some()
    }

    pub fn is_turn_in_progress(&self, axis: SimAxis) -> bool {
        self.turn_operation(axis).is_some()
    }

    /// Advances every in-progress operation by `dt` seconds.
    pub fn update(&mut self, dt: SimScalar) {
        for axis in [SimAxis::X, SimAxis::Y, SimAxis::Z] {
            self.update_move(axis, dt);
            self.update_turn(axis, dt);
        }
    }

    fn update_move(&mut self, axis: SimAxis, dt: SimScalar) {
        let Some(op) = *self.move_operation(axis) else {
            return;
        };
        let step = op.speed * dt;
        let current = self.offset_component(axis);
        let remaining = op.target_position - current;
        if remaining.abs() <= step {
            *self.offset_component_mut(axis) = op.target_position;
            *self.move_operation_mut(axis) = None;
        } else if remaining > SimScalar::ZERO {
            *self.offset_component_mut(axis) = current + step;
        } else {
            *self.offset_component_mut(axis) = current - step;
        }
    }

    fn update_turn(&mut self, axis: SimAxis, dt: SimScalar) {
        let Some(op) = *self.turn_operation(axis) else {
            return;
        };
        match op {
            TurnOperationUnion::Turn(turn) => {
                let step = angle_step(turn.speed * dt);
                let rotation = self.rotation_component_mut(axis);
                *rotation = angle::turn_towards(*rotation, turn.target_angle, step);
                if *rotation == turn.target_angle {
                    *self.turn_operation_mut(axis) = None;
                }
            }
            TurnOperationUnion::Spin(mut spin) => {
                if spin.acceleration == SimScalar::ZERO {
                    spin.current_speed = spin.target_speed;
                } else {
                    let step = spin.acceleration * dt;
                    let remaining = spin.target_speed - spin.current_speed;
                    if remaining.abs() <= step {
                        spin.current_speed = spin.target_speed;
                    } else if remaining > SimScalar::ZERO {
                        spin.current_speed += step;
                    } else {
                        spin.current_speed -= step;
                    }
                }
                self.advance_rotation(axis, spin.current_speed * dt);
                *self.turn_operation_mut(axis) = Some(TurnOperationUnion::Spin(spin));
            }
            TurnOperationUnion::StopSpin(mut stop) => {
                let step = stop.deceleration * dt;
                if stop.current_speed.abs() <= step {
                    *self.turn_operation_mut(axis) = None;
                    return;
                }
                if stop.current_speed > SimScalar::ZERO {
                    stop.current_speed -= step;
                } else {
                    stop.current_speed += step;
                }
                self.advance_rotation(axis, stop.current_speed * dt);
                *self.turn_operation_mut(axis) = Some(TurnOperationUnion::StopSpin(stop));
            }
        }
    }

    fn advance_rotation(&mut self, axis: SimAxis, delta_units: SimScalar) {
        let whole = SimAngle::new((delta_units.to_bits() >> 16).rem_euclid(65536) as u16);
        let rotation = self.rotation_component_mut(axis);
        *rotation = *rotation + whole;
    }
}

/// A per-tick turn step, saturating at a half turn so the shortest-arc
/// comparison in `turn_towards` stays meaningful.
fn angle_step(units: SimScalar) -> SimAngle {
    let v = units.to_bits() >> 16;
    SimAngle::new(v.clamp(0, 0x7FFF) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_delta() -> SimScalar {
        crate::game::sim_tick_delta()
    }

    #[test]
    fn move_operation_reaches_target_and_clears() {
        let mut piece = UnitMesh::new("arm");
        piece.z_move_operation = Some(MoveOperation {
            target_position: SimScalar::from_num(2),
            speed: SimScalar::from_num(30),
        });
        let mut ticks = 0;
        while piece.is_move_in_progress(SimAxis::Z) {
            piece.update(tick_delta());
            ticks += 1;
            assert!(ticks < 10, "move should complete quickly");
        }
        assert_eq!(piece.offset.z, SimScalar::from_num(2));
    }

    #[test]
    fn move_operation_moves_negative_too() {
        let mut piece = UnitMesh::new("arm");
        piece.x_move_operation = Some(MoveOperation {
            target_position: SimScalar::from_num(-3),
            speed: SimScalar::from_num(100),
        });
        for _ in 0..10 {
            piece.update(tick_delta());
        }
        assert_eq!(piece.offset.x, SimScalar::from_num(-3));
        assert!(!piece.is_move_in_progress(SimAxis::X));
    }

    #[test]
    fn turn_operation_takes_shortest_arc_and_clamps() {
        let mut piece = UnitMesh::new("turret");
        piece.rotation_y = SimAngle::new(0xF000);
        piece.y_turn_operation = Some(TurnOperationUnion::Turn(TurnOperation {
            target_angle: SimAngle::new(0x1000),
            // Fast enough to overshoot in one tick if not clamped.
            speed: SimScalar::from_num(400_000),
        }));
        piece.update(tick_delta());
        assert_eq!(piece.rotation_y, SimAngle::new(0x1000));
        assert!(!piece.is_turn_in_progress(SimAxis::Y));
    }

    #[test]
    fn spin_accelerates_to_target_speed() {
        let mut piece = UnitMesh::new("rotor");
        piece.y_turn_operation = Some(TurnOperationUnion::Spin(SpinOperation {
            current_speed: SimScalar::ZERO,
            target_speed: SimScalar::from_num(60_000),
            acceleration: SimScalar::from_num(120_000),
        }));
        let start = piece.rotation_y;
        for _ in 0..30 {
            piece.update(tick_delta());
        }
        // Still spinning; rotation has advanced.
        assert!(piece.is_turn_in_progress(SimAxis::Y));
        assert_ne!(piece.rotation_y, start);
        match piece.y_turn_operation {
            Some(TurnOperationUnion::Spin(spin)) => {
                assert_eq!(spin.current_speed, spin.target_speed);
            }
            other => panic!("expected spin, got {:?}", other),
        }
    }

    #[test]
    fn stop_spin_decelerates_and_clears() {
        let mut piece = UnitMesh::new("rotor");
        piece.y_turn_operation = Some(TurnOperationUnion::StopSpin(StopSpinOperation {
            current_speed: SimScalar::from_num(30_000),
            deceleration: SimScalar::from_num(60_000),
        }));
        for _ in 0..60 {
            piece.update(tick_delta());
            if !piece.is_turn_in_progress(SimAxis::Y) {
                return;
            }
        }
        panic!("stop-spin never completed");
    }
}

//! Deterministic fixed-point mathematics for the simulation.
//!
//! All simulation arithmetic flows through these types. `SimScalar` is backed
//! by fixed-point with a 16-bit fractional part so that every participant in a
//! lockstep game computes bit-identical results regardless of platform,
//! compiler or floating-point mode.

use fixed::types::I48F16;
use serde::{Deserialize, Serialize};

use crate::game::angle::{self, SimAngle};

/// Fixed-point number type used throughout the simulation.
///
/// I48F16 format: 48 bits of integer part, 16 bits of fraction. The fractional
/// precision matches the Q16.16 representation used by unit scripts, while the
/// wide integer part keeps squared-distance intermediates from overflowing.
pub type SimScalar = I48F16;

/// Converts a VM-facing Q16.16 value into a `SimScalar`.
pub fn sim_scalar_from_fixed(v: i32) -> SimScalar {
    SimScalar::from_bits(v as i64)
}

/// Converts a `SimScalar` into a VM-facing Q16.16 value, truncating the
/// integer part to 16 bits.
pub fn sim_scalar_to_fixed(v: SimScalar) -> i32 {
    v.to_bits() as i32
}

pub fn sim_scalar_to_u32(v: SimScalar) -> u32 {
    if v <= SimScalar::ZERO {
        0
    } else {
        v.to_num::<i64>() as u32
    }
}

pub fn clamp(v: SimScalar, lo: SimScalar, hi: SimScalar) -> SimScalar {
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}

/// A 3D vector over `SimScalar`. `y` is elevation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimVector {
    pub x: SimScalar,
    pub y: SimScalar,
    pub z: SimScalar,
}

impl SimVector {
    pub const ZERO: Self = Self {
        x: SimScalar::ZERO,
        y: SimScalar::ZERO,
        z: SimScalar::ZERO,
    };

    pub fn new(x: SimScalar, y: SimScalar, z: SimScalar) -> Self {
        Self { x, y, z }
    }

    pub fn from_num(x: i64, y: i64, z: i64) -> Self {
        Self {
            x: SimScalar::from_num(x),
            y: SimScalar::from_num(y),
            z: SimScalar::from_num(z),
        }
    }

    /// The vector with `y` zeroed, for horizontal-plane comparisons.
    pub fn xz(self) -> Self {
        Self {
            x: self.x,
            y: SimScalar::ZERO,
            z: self.z,
        }
    }

    pub fn dot(self, other: Self) -> SimScalar {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Self {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn length_squared(self) -> SimScalar {
        self.dot(self)
    }

    pub fn length(self) -> SimScalar {
        let len_sq = self.length_squared();
        if len_sq == SimScalar::ZERO {
            return SimScalar::ZERO;
        }
        len_sq.sqrt()
    }

    pub fn distance_squared(self, other: Self) -> SimScalar {
        (other - self).length_squared()
    }

    pub fn normalized(self) -> Self {
        let len = self.length();
        if len == SimScalar::ZERO {
            Self::ZERO
        } else {
            self / len
        }
    }
}

impl std::ops::Add for SimVector {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::AddAssign for SimVector {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for SimVector {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<SimScalar> for SimVector {
    type Output = Self;
    fn mul(self, rhs: SimScalar) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Component-wise product, used for axis masking during partial movement.
impl std::ops::Mul for SimVector {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.x * rhs.x, self.y * rhs.y, self.z * rhs.z)
    }
}

impl std::ops::Div<SimScalar> for SimVector {
    type Output = Self;
    fn div(self, rhs: SimScalar) -> Self {
        Self::new(self.x / rhs, self.y / rhs, self.z / rhs)
    }
}

impl std::ops::Neg for SimVector {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Rotates a direction vector around the Y axis by the given angle.
pub fn rotate_direction_xz(direction: SimVector, rotation: SimAngle) -> SimVector {
    let s = angle::sin(rotation);
    let c = angle::cos(rotation);
    SimVector::new(
        direction.x * c + direction.z * s,
        direction.y,
        direction.z * c - direction.x * s,
    )
}

/// Rotates `v` towards `target` by at most `max_radians`, about the axis
/// perpendicular to both. If the angular distance is within the budget the
/// result points exactly along `target` (preserving the length of `v`).
pub fn rotate_towards(v: SimVector, target: SimVector, max_radians: SimScalar) -> SimVector {
    let v_len = v.length();
    let t_len = target.length();
    if v_len == SimScalar::ZERO || t_len == SimScalar::ZERO {
        return v;
    }

    let cos_between = clamp(
        v.dot(target) / (v_len * t_len),
        SimScalar::from_num(-1),
        SimScalar::from_num(1),
    );
    let between = angle::acos(cos_between);
    if between <= max_radians {
        return target.normalized() * v_len;
    }

    let axis = v.cross(target);
    if axis.length_squared() == SimScalar::ZERO {
        // Directly opposed, no unique rotation plane. Hold course.
        return v;
    }

    let m = Matrix4x::rotation_axis_angle(axis.normalized(), angle::from_radians(max_radians));
    m.mult3x3(v)
}

/// An axis-aligned box used for splash-damage distance checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub min: SimVector,
    pub max: SimVector,
}

impl BoundingBox {
    pub fn from_min_max(min: SimVector, max: SimVector) -> Self {
        Self { min, max }
    }

    /// Squared distance from a point to the nearest point on the box.
    /// Zero when the point is inside.
    pub fn distance_squared(&self, p: SimVector) -> SimScalar {
        let dx = nearest_axis_delta(p.x, self.min.x, self.max.x);
        let dy = nearest_axis_delta(p.y, self.min.y, self.max.y);
        let dz = nearest_axis_delta(p.z, self.min.z, self.max.z);
        dx * dx + dy * dy + dz * dz
    }

    pub fn contains(&self, p: SimVector) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}

fn nearest_axis_delta(v: SimScalar, lo: SimScalar, hi: SimScalar) -> SimScalar {
    if v < lo {
        lo - v
    } else if v > hi {
        v - hi
    } else {
        SimScalar::ZERO
    }
}

/// A 4x4 matrix over `SimScalar`.
///
/// Elements are stored in column-major order, i.e. the array is indexed
/// `data[(column * 4) + row]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Matrix4x {
    pub data: [SimScalar; 16],
}

impl Matrix4x {
    pub fn identity() -> Self {
        let mut m = Self {
            data: [SimScalar::ZERO; 16],
        };
        m.data[0] = SimScalar::ONE;
        m.data[5] = SimScalar::ONE;
        m.data[10] = SimScalar::ONE;
        m.data[15] = SimScalar::ONE;
        m
    }

    pub fn translation(v: SimVector) -> Self {
        let mut m = Self::identity();
        m.data[12] = v.x;
        m.data[13] = v.y;
        m.data[14] = v.z;
        m
    }

    /// Anti-clockwise rotation about the X axis.
    pub fn rotation_x(a: SimAngle) -> Self {
        Self::rotation_x_sin_cos(angle::sin(a), angle::cos(a))
    }

    pub fn rotation_x_sin_cos(s: SimScalar, c: SimScalar) -> Self {
        let mut m = Self::identity();
        m.data[5] = c;
        m.data[6] = s;
        m.data[9] = -s;
        m.data[10] = c;
        m
    }

    /// Anti-clockwise rotation about the Y axis.
    pub fn rotation_y(a: SimAngle) -> Self {
        Self::rotation_y_sin_cos(angle::sin(a), angle::cos(a))
    }

    pub fn rotation_y_sin_cos(s: SimScalar, c: SimScalar) -> Self {
        let mut m = Self::identity();
        m.data[0] = c;
        m.data[2] = -s;
        m.data[8] = s;
        m.data[10] = c;
        m
    }

    /// Anti-clockwise rotation about the Z axis.
    pub fn rotation_z(a: SimAngle) -> Self {
        Self::rotation_z_sin_cos(angle::sin(a), angle::cos(a))
    }

    pub fn rotation_z_sin_cos(s: SimScalar, c: SimScalar) -> Self {
        let mut m = Self::identity();
        m.data[0] = c;
        m.data[1] = s;
        m.data[4] = -s;
        m.data[5] = c;
        m
    }

    /// Rotation about an arbitrary unit axis.
    pub fn rotation_axis_angle(axis: SimVector, a: SimAngle) -> Self {
        let s = angle::sin(a);
        let c = angle::cos(a);
        let t = SimScalar::ONE - c;
        let (x, y, z) = (axis.x, axis.y, axis.z);

        let mut m = Self::identity();
        m.data[0] = t * x * x + c;
        m.data[1] = t * x * y + s * z;
        m.data[2] = t * x * z - s * y;
        m.data[4] = t * x * y - s * z;
        m.data[5] = t * y * y + c;
        m.data[6] = t * y * z + s * x;
        m.data[8] = t * x * z + s * y;
        m.data[9] = t * y * z - s * x;
        m.data[10] = t * z * z + c;
        m
    }

    /// Multiplies the upper-left 3x3 portion of this matrix by the given vector.
    pub fn mult3x3(&self, v: SimVector) -> SimVector {
        SimVector::new(
            self.data[0] * v.x + self.data[4] * v.y + self.data[8] * v.z,
            self.data[1] * v.x + self.data[5] * v.y + self.data[9] * v.z,
            self.data[2] * v.x + self.data[6] * v.y + self.data[10] * v.z,
        )
    }
}

impl std::ops::Mul for Matrix4x {
    type Output = Self;
    fn mul(self, b: Self) -> Self {
        let a = &self.data;
        let b = &b.data;
        let mut m = Self {
            data: [SimScalar::ZERO; 16],
        };
        for col in 0..4 {
            for row in 0..4 {
                let mut acc = SimScalar::ZERO;
                for k in 0..4 {
                    acc += a[k * 4 + row] * b[col * 4 + k];
                }
                m.data[col * 4 + row] = acc;
            }
        }
        m
    }
}

/// Multiplication of matrix by column vector. The vector is treated as having
/// a fourth component of 1; the last row of the matrix is ignored.
impl std::ops::Mul<SimVector> for Matrix4x {
    type Output = SimVector;
    fn mul(self, b: SimVector) -> SimVector {
        let a = &self.data;
        SimVector::new(
            a[0] * b.x + a[4] * b.y + a[8] * b.z + a[12],
            a[1] * b.x + a[5] * b.y + a[9] * b.z + a[13],
            a[2] * b.x + a[6] * b.y + a[10] * b.z + a[14],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_round_trip_is_identity_on_fixed_inputs() {
        for v in [0i32, 1, -1, 65536, -65536, 12345678, i32::MAX, i32::MIN] {
            assert_eq!(sim_scalar_to_fixed(sim_scalar_from_fixed(v)), v);
        }
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..1000 {
            let v = rng.i32(..);
            assert_eq!(sim_scalar_to_fixed(sim_scalar_from_fixed(v)), v);
        }
    }

    #[test]
    fn fixed_round_trip_preserves_scalars_in_range() {
        let v = SimScalar::from_num(123.5);
        assert_eq!(sim_scalar_from_fixed(sim_scalar_to_fixed(v)), v);
        let v = SimScalar::from_num(-0.25);
        assert_eq!(sim_scalar_from_fixed(sim_scalar_to_fixed(v)), v);
    }

    #[test]
    fn translation_moves_points() {
        let m = Matrix4x::translation(SimVector::from_num(1, 2, 3));
        let p = m * SimVector::from_num(10, 20, 30);
        assert_eq!(p, SimVector::from_num(11, 22, 33));
    }

    #[test]
    fn rotation_y_quarter_turn_maps_z_to_x() {
        let m = Matrix4x::rotation_y(SimAngle::QUARTER_TURN);
        let p = m.mult3x3(SimVector::from_num(0, 0, 10));
        assert!((p.x - SimScalar::from_num(10)).abs() < SimScalar::from_num(0.05));
        assert!(p.z.abs() < SimScalar::from_num(0.05));
    }

    #[test]
    fn matrix_multiply_matches_composition() {
        let t = Matrix4x::translation(SimVector::from_num(5, 0, 0));
        let r = Matrix4x::rotation_y(SimAngle::QUARTER_TURN);
        let p = (t * r) * SimVector::from_num(0, 0, 8);
        let q = t * (r * SimVector::from_num(0, 0, 8));
        assert_eq!(p, q);
    }

    #[test]
    fn rotate_towards_snaps_within_budget() {
        let v = SimVector::from_num(1, 0, 0);
        let target = SimVector::from_num(0, 0, 1);
        let out = rotate_towards(v, target, SimScalar::from_num(3.2));
        assert!((out - target).length() < SimScalar::from_num(0.01));
    }

    #[test]
    fn rotate_towards_limits_turn_rate() {
        let v = SimVector::from_num(1, 0, 0);
        let target = SimVector::from_num(0, 0, 1);
        let out = rotate_towards(v, target, SimScalar::from_num(0.1));
        // Should have turned a little towards +z but nowhere near all the way.
        assert!(out.z > SimScalar::ZERO);
        assert!(out.x > SimScalar::from_num(0.9));
    }
}

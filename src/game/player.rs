//! Players and their resource economies.
//!
//! Resource flow is buffered: production and consumption accumulate during
//! each one-second accounting window and are committed together, which is
//! what makes stall detection order-independent within the window.

use serde::{Deserialize, Serialize};

use crate::game::math::SimScalar;

/// A quantity of energy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Energy(pub SimScalar);

/// A quantity of metal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Metal(pub SimScalar);

macro_rules! resource_ops {
    ($t:ident) => {
        impl $t {
            pub const ZERO: Self = Self(SimScalar::ZERO);

            pub fn from_num(v: i64) -> Self {
                Self(SimScalar::from_num(v))
            }
        }

        impl std::ops::Add for $t {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl std::ops::AddAssign for $t {
            fn add_assign(&mut self, rhs: Self) {
                self.0 += rhs.0;
            }
        }

        impl std::ops::Sub for $t {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl std::ops::SubAssign for $t {
            fn sub_assign(&mut self, rhs: Self) {
                self.0 -= rhs.0;
            }
        }

        impl std::ops::Neg for $t {
            type Output = Self;
            fn neg(self) -> Self {
                Self(-self.0)
            }
        }
    };
}

resource_ops!(Energy);
resource_ops!(Metal);

/// A small dense player index, assigned in join order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GamePlayerStatus {
    Alive,
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GamePlayerType {
    Human,
    Computer,
}

#[derive(Clone, Debug)]
pub struct GamePlayerInfo {
    pub name: Option<String>,
    pub player_type: GamePlayerType,
    pub color: u32,
    pub status: GamePlayerStatus,
    pub side: String,

    pub metal: Metal,
    pub energy: Energy,

    pub max_metal: Metal,
    pub max_energy: Energy,

    pub starting_metal: Metal,
    pub starting_energy: Energy,

    pub metal_stalled: bool,
    pub energy_stalled: bool,

    pub desired_metal_consumption_buffer: Metal,
    pub desired_energy_consumption_buffer: Energy,

    pub previous_desired_metal_consumption_buffer: Metal,
    pub previous_desired_energy_consumption_buffer: Energy,

    pub actual_metal_consumption_buffer: Metal,
    pub actual_energy_consumption_buffer: Energy,

    pub metal_production_buffer: Metal,
    pub energy_production_buffer: Energy,
}

impl GamePlayerInfo {
    pub fn new(
        name: Option<String>,
        player_type: GamePlayerType,
        color: u32,
        side: String,
        starting_metal: Metal,
        starting_energy: Energy,
    ) -> Self {
        Self {
            name,
            player_type,
            color,
            status: GamePlayerStatus::Alive,
            side,
            metal: starting_metal,
            energy: starting_energy,
            max_metal: starting_metal,
            max_energy: starting_energy,
            starting_metal,
            starting_energy,
            metal_stalled: false,
            energy_stalled: false,
            desired_metal_consumption_buffer: Metal::ZERO,
            desired_energy_consumption_buffer: Energy::ZERO,
            previous_desired_metal_consumption_buffer: Metal::ZERO,
            previous_desired_energy_consumption_buffer: Energy::ZERO,
            actual_metal_consumption_buffer: Metal::ZERO,
            actual_energy_consumption_buffer: Energy::ZERO,
            metal_production_buffer: Metal::ZERO,
            energy_production_buffer: Energy::ZERO,
        }
    }

    /// Records a resource delta against this player's buffers.
    ///
    /// Returns true if both desires were satisfiable. Consumption is only
    /// committed when neither resource is stalled; production always lands.
    pub fn add_resource_delta(
        &mut self,
        apparent_energy: Energy,
        apparent_metal: Metal,
        actual_energy: Energy,
        actual_metal: Metal,
    ) -> bool {
        let energy_ok = self.record_and_check_energy_desire(apparent_energy);
        let metal_ok = self.record_and_check_metal_desire(apparent_metal);
        if energy_ok && metal_ok {
            self.accept_energy(actual_energy);
            self.accept_metal(actual_metal);
            true
        } else {
            false
        }
    }

    fn record_and_check_energy_desire(&mut self, energy: Energy) -> bool {
        if energy >= Energy::ZERO {
            return true;
        }
        self.desired_energy_consumption_buffer -= energy;
        !self.energy_stalled
    }

    fn record_and_check_metal_desire(&mut self, metal: Metal) -> bool {
        if metal >= Metal::ZERO {
            return true;
        }
        self.desired_metal_consumption_buffer -= metal;
        !self.metal_stalled
    }

    fn accept_energy(&mut self, energy: Energy) {
        if energy >= Energy::ZERO {
            self.energy_production_buffer += energy;
        } else {
            self.actual_energy_consumption_buffer -= energy;
        }
    }

    fn accept_metal(&mut self, metal: Metal) {
        if metal >= Metal::ZERO {
            self.metal_production_buffer += metal;
        } else {
            self.actual_metal_consumption_buffer -= metal;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> GamePlayerInfo {
        GamePlayerInfo::new(
            None,
            GamePlayerType::Human,
            0,
            "ARM".to_string(),
            Metal::from_num(1000),
            Energy::from_num(1000),
        )
    }

    #[test]
    fn production_always_lands() {
        let mut p = player();
        p.energy_stalled = true;
        assert!(p.add_resource_delta(
            Energy::from_num(5),
            Metal::from_num(5),
            Energy::from_num(5),
            Metal::from_num(5)
        ));
        assert_eq!(p.energy_production_buffer, Energy::from_num(5));
        assert_eq!(p.metal_production_buffer, Metal::from_num(5));
    }

    #[test]
    fn stalled_consumption_is_refused_but_recorded() {
        let mut p = player();
        p.energy_stalled = true;
        assert!(!p.add_resource_delta(
            Energy::from_num(-10),
            Metal::ZERO,
            Energy::from_num(-10),
            Metal::ZERO
        ));
        // The desire is still recorded for the next accounting window.
        assert_eq!(p.desired_energy_consumption_buffer, Energy::from_num(10));
        // But nothing was actually consumed.
        assert_eq!(p.actual_energy_consumption_buffer, Energy::ZERO);
    }

    #[test]
    fn unstalled_consumption_is_committed() {
        let mut p = player();
        assert!(p.add_resource_delta(
            Energy::from_num(-10),
            Metal::from_num(-3),
            Energy::from_num(-10),
            Metal::from_num(-3)
        ));
        assert_eq!(p.actual_energy_consumption_buffer, Energy::from_num(10));
        assert_eq!(p.actual_metal_consumption_buffer, Metal::from_num(3));
    }
}

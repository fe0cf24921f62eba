//! Events emitted by the simulation for the presentation layer.
//!
//! The kernel appends to its event vector during a tick; the presenter drains
//! it exactly once before the next tick. Events never feed back into state.

use crate::game::math::SimVector;
use crate::game::projectile::ProjectileId;
use crate::game::unit::UnitId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SfxType {
    LightSmoke,
    BlackSmoke,
    Wake1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitDeathType {
    NormalExploded,
    WaterExploded,
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectileDeathType {
    OutOfBounds,
    NormalImpact,
    WaterImpact,
    EndOfLife,
}

#[derive(Clone, Debug)]
pub enum GameEvent {
    FireWeapon {
        weapon_type: String,
        /// The number of this shot within the weapon's current burst,
        /// starting from 0.
        shot_number: u32,
        fire_point: SimVector,
    },
    UnitArrived {
        unit_id: UnitId,
    },
    UnitActivated {
        unit_id: UnitId,
    },
    UnitDeactivated {
        unit_id: UnitId,
    },
    UnitComplete {
        unit_id: UnitId,
    },
    EmitParticleFromPiece {
        sfx_type: SfxType,
        unit_id: UnitId,
        piece_name: String,
    },
    UnitSpawned {
        unit_id: UnitId,
    },
    UnitDied {
        unit_id: UnitId,
        unit_type: String,
        position: SimVector,
        death_type: UnitDeathType,
    },
    UnitStartedBuilding {
        unit_id: UnitId,
    },
    ProjectileSpawned {
        projectile_id: ProjectileId,
    },
    ProjectileDied {
        projectile_id: ProjectileId,
        weapon_type: String,
        position: SimVector,
        death_type: ProjectileDeathType,
    },
}

//! Projectiles in flight.
//!
//! A projectile is created by a unit weapon (or by a dying unit's explosion
//! weapon), integrates once per tick, and dies on impact, timer expiry or
//! leaving the map. Its damage table is copied from the weapon definition at
//! creation time so that in-flight projectiles outlive their firing unit.

use rustc_hash::FxHashMap;

use crate::game::collections::TypedId;
use crate::game::definitions::DEFAULT_DAMAGE_KEY;
use crate::game::math::SimVector;
use crate::game::player::PlayerId;
use crate::game::unit::UnitId;
use crate::game::GameTime;
use crate::game::SimScalar;

pub struct ProjectileIdTag;
pub type ProjectileId = TypedId<ProjectileIdTag>;

#[derive(Clone, Debug)]
pub struct Projectile {
    pub weapon_type: String,
    pub owner: PlayerId,
    pub position: SimVector,
    pub previous_position: SimVector,
    pub origin: SimVector,
    /// World units per tick.
    pub velocity: SimVector,
    pub ground_bounce: bool,
    pub damage: FxHashMap<String, u32>,
    pub damage_radius: SimScalar,
    /// Tick on which the projectile expires, if it has a lifetime.
    pub die_on_frame: Option<GameTime>,
    pub created_at: GameTime,
    pub target_unit: Option<UnitId>,
    pub is_dead: bool,
}

impl Projectile {
    pub fn get_damage(&self, unit_type: &str) -> u32 {
        self.damage
            .get(unit_type)
            .or_else(|| self.damage.get(DEFAULT_DAMAGE_KEY))
            .copied()
            .unwrap_or(0)
    }
}

/// Why a projectile stopped existing this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectileCollisionInfo {
    OutOfBounds,
    Sea,
    Terrain,
    UnitOrFeatureOrBuilding,
}

//! Static definition tables supplied by the asset loader.
//!
//! The kernel receives these at construction and never mutates them. Name
//! lookups go through `FxHashMap`; simulation code only ever performs point
//! lookups on these tables, never ordered iteration, so hash-map ordering
//! cannot leak into state.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::game::angle::SimAngle;
use crate::game::grid::Grid;
use crate::game::math::{SimScalar, SimVector};
use crate::game::player::{Energy, Metal};

/// Key used in weapon damage tables when a unit's armor class has no entry.
pub const DEFAULT_DAMAGE_KEY: &str = "DEFAULT";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementClassDefinition {
    pub name: String,
    pub footprint_x: u32,
    pub footprint_z: u32,
    pub min_water_depth: SimScalar,
    pub max_water_depth: SimScalar,
    pub max_slope: SimScalar,
    pub max_water_slope: SimScalar,
}

impl MovementClassDefinition {
    /// A permissive class for units with no terrain restrictions configured.
    pub fn ad_hoc(footprint_x: u32, footprint_z: u32) -> Self {
        Self {
            name: String::new(),
            footprint_x,
            footprint_z,
            min_water_depth: SimScalar::ZERO,
            max_water_depth: SimScalar::from_num(255),
            max_slope: SimScalar::from_num(255),
            max_water_slope: SimScalar::from_num(255),
        }
    }
}

/// How a unit's collision footprint and terrain limits are sourced: inline
/// attributes on the unit, or a shared named movement class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementCollisionInfo {
    AdHoc(MovementClassDefinition),
    Named(String),
}

/// Classification of one yard-map cell under a building's footprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum YardMapCell {
    Ground,
    GroundPassableWhenOpen,
    GroundPassableWhenClosed,
    GroundPassable,
    GroundNoFeature,
    GroundGeoPassableWhenOpen,
    Geo,
    Water,
    WaterPassableWhenOpen,
    WaterPassable,
    Passable,
}

pub fn is_passable(cell: YardMapCell, yard_map_open: bool) -> bool {
    match cell {
        YardMapCell::GroundPassableWhenOpen
        | YardMapCell::WaterPassableWhenOpen
        | YardMapCell::GroundGeoPassableWhenOpen => yard_map_open,
        YardMapCell::GroundPassableWhenClosed => !yard_map_open,
        YardMapCell::GroundNoFeature
        | YardMapCell::Geo
        | YardMapCell::Ground
        | YardMapCell::Water => false,
        YardMapCell::GroundPassable | YardMapCell::WaterPassable | YardMapCell::Passable => true,
    }
}

pub fn is_water(cell: YardMapCell) -> bool {
    matches!(
        cell,
        YardMapCell::Water | YardMapCell::WaterPassableWhenOpen | YardMapCell::WaterPassable
    )
}

#[derive(Clone, Debug)]
pub struct UnitDefinition {
    pub unit_type: String,
    pub object_name: String,
    pub sound_category: String,

    pub movement_collision_info: MovementCollisionInfo,
    pub yard_map: Option<Grid<YardMapCell>>,

    pub max_hit_points: u32,
    pub build_time: u32,
    pub build_cost_energy: Energy,
    pub build_cost_metal: Metal,

    pub is_mobile: bool,
    pub can_move: bool,
    pub commander: bool,
    pub floater: bool,
    pub can_hover: bool,
    pub can_fly: bool,
    pub activate_when_built: bool,
    pub builder: bool,
    pub show_player_name: bool,
    pub hide_damage: bool,

    pub worker_time_per_tick: u32,
    pub build_distance: SimScalar,
    pub cruise_altitude: SimScalar,

    /// Movement rates in world units (or angle units) per tick.
    pub max_speed: SimScalar,
    pub acceleration: SimScalar,
    pub brake_rate: SimScalar,
    pub turn_rate: SimAngle,

    pub energy_storage: Energy,
    pub metal_storage: Metal,
    pub energy_make: Energy,
    pub metal_make: Metal,
    pub energy_use: Energy,
    pub metal_use: Metal,
    pub extracts_metal: Metal,

    pub weapon1: Option<String>,
    pub weapon2: Option<String>,
    pub weapon3: Option<String>,

    /// Weapon detonated in place when the unit dies.
    pub explode_as: Option<String>,
    /// Feature left behind when the unit dies.
    pub corpse: Option<String>,
}

impl UnitDefinition {
    pub fn weapon_name(&self, index: usize) -> Option<&String> {
        match index {
            0 => self.weapon1.as_ref(),
            1 => self.weapon2.as_ref(),
            2 => self.weapon3.as_ref(),
            _ => None,
        }
    }
}

/// Projectile physics selected by a weapon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectilePhysicsType {
    Ballistic,
    LineOfSight,
    /// Homing; `turn_rate` is radians per tick.
    Tracking {
        turn_rate: SimScalar,
    },
}

#[derive(Clone, Debug)]
pub struct WeaponDefinition {
    pub weapon_type: String,
    /// World units per tick.
    pub velocity: SimScalar,
    /// Damage by target unit type, with a `DEFAULT` fallback entry.
    pub damage: FxHashMap<String, u32>,
    pub damage_radius: SimScalar,
    /// Seconds between bursts.
    pub reload_time: SimScalar,
    pub burst: u32,
    /// Seconds between shots within a burst.
    pub burst_interval: SimScalar,
    pub max_range: SimScalar,
    pub tolerance: SimAngle,
    pub pitch_tolerance: SimAngle,
    pub spray_angle: SimAngle,
    pub command_fire: bool,
    /// Fixed projectile lifetime in ticks, if set.
    pub weapon_timer: Option<u32>,
    /// Random spread (in ticks) applied around `weapon_timer`.
    pub random_decay: Option<u32>,
    pub ground_bounce: bool,
    pub physics_type: ProjectilePhysicsType,
}

impl WeaponDefinition {
    pub fn damage_against(&self, unit_type: &str) -> u32 {
        self.damage
            .get(unit_type)
            .or_else(|| self.damage.get(DEFAULT_DAMAGE_KEY))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct FeatureDefinition {
    pub name: String,
    pub footprint_x: u32,
    pub footprint_z: u32,
    pub height: SimScalar,
    pub blocking: bool,
    pub indestructible: bool,
    pub reclaimable: bool,
    /// Metal grid value stamped under non-blocking indestructible features.
    pub metal: u8,
    pub metal_value: Metal,
    pub energy_value: Energy,
}

#[derive(Clone, Debug)]
pub struct UnitPieceDefinition {
    pub name: String,
    pub origin: SimVector,
    pub parent: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct UnitModelDefinition {
    pub object_name: String,
    pub height: SimScalar,
    pub pieces: Vec<UnitPieceDefinition>,
    /// Upper-cased piece name -> index into `pieces`.
    pub piece_indices_by_name: FxHashMap<String, usize>,
}

impl UnitModelDefinition {
    pub fn new(object_name: String, height: SimScalar, pieces: Vec<UnitPieceDefinition>) -> Self {
        let piece_indices_by_name = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.to_uppercase(), i))
            .collect();
        Self {
            object_name,
            height,
            pieces,
            piece_indices_by_name,
        }
    }
}

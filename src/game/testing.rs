//! Deterministic test harness: world builders, definition factories and a
//! tiny script assembler.
//!
//! Integration tests and tools build small worlds through this module so
//! that scenarios are reproducible: fixed RNG seed, flat terrain, and unit
//! types with known kinematics.

use std::sync::Arc;

use crate::game::angle::SimAngle;
use crate::game::cob::script::{CobFunction, CobScript, OpCode};
use crate::game::config::SimConfig;
use crate::game::definitions::{
    MovementClassDefinition, MovementCollisionInfo, ProjectilePhysicsType, UnitDefinition,
    UnitModelDefinition, UnitPieceDefinition, WeaponDefinition, DEFAULT_DAMAGE_KEY,
};
use crate::game::math::{SimScalar, SimVector};
use crate::game::player::{Energy, GamePlayerInfo, GamePlayerType, Metal, PlayerId};
use crate::game::simulation::GameSimulation;
use crate::game::terrain::MapTerrain;
use crate::game::unit::UnitId;
use crate::game::SimError;

// ============================================================================
// Script assembly
// ============================================================================

/// Assembles compiled scripts instruction word by instruction word.
#[derive(Default)]
pub struct CobScriptBuilder {
    instructions: Vec<u32>,
    functions: Vec<CobFunction>,
    pieces: Vec<String>,
}

impl CobScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn piece(&mut self, name: &str) -> usize {
        self.pieces.push(name.to_string());
        self.pieces.len() - 1
    }

    /// Starts a new exported function at the current address.
    pub fn begin_function(&mut self, name: &str) -> &mut Self {
        self.functions.push(CobFunction {
            name: name.to_string(),
            address: self.instructions.len(),
        });
        self
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.instructions.push(op as u32);
        self
    }

    pub fn word(&mut self, word: u32) -> &mut Self {
        self.instructions.push(word);
        self
    }

    pub fn push_constant(&mut self, value: i32) -> &mut Self {
        self.op(OpCode::PushConstant).word(value as u32)
    }

    pub fn pop_local_var(&mut self, id: u32) -> &mut Self {
        self.op(OpCode::PopLocalVar).word(id)
    }

    /// `RETURN`, with the given return value pushed first.
    pub fn ret(&mut self, value: i32) -> &mut Self {
        self.push_constant(value).op(OpCode::Return)
    }

    pub fn build(&mut self) -> CobScript {
        CobScript {
            instructions: std::mem::take(&mut self.instructions),
            functions: std::mem::take(&mut self.functions),
            pieces: std::mem::take(&mut self.pieces),
        }
    }
}

/// A script exporting `Create` plus a set of synchronous queries, each
/// returning a fixed value through its first out-parameter.
pub fn script_with_queries(pieces: &[&str], queries: &[(&str, i32)]) -> CobScript {
    let mut builder = CobScriptBuilder::new();
    for piece in pieces {
        builder.piece(piece);
    }

    builder.begin_function("Create").ret(0);

    for (name, value) in queries {
        builder
            .begin_function(name)
            .push_constant(*value)
            .pop_local_var(0)
            .ret(1);
    }

    builder.build()
}

// ============================================================================
// Definitions
// ============================================================================

/// A mobile ground unit with simple kinematics and no weapons.
pub fn minimal_definition(unit_type: &str) -> UnitDefinition {
    UnitDefinition {
        unit_type: unit_type.to_uppercase(),
        object_name: unit_type.to_uppercase(),
        sound_category: String::new(),
        movement_collision_info: MovementCollisionInfo::AdHoc(MovementClassDefinition::ad_hoc(
            2, 2,
        )),
        yard_map: None,
        max_hit_points: 100,
        build_time: 100,
        build_cost_energy: Energy::from_num(100),
        build_cost_metal: Metal::from_num(50),
        is_mobile: true,
        can_move: true,
        commander: false,
        floater: false,
        can_hover: false,
        can_fly: false,
        activate_when_built: false,
        builder: false,
        show_player_name: false,
        hide_damage: false,
        worker_time_per_tick: 10,
        build_distance: SimScalar::from_num(90),
        cruise_altitude: SimScalar::from_num(60),
        max_speed: SimScalar::from_num(2),
        acceleration: SimScalar::ONE,
        brake_rate: SimScalar::from_num(0.5),
        turn_rate: SimAngle::new(1000),
        energy_storage: Energy::from_num(100),
        metal_storage: Metal::from_num(100),
        energy_make: Energy::ZERO,
        metal_make: Metal::ZERO,
        energy_use: Energy::ZERO,
        metal_use: Metal::ZERO,
        extracts_metal: Metal::ZERO,
        weapon1: None,
        weapon2: None,
        weapon3: None,
        explode_as: None,
        corpse: None,
    }
}

pub fn minimal_model(object_name: &str, pieces: &[(&str, SimVector)]) -> UnitModelDefinition {
    let piece_definitions = pieces
        .iter()
        .map(|(name, origin)| UnitPieceDefinition {
            name: name.to_string(),
            origin: *origin,
            parent: None,
        })
        .collect();
    UnitModelDefinition::new(
        object_name.to_uppercase(),
        SimScalar::from_num(20),
        piece_definitions,
    )
}

/// A line-of-sight test weapon.
pub fn minimal_weapon(weapon_type: &str) -> WeaponDefinition {
    let mut damage = rustc_hash::FxHashMap::default();
    damage.insert(DEFAULT_DAMAGE_KEY.to_string(), 10);
    WeaponDefinition {
        weapon_type: weapon_type.to_uppercase(),
        velocity: SimScalar::from_num(10),
        damage,
        damage_radius: SimScalar::from_num(4),
        reload_time: SimScalar::ONE,
        burst: 1,
        burst_interval: SimScalar::from_num(0.2),
        max_range: SimScalar::from_num(200),
        tolerance: SimAngle::new(4000),
        pitch_tolerance: SimAngle::new(4000),
        spray_angle: SimAngle::ZERO,
        command_fire: false,
        weapon_timer: None,
        random_decay: None,
        ground_bounce: false,
        physics_type: ProjectilePhysicsType::LineOfSight,
    }
}

// ============================================================================
// Worlds
// ============================================================================

/// A flat 64x64-cell world at ground height 10 with sea level 0, RNG seed 0.
pub fn flat_world() -> GameSimulation {
    let terrain = MapTerrain::flat(64, 64, 10, SimScalar::ZERO);
    GameSimulation::new(terrain, 0, SimConfig::default())
}

/// A flat world with sea level above the ground, so everything is underwater.
pub fn flooded_world(ground_height: u8, sea_level: i64) -> GameSimulation {
    let terrain = MapTerrain::flat(64, 64, ground_height, SimScalar::from_num(sea_level));
    GameSimulation::new(terrain, 0, SimConfig::default())
}

pub fn add_test_player(sim: &mut GameSimulation, metal: i64, energy: i64) -> PlayerId {
    sim.add_player(GamePlayerInfo::new(
        None,
        GamePlayerType::Human,
        sim.players.len() as u32,
        "ARM".to_string(),
        Metal::from_num(metal),
        Energy::from_num(energy),
    ))
}

/// Registers a unit type with a single-piece model and a `Create`-only script.
pub fn register_unit_type(sim: &mut GameSimulation, definition: UnitDefinition) {
    let script = script_with_queries(&["base"], &[]);
    register_unit_type_with_script(sim, definition, script);
}

pub fn register_unit_type_with_script(
    sim: &mut GameSimulation,
    definition: UnitDefinition,
    script: CobScript,
) {
    let model = minimal_model(
        &definition.object_name,
        &script
            .pieces
            .iter()
            .map(|p| (p.as_str(), SimVector::ZERO))
            .collect::<Vec<_>>(),
    );
    register_unit_type_full(sim, definition, model, script);
}

pub fn register_unit_type_full(
    sim: &mut GameSimulation,
    definition: UnitDefinition,
    model: UnitModelDefinition,
    script: CobScript,
) {
    sim.unit_model_definitions
        .insert(model.object_name.clone(), Arc::new(model));
    sim.unit_script_definitions
        .insert(definition.unit_type.clone(), Arc::new(script));
    sim.unit_definitions
        .insert(definition.unit_type.clone(), Arc::new(definition));
}

pub fn register_weapon(sim: &mut GameSimulation, weapon: WeaponDefinition) {
    sim.weapon_definitions
        .insert(weapon.weapon_type.clone(), Arc::new(weapon));
}

/// Spawns a unit and immediately completes its construction, as the debug
/// spawn path does.
pub fn spawn_completed_unit(
    sim: &mut GameSimulation,
    unit_type: &str,
    owner: PlayerId,
    position: SimVector,
    rotation: Option<SimAngle>,
) -> Result<Option<UnitId>, SimError> {
    let Some(unit_id) = sim.try_spawn_unit(unit_type, owner, position, rotation)? else {
        return Ok(None);
    };
    let definition = sim.get_unit_definition(&unit_type.to_uppercase())?;
    sim.get_unit_mut(unit_id)?.finish_building(&definition);
    Ok(Some(unit_id))
}

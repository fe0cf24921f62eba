//! The read-only query surface a renderer draws from.
//!
//! A presentation layer runs at display rate and interpolates between the
//! previous and current tick. Nothing here mutates simulation state, and
//! nothing in the simulation depends on whether it is ever called.

use crate::game::angle::SimAngle;
use crate::game::math::{Matrix4x, SimVector};
use crate::game::simulation::GameSimulation;
use crate::game::unit::{UnitId, UnitState};
use crate::game::SimError;

/// A snapshot of the data needed to draw one unit with interpolation.
#[derive(Clone, Debug)]
pub struct UnitRenderInfo {
    pub unit_type: String,
    pub object_name: String,
    pub previous_position: SimVector,
    pub position: SimVector,
    pub previous_rotation: SimAngle,
    pub rotation: SimAngle,
    pub build_fraction_complete: (u32, u32),
    pub hit_points: u32,
    pub max_hit_points: u32,
    pub show_player_name: bool,
    pub hide_damage: bool,
}

pub fn get_unit_render_info(
    sim: &GameSimulation,
    unit_id: UnitId,
) -> Result<UnitRenderInfo, SimError> {
    let unit = sim.get_unit(unit_id)?;
    let definition = sim.get_unit_definition(&unit.unit_type)?;
    Ok(UnitRenderInfo {
        unit_type: unit.unit_type.clone(),
        object_name: definition.object_name.clone(),
        previous_position: unit.previous_position,
        position: unit.position,
        previous_rotation: unit.previous_rotation,
        rotation: unit.rotation,
        build_fraction_complete: (unit.build_time_completed, definition.build_time),
        hit_points: unit.hit_points,
        max_hit_points: definition.max_hit_points,
        show_player_name: definition.show_player_name,
        hide_damage: definition.hide_damage,
    })
}

/// Per-piece world transforms for a unit, in model piece order.
pub fn get_unit_piece_transforms(
    sim: &GameSimulation,
    unit_id: UnitId,
) -> Result<Vec<(String, Matrix4x)>, SimError> {
    let unit = sim.get_unit(unit_id)?;
    let piece_names: Vec<String> = unit.pieces.iter().map(|p| p.name.clone()).collect();
    piece_names
        .into_iter()
        .map(|name| {
            let transform = sim.get_unit_piece_transform(unit_id, &name)?;
            Ok((name, transform))
        })
        .collect()
}

/// Whether a piece should currently be drawn.
pub fn is_piece_visible(unit: &UnitState, piece_name: &str) -> bool {
    unit.find_piece(piece_name).map(|p| p.visible).unwrap_or(false)
}

/// Active nanolathe beams to draw: builder id, target id, beam origin.
pub fn get_nanolathe_beams(sim: &GameSimulation) -> Vec<(UnitId, UnitId, SimVector)> {
    sim.units
        .iter()
        .filter_map(|(id, unit)| {
            unit.get_active_nanolathe_target()
                .map(|(target, origin)| (id, target, origin))
        })
        .collect()
}

/// Projectile positions with their previous-tick positions for interpolation.
pub fn get_projectile_render_positions(
    sim: &GameSimulation,
) -> Vec<(SimVector, SimVector, String)> {
    sim.projectiles
        .iter()
        .map(|(_, p)| (p.previous_position, p.position, p.weapon_type.clone()))
        .collect()
}

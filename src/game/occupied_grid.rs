//! The occupancy grid backing collision queries.
//!
//! One cell per heightmap cell. Mobile units claim their footprint with
//! `OccupiedType::Unit`; buildings stamp `BuildingOccupiedCell`s through
//! their yard map so that individual cells can be passable while the yard
//! is open. A cell is traversable iff nothing occupies it and any building
//! cell present is passable.

use crate::game::definitions::{is_passable, YardMapCell};
use crate::game::feature::FeatureId;
use crate::game::grid::{Grid, GridRegion};
use crate::game::unit::UnitId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OccupiedType {
    #[default]
    None,
    Unit(UnitId),
    Feature(FeatureId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildingOccupiedCell {
    pub unit: UnitId,
    pub passable: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OccupiedCell {
    pub occupied_type: OccupiedType,
    pub building_cell: Option<BuildingOccupiedCell>,
}

pub type OccupiedGrid = Grid<OccupiedCell>;

/// Whether any cell in the region blocks placement or movement.
pub fn is_region_colliding(grid: &OccupiedGrid, region: GridRegion) -> bool {
    grid.any(region, |cell| {
        match cell.occupied_type {
            OccupiedType::None => {}
            OccupiedType::Unit(_) | OccupiedType::Feature(_) => return true,
        }
        matches!(cell.building_cell, Some(b) if !b.passable)
    })
}

/// Like `is_region_colliding`, but cells owned by `this_unit` do not count.
pub fn is_region_colliding_for(grid: &OccupiedGrid, region: GridRegion, this_unit: UnitId) -> bool {
    grid.any(region, |cell| {
        let occupied = match cell.occupied_type {
            OccupiedType::None => false,
            OccupiedType::Unit(u) => u != this_unit,
            OccupiedType::Feature(_) => true,
        };
        if occupied {
            return true;
        }
        matches!(cell.building_cell, Some(b) if b.unit != this_unit && !b.passable)
    })
}

/// Whether opening or closing a yard map would trap something: any cell that
/// would become impassable while a unit or feature stands on it.
pub fn is_yardmap_blocked(
    grid: &OccupiedGrid,
    x: usize,
    y: usize,
    yard_map: &Grid<YardMapCell>,
    open: bool,
) -> bool {
    grid.any2(x, y, yard_map, |cell, yard_cell| {
        if is_passable(*yard_cell, open) {
            return false;
        }
        !matches!(cell.occupied_type, OccupiedType::None)
    })
}

/// Stamps a building's yard map over its footprint region.
pub fn stamp_yard_map(
    grid: &mut OccupiedGrid,
    x: usize,
    y: usize,
    unit: UnitId,
    yard_map: &Grid<YardMapCell>,
    open: bool,
) {
    grid.for_each2_mut(x, y, yard_map, |cell, yard_cell| {
        cell.building_cell = Some(BuildingOccupiedCell {
            unit,
            passable: is_passable(*yard_cell, open),
        });
    });
}

/// Moves a mobile unit's claimed footprint from one region to another.
pub fn move_unit_occupied_area(
    grid: &mut OccupiedGrid,
    old_region: GridRegion,
    new_region: GridRegion,
    unit: UnitId,
) {
    grid.for_each_mut(old_region, |cell| cell.occupied_type = OccupiedType::None);
    grid.for_each_mut(new_region, |cell| cell.occupied_type = OccupiedType::Unit(unit));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::grid::DiscreteRect;

    fn unit_id(index: u32) -> UnitId {
        UnitId::new(index, 0)
    }

    #[test]
    fn empty_grid_does_not_collide() {
        let grid = OccupiedGrid::filled(8, 8, OccupiedCell::default());
        let region = grid.try_to_region(DiscreteRect::new(1, 1, 3, 3)).unwrap();
        assert!(!is_region_colliding(&grid, region));
    }

    #[test]
    fn unit_footprint_collides_except_for_self() {
        let mut grid = OccupiedGrid::filled(8, 8, OccupiedCell::default());
        let region = grid.try_to_region(DiscreteRect::new(2, 2, 2, 2)).unwrap();
        grid.for_each_mut(region, |c| c.occupied_type = OccupiedType::Unit(unit_id(4)));

        let probe = grid.try_to_region(DiscreteRect::new(3, 3, 2, 2)).unwrap();
        assert!(is_region_colliding(&grid, probe));
        assert!(!is_region_colliding_for(&grid, probe, unit_id(4)));
        assert!(is_region_colliding_for(&grid, probe, unit_id(5)));
    }

    #[test]
    fn passable_building_cells_do_not_collide() {
        let mut grid = OccupiedGrid::filled(8, 8, OccupiedCell::default());
        let yard_map = Grid::filled(2, 2, YardMapCell::GroundPassableWhenOpen);
        stamp_yard_map(&mut grid, 1, 1, unit_id(7), &yard_map, true);

        let probe = grid.try_to_region(DiscreteRect::new(1, 1, 2, 2)).unwrap();
        assert!(!is_region_colliding(&grid, probe));

        stamp_yard_map(&mut grid, 1, 1, unit_id(7), &yard_map, false);
        assert!(is_region_colliding(&grid, probe));
        // The owning building itself ignores its own cells.
        assert!(!is_region_colliding_for(&grid, probe, unit_id(7)));
    }

    #[test]
    fn yardmap_close_is_blocked_by_occupant() {
        let mut grid = OccupiedGrid::filled(8, 8, OccupiedCell::default());
        let yard_map = Grid::filled(2, 2, YardMapCell::GroundPassableWhenOpen);
        // A unit is standing on one of the yard cells.
        grid.get_mut(1, 1).occupied_type = OccupiedType::Unit(unit_id(3));
        assert!(is_yardmap_blocked(&grid, 1, 1, &yard_map, false));
        assert!(!is_yardmap_blocked(&grid, 1, 1, &yard_map, true));
    }
}

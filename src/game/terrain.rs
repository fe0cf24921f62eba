//! The simulation's view of map terrain.
//!
//! The heightmap is a grid of byte heights, one cell per 16x16 world units,
//! with the map centered on the world origin. Everything here is read-only
//! during play; the asset loader constructs it once at game start.

use crate::game::definitions::MovementClassDefinition;
use crate::game::grid::{Grid, GridCoordinates};
use crate::game::math::{SimScalar, SimVector};

pub const HEIGHT_TILE_WIDTH_IN_WORLD_UNITS: i64 = 16;
pub const HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS: i64 = 16;

pub struct MapTerrain {
    heights: Grid<u8>,
    sea_level: SimScalar,
}

impl MapTerrain {
    pub fn new(heights: Grid<u8>, sea_level: SimScalar) -> Self {
        Self { heights, sea_level }
    }

    /// A flat map of the given heightmap dimensions, for tests and tools.
    pub fn flat(width: usize, height: usize, ground_height: u8, sea_level: SimScalar) -> Self {
        Self::new(Grid::filled(width, height, ground_height), sea_level)
    }

    pub fn height_map(&self) -> &Grid<u8> {
        &self.heights
    }

    pub fn get_sea_level(&self) -> SimScalar {
        self.sea_level
    }

    pub fn width_in_world_units(&self) -> SimScalar {
        SimScalar::from_num(self.heights.width() as i64 * HEIGHT_TILE_WIDTH_IN_WORLD_UNITS)
    }

    pub fn height_in_world_units(&self) -> SimScalar {
        SimScalar::from_num(self.heights.height() as i64 * HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS)
    }

    /// Continuous world -> heightmap space. The map is centered on the origin.
    pub fn world_to_heightmap_space(&self, v: SimVector) -> SimVector {
        SimVector::new(
            (v.x + self.width_in_world_units() / SimScalar::from_num(2))
                / SimScalar::from_num(HEIGHT_TILE_WIDTH_IN_WORLD_UNITS),
            v.y,
            (v.z + self.height_in_world_units() / SimScalar::from_num(2))
                / SimScalar::from_num(HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS),
        )
    }

    pub fn heightmap_to_world_space(&self, v: SimVector) -> SimVector {
        SimVector::new(
            v.x * SimScalar::from_num(HEIGHT_TILE_WIDTH_IN_WORLD_UNITS)
                - self.width_in_world_units() / SimScalar::from_num(2),
            v.y,
            v.z * SimScalar::from_num(HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS)
                - self.height_in_world_units() / SimScalar::from_num(2),
        )
    }

    /// The heightmap cell containing the given world position (floor).
    pub fn world_to_heightmap_coordinate(&self, v: SimVector) -> (i32, i32) {
        let h = self.world_to_heightmap_space(v);
        (h.x.floor().to_num::<i32>(), h.z.floor().to_num::<i32>())
    }

    /// The heightmap cell corner nearest the given world position.
    pub fn world_to_heightmap_coordinate_nearest(&self, v: SimVector) -> (i32, i32) {
        let h = self.world_to_heightmap_space(v);
        let half = SimScalar::from_num(0.5);
        (
            (h.x + half).floor().to_num::<i32>(),
            (h.z + half).floor().to_num::<i32>(),
        )
    }

    pub fn heightmap_index_to_world_corner(&self, x: i32, y: i32) -> SimVector {
        self.heightmap_to_world_space(SimVector::new(
            SimScalar::from_num(x),
            SimScalar::ZERO,
            SimScalar::from_num(y),
        ))
    }

    pub fn heightmap_index_to_world_center(&self, c: GridCoordinates) -> SimVector {
        let half = SimScalar::from_num(0.5);
        self.heightmap_to_world_space(SimVector::new(
            SimScalar::from_num(c.x as i64) + half,
            SimScalar::ZERO,
            SimScalar::from_num(c.y as i64) + half,
        ))
    }

    fn corner_height(&self, x: i32, y: i32) -> SimScalar {
        let x = x.clamp(0, self.heights.width() as i32 - 1);
        let y = y.clamp(0, self.heights.height() as i32 - 1);
        SimScalar::from_num(*self.heights.get(x as usize, y as usize))
    }

    /// Terrain height at a world position, bilinearly interpolated between the
    /// four surrounding heightmap corners. Positions outside the map take the
    /// height of the clamped edge.
    pub fn get_height_at(&self, x: SimScalar, z: SimScalar) -> SimScalar {
        let h = self.world_to_heightmap_space(SimVector::new(x, SimScalar::ZERO, z));
        let cx = h.x.floor();
        let cz = h.z.floor();
        let fx = h.x - cx;
        let fz = h.z - cz;
        let (ix, iz) = (cx.to_num::<i32>(), cz.to_num::<i32>());

        let top = {
            let a = self.corner_height(ix, iz);
            let b = self.corner_height(ix + 1, iz);
            a + (b - a) * fx
        };
        let bottom = {
            let a = self.corner_height(ix, iz + 1);
            let b = self.corner_height(ix + 1, iz + 1);
            a + (b - a) * fx
        };
        top + (bottom - top) * fz
    }

    /// Walks a line segment in fixed steps and returns the first sampled point
    /// at or below the terrain surface.
    pub fn intersect_line(&self, start: SimVector, end: SimVector) -> Option<SimVector> {
        let delta = end - start;
        let length = delta.length();
        if length == SimScalar::ZERO {
            let h = self.get_height_at(start.x, start.z);
            return (start.y <= h).then_some(start);
        }

        let step_len = SimScalar::from_num(HEIGHT_TILE_WIDTH_IN_WORLD_UNITS / 2);
        let steps = (length / step_len).ceil().to_num::<i64>().max(1);
        let step = delta / SimScalar::from_num(steps);

        let mut p = start;
        for _ in 0..=steps {
            let h = self.get_height_at(p.x, p.z);
            if p.y <= h {
                p.y = h;
                return Some(p);
            }
            p += step;
        }
        None
    }

    /// Whether a footprint anchored at heightmap cell `(x, y)` is traversable
    /// terrain for the given movement class: slope and water depth within the
    /// class limits across every cell of the footprint.
    pub fn is_grid_point_walkable(&self, mc: &MovementClassDefinition, x: i32, y: i32) -> bool {
        for dy in 0..mc.footprint_z as i32 {
            for dx in 0..mc.footprint_x as i32 {
                if !self.is_cell_walkable(mc, x + dx, y + dy) {
                    return false;
                }
            }
        }
        true
    }

    fn is_cell_walkable(&self, mc: &MovementClassDefinition, x: i32, y: i32) -> bool {
        if x < 0
            || y < 0
            || x as usize + 1 >= self.heights.width()
            || y as usize + 1 >= self.heights.height()
        {
            return false;
        }

        let corners = [
            self.corner_height(x, y),
            self.corner_height(x + 1, y),
            self.corner_height(x, y + 1),
            self.corner_height(x + 1, y + 1),
        ];
        let min = corners.iter().copied().fold(corners[0], |a, b| a.min(b));
        let max = corners.iter().copied().fold(corners[0], |a, b| a.max(b));

        let depth = if self.sea_level > min {
            self.sea_level - min
        } else {
            SimScalar::ZERO
        };
        if depth < mc.min_water_depth || depth > mc.max_water_depth {
            return false;
        }

        let slope = max - min;
        let slope_limit = if depth > SimScalar::ZERO {
            mc.max_water_slope
        } else {
            mc.max_slope
        };
        slope <= slope_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terrain() -> MapTerrain {
        MapTerrain::flat(32, 32, 10, SimScalar::from_num(5))
    }

    #[test]
    fn flat_terrain_height_is_uniform() {
        let t = terrain();
        assert_eq!(
            t.get_height_at(SimScalar::ZERO, SimScalar::ZERO),
            SimScalar::from_num(10)
        );
        assert_eq!(
            t.get_height_at(SimScalar::from_num(37.25), SimScalar::from_num(-80)),
            SimScalar::from_num(10)
        );
    }

    #[test]
    fn world_heightmap_round_trip() {
        let t = terrain();
        let w = t.heightmap_index_to_world_corner(7, 9);
        let (x, y) = t.world_to_heightmap_coordinate(w);
        assert_eq!((x, y), (7, 9));
    }

    #[test]
    fn interpolation_blends_between_corners() {
        let mut heights = Grid::filled(4, 4, 0u8);
        heights.set(2, 2, 16);
        let t = MapTerrain::new(heights, SimScalar::ZERO);
        // Halfway along the edge between corner (1,2) = 0 and (2,2) = 16.
        let corner = t.heightmap_index_to_world_corner(1, 2);
        let h = t.get_height_at(corner.x + SimScalar::from_num(8), corner.z);
        assert_eq!(h, SimScalar::from_num(8));
    }

    #[test]
    fn intersect_line_finds_ground() {
        let t = terrain();
        let hit = t
            .intersect_line(SimVector::from_num(0, 100, 0), SimVector::from_num(0, -10, 0))
            .expect("line should hit the ground");
        assert_eq!(hit.y, SimScalar::from_num(10));
    }
}

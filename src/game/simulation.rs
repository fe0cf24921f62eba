//! The simulation kernel.
//!
//! `GameSimulation` owns the whole authoritative world model: terrain,
//! definition tables, entity maps, the PRNG, game time and the event log.
//! `tick()` advances one fixed step; its phase order is contractual and is
//! what keeps every lockstep participant bit-identical.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::game::angle::SimAngle;
use crate::game::behavior;
use crate::game::cob::{run_unit_cob_scripts, CobEnvironment, CobScript};
use crate::game::collections::VecMap;
use crate::game::config::SimConfig;
use crate::game::definitions::{
    FeatureDefinition, MovementClassDefinition, MovementCollisionInfo, UnitDefinition,
    UnitModelDefinition, WeaponDefinition, YardMapCell,
};
use crate::game::events::{GameEvent, ProjectileDeathType, UnitDeathType};
use crate::game::feature::{FeatureDefinitionId, FeatureId, FeatureIdTag, MapFeature};
use crate::game::grid::{DiscreteRect, Grid, GridCoordinates, GridRegion};
use crate::game::hash::{compute_hash_of, GameHash};
use crate::game::math::{clamp, BoundingBox, Matrix4x, SimScalar, SimVector};
use crate::game::occupied_grid::{
    self, is_region_colliding, is_region_colliding_for, is_yardmap_blocked, stamp_yard_map,
    BuildingOccupiedCell, OccupiedCell, OccupiedGrid, OccupiedType,
};
use crate::game::pathfinding::{self, PathRequest};
use crate::game::player::{
    Energy, GamePlayerInfo, GamePlayerStatus, Metal, PlayerId,
};
use crate::game::projectile::{
    Projectile, ProjectileCollisionInfo, ProjectileId, ProjectileIdTag,
};
use crate::game::rng::SimRng;
use crate::game::terrain::{
    MapTerrain, HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS, HEIGHT_TILE_WIDTH_IN_WORLD_UNITS,
};
use crate::game::unit::{
    FactoryBehaviorState, UnitBehaviorState, UnitCreationStatus, UnitId, UnitIdTag, UnitOrder,
    UnitState, UnitWeapon,
};
use crate::game::unit_mesh::UnitMesh;
use crate::game::{sim_tick_delta, GameTime, SimError, SIM_TICKS_PER_SECOND};

/// Gravity applied to ballistic projectiles, world units per tick squared.
pub fn gravity_per_tick() -> SimScalar {
    SimScalar::from_num(112)
        / (SimScalar::from_num(SIM_TICKS_PER_SECOND) * SimScalar::from_num(SIM_TICKS_PER_SECOND))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WinStatus {
    Won { winner: PlayerId },
    Draw,
    Undecided,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImpactType {
    Normal,
    Water,
}

struct CorpseSpawnInfo {
    feature_name: String,
    position: SimVector,
    rotation: SimAngle,
}

pub struct GameSimulation {
    pub rng: SimRng,

    pub terrain: MapTerrain,

    pub unit_definitions: FxHashMap<String, Arc<UnitDefinition>>,
    pub movement_class_definitions: FxHashMap<String, MovementClassDefinition>,
    pub feature_definitions: Vec<FeatureDefinition>,
    pub feature_name_index: FxHashMap<String, FeatureDefinitionId>,
    pub unit_model_definitions: FxHashMap<String, Arc<UnitModelDefinition>>,
    pub unit_script_definitions: FxHashMap<String, Arc<CobScript>>,
    pub weapon_definitions: FxHashMap<String, Arc<WeaponDefinition>>,

    pub occupied_grid: OccupiedGrid,
    /// Airborne units, whose footprints are not marked in the occupied grid.
    pub flying_units_set: BTreeSet<UnitId>,

    pub metal_grid: Grid<u8>,

    pub players: Vec<GamePlayerInfo>,

    pub features: VecMap<MapFeature, FeatureIdTag>,
    pub units: VecMap<UnitState, UnitIdTag>,
    pub projectiles: VecMap<Projectile, ProjectileIdTag>,

    pub path_requests: VecDeque<PathRequest>,
    pub unit_creation_requests: VecDeque<UnitId>,

    pub game_time: GameTime,

    pub events: Vec<GameEvent>,

    pub config: SimConfig,
}

impl GameSimulation {
    pub fn new(terrain: MapTerrain, surface_metal: u8, config: SimConfig) -> Self {
        let grid_width = terrain.height_map().width() - 1;
        let grid_height = terrain.height_map().height() - 1;
        Self {
            rng: SimRng::new(0),
            occupied_grid: OccupiedGrid::filled(grid_width, grid_height, OccupiedCell::default()),
            metal_grid: Grid::filled(grid_width, grid_height, surface_metal),
            terrain,
            unit_definitions: FxHashMap::default(),
            movement_class_definitions: FxHashMap::default(),
            feature_definitions: Vec::new(),
            feature_name_index: FxHashMap::default(),
            unit_model_definitions: FxHashMap::default(),
            unit_script_definitions: FxHashMap::default(),
            weapon_definitions: FxHashMap::default(),
            flying_units_set: BTreeSet::new(),
            players: Vec::new(),
            features: VecMap::new(),
            units: VecMap::new(),
            projectiles: VecMap::new(),
            path_requests: VecDeque::new(),
            unit_creation_requests: VecDeque::new(),
            game_time: GameTime::new(0),
            events: Vec::new(),
            config,
        }
    }

    // ------------------------------------------------------------------
    // Definition lookup
    // ------------------------------------------------------------------

    pub fn get_unit_definition(&self, unit_type: &str) -> Result<Arc<UnitDefinition>, SimError> {
        self.try_get_unit_definition(unit_type)
            .ok_or_else(|| SimError::MissingDefinition(unit_type.to_string()))
    }

    pub fn try_get_unit_definition(&self, unit_type: &str) -> Option<Arc<UnitDefinition>> {
        self.unit_definitions.get(unit_type).cloned()
    }

    pub fn get_model_definition(
        &self,
        object_name: &str,
    ) -> Result<Arc<UnitModelDefinition>, SimError> {
        self.unit_model_definitions
            .get(object_name)
            .cloned()
            .ok_or_else(|| SimError::MissingDefinition(object_name.to_string()))
    }

    pub fn get_weapon_definition(
        &self,
        weapon_type: &str,
    ) -> Result<Arc<WeaponDefinition>, SimError> {
        self.weapon_definitions
            .get(weapon_type)
            .cloned()
            .ok_or_else(|| SimError::MissingDefinition(weapon_type.to_string()))
    }

    pub fn try_get_feature_definition_id(&self, feature_name: &str) -> Option<FeatureDefinitionId> {
        self.feature_name_index
            .get(&feature_name.to_uppercase())
            .copied()
    }

    pub fn get_feature_definition(&self, id: FeatureDefinitionId) -> &FeatureDefinition {
        &self.feature_definitions[id.0]
    }

    pub fn register_feature_definition(&mut self, definition: FeatureDefinition) -> FeatureDefinitionId {
        let id = FeatureDefinitionId(self.feature_definitions.len());
        self.feature_name_index
            .insert(definition.name.to_uppercase(), id);
        self.feature_definitions.push(definition);
        id
    }

    // ------------------------------------------------------------------
    // Entity access
    // ------------------------------------------------------------------

    pub fn get_unit(&self, id: UnitId) -> Result<&UnitState, SimError> {
        self.units.get(id).ok_or(SimError::MissingUnit(id.index))
    }

    pub fn get_unit_mut(&mut self, id: UnitId) -> Result<&mut UnitState, SimError> {
        self.units.get_mut(id).ok_or(SimError::MissingUnit(id.index))
    }

    pub fn unit_exists(&self, id: UnitId) -> bool {
        self.units.contains(id)
    }

    /// Scripts address units by bare slot index.
    pub fn try_get_unit_by_cob_id(&self, cob_id: i32) -> Option<&UnitState> {
        if cob_id < 0 {
            return None;
        }
        self.units.get_by_slot_index(cob_id as u32).map(|(_, u)| u)
    }

    pub fn get_player(&self, player: PlayerId) -> &GamePlayerInfo {
        &self.players[player.0]
    }

    pub fn get_player_mut(&mut self, player: PlayerId) -> &mut GamePlayerInfo {
        &mut self.players[player.0]
    }

    pub fn add_player(&mut self, info: GamePlayerInfo) -> PlayerId {
        let id = PlayerId(self.players.len());
        self.players.push(info);
        id
    }

    pub fn get_feature(&self, id: FeatureId) -> Option<&MapFeature> {
        self.features.get(id)
    }

    /// Drains this tick's events for the presentation layer.
    pub fn drain_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Footprints and collision
    // ------------------------------------------------------------------

    pub fn resolve_movement_class(&self, info: &MovementCollisionInfo) -> MovementClassDefinition {
        match info {
            MovementCollisionInfo::AdHoc(mc) => mc.clone(),
            MovementCollisionInfo::Named(name) => self
                .movement_class_definitions
                .get(name)
                .cloned()
                .unwrap_or_else(|| MovementClassDefinition::ad_hoc(1, 1)),
        }
    }

    pub fn get_footprint_xz(&self, info: &MovementCollisionInfo) -> (u32, u32) {
        let mc = self.resolve_movement_class(info);
        (mc.footprint_x, mc.footprint_z)
    }

    pub fn compute_footprint_region(
        &self,
        position: SimVector,
        footprint_x: u32,
        footprint_z: u32,
    ) -> DiscreteRect {
        let half_x = SimScalar::from_num(footprint_x as i64 * HEIGHT_TILE_WIDTH_IN_WORLD_UNITS)
            / SimScalar::from_num(2);
        let half_z = SimScalar::from_num(footprint_z as i64 * HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS)
            / SimScalar::from_num(2);
        let top_left = SimVector::new(position.x - half_x, position.y, position.z - half_z);
        let (x, y) = self.terrain.world_to_heightmap_coordinate_nearest(top_left);
        DiscreteRect::new(x, y, footprint_x, footprint_z)
    }

    pub fn compute_footprint_region_for(
        &self,
        position: SimVector,
        info: &MovementCollisionInfo,
    ) -> DiscreteRect {
        let (fx, fz) = self.get_footprint_xz(info);
        self.compute_footprint_region(position, fx, fz)
    }

    /// Rects that fall outside the grid always collide.
    pub fn is_collision_at(&self, rect: &DiscreteRect) -> bool {
        match self.occupied_grid.try_to_region(*rect) {
            Some(region) => is_region_colliding(&self.occupied_grid, region),
            None => true,
        }
    }

    pub fn is_collision_at_excluding(&self, rect: &DiscreteRect, this_unit: UnitId) -> bool {
        match self.occupied_grid.try_to_region(*rect) {
            Some(region) => is_region_colliding_for(&self.occupied_grid, region, this_unit),
            None => true,
        }
    }

    pub fn is_adjacent_to_obstacle(&self, rect: &DiscreteRect) -> bool {
        let top = DiscreteRect::new(rect.x - 1, rect.y - 1, rect.width + 2, 1);
        let bottom = DiscreteRect::new(rect.x - 1, rect.y + rect.height as i32, rect.width + 2, 1);
        let left = DiscreteRect::new(rect.x - 1, rect.y, 1, rect.height);
        let right = DiscreteRect::new(rect.x + rect.width as i32, rect.y, 1, rect.height);
        self.is_collision_at(&top)
            || self.is_collision_at(&bottom)
            || self.is_collision_at(&left)
            || self.is_collision_at(&right)
    }

    /// Whether a unit of the given movement class could stand at `(x, y)`:
    /// unoccupied and traversable terrain.
    pub fn can_be_built_at(&self, mc: &MovementClassDefinition, x: i32, y: i32) -> bool {
        let rect = DiscreteRect::new(x, y, mc.footprint_x, mc.footprint_z);
        if self.is_collision_at(&rect) {
            return false;
        }
        self.terrain.is_grid_point_walkable(mc, x, y)
    }

    pub fn move_unit_occupied_area(
        &mut self,
        old_rect: &DiscreteRect,
        new_rect: &DiscreteRect,
        unit_id: UnitId,
    ) {
        let old_region = self
            .occupied_grid
            .try_to_region(*old_rect)
            .expect("old footprint must be on the grid");
        let new_region = self
            .occupied_grid
            .try_to_region(*new_rect)
            .expect("new footprint must be on the grid");
        occupied_grid::move_unit_occupied_area(
            &mut self.occupied_grid,
            old_region,
            new_region,
            unit_id,
        );
    }

    // ------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------

    pub fn add_feature(&mut self, feature: MapFeature) -> FeatureId {
        let definition = self.get_feature_definition(feature.feature_type).clone();
        let position = feature.position;
        let id = self.features.insert(feature);

        let footprint = self.compute_footprint_region(
            position,
            definition.footprint_x,
            definition.footprint_z,
        );

        if definition.blocking {
            let region = self.occupied_grid.clip_region(footprint);
            self.occupied_grid
                .for_each_mut(region, |cell| cell.occupied_type = OccupiedType::Feature(id));
        }

        if !definition.blocking && definition.indestructible && definition.metal > 0 {
            let region = self.metal_grid.clip_region(footprint);
            self.metal_grid.set_region(region, definition.metal);
        }

        id
    }

    /// Places a feature by heightmap cell, at the midpoint height of the
    /// surrounding corners, centered on its footprint.
    pub fn add_feature_at(
        &mut self,
        feature_type: FeatureDefinitionId,
        heightmap_x: i32,
        heightmap_z: i32,
    ) -> FeatureId {
        let definition = self.get_feature_definition(feature_type);
        let footprint_x = definition.footprint_x;
        let footprint_z = definition.footprint_z;

        let mut position = self
            .terrain
            .heightmap_index_to_world_corner(heightmap_x, heightmap_z);
        let heights = self.terrain.height_map();
        if (heightmap_x as usize) < heights.width() - 1 && (heightmap_z as usize) < heights.height() - 1
        {
            let x = heightmap_x as usize;
            let z = heightmap_z as usize;
            let sum = *heights.get(x, z) as i64
                + *heights.get(x + 1, z) as i64
                + *heights.get(x, z + 1) as i64
                + *heights.get(x + 1, z + 1) as i64;
            position.y = SimScalar::from_num(sum / 4);
        }
        position.x += SimScalar::from_num(footprint_x as i64 * HEIGHT_TILE_WIDTH_IN_WORLD_UNITS)
            / SimScalar::from_num(2);
        position.z += SimScalar::from_num(footprint_z as i64 * HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS)
            / SimScalar::from_num(2);

        self.add_feature(MapFeature {
            feature_type,
            position,
            rotation: SimAngle::HALF_TURN,
        })
    }

    pub fn try_spawn_feature(&mut self, feature_name: &str, position: SimVector, rotation: SimAngle) {
        let Some(feature_type) = self.try_get_feature_definition_id(feature_name) else {
            warn!(feature_name, "corpse feature type is not defined");
            return;
        };
        self.add_feature(MapFeature {
            feature_type,
            position,
            rotation,
        });
    }

    // ------------------------------------------------------------------
    // Unit creation
    // ------------------------------------------------------------------

    fn create_unit(
        &mut self,
        unit_type: &str,
        owner: PlayerId,
        position: SimVector,
        rotation: Option<SimAngle>,
    ) -> Result<UnitState, SimError> {
        let unit_type = unit_type.to_uppercase();
        let definition = self.get_unit_definition(&unit_type)?;
        let model = self.get_model_definition(&definition.object_name)?;
        let script = self
            .unit_script_definitions
            .get(&unit_type)
            .cloned()
            .ok_or_else(|| SimError::MissingDefinition(unit_type.clone()))?;

        let mut pieces: Vec<UnitMesh> = model
            .pieces
            .iter()
            .map(|p| UnitMesh::new(p.name.clone()))
            .collect();
        if definition.is_mobile {
            // Mobile units are not shaded.
            for piece in &mut pieces {
                piece.shaded = false;
            }
        }

        let mut unit = UnitState::new(unit_type, pieces, CobEnvironment::new(script));
        unit.owner = owner;
        unit.position = position;
        unit.previous_position = position;

        if let Some(rotation) = rotation {
            unit.rotation = rotation;
            unit.previous_rotation = rotation;
        } else if definition.is_mobile {
            // Face mobile units away from the camera by default.
            unit.rotation = SimAngle::HALF_TURN;
            unit.previous_rotation = SimAngle::HALF_TURN;
        }

        for (i, weapon_slot) in unit.weapons.iter_mut().enumerate() {
            if let Some(name) = definition.weapon_name(i) {
                let weapon_type = name.to_uppercase();
                if self.weapon_definitions.contains_key(&weapon_type) {
                    *weapon_slot = Some(UnitWeapon::new(weapon_type));
                }
            }
        }

        Ok(unit)
    }

    /// Spawns a unit as an unbuilt nanoframe. Returns `None` if the footprint
    /// is blocked.
    pub fn try_spawn_unit(
        &mut self,
        unit_type: &str,
        owner: PlayerId,
        position: SimVector,
        rotation: Option<SimAngle>,
    ) -> Result<Option<UnitId>, SimError> {
        let mut unit = self.create_unit(unit_type, owner, position, rotation)?;
        let definition = self.get_unit_definition(&unit.unit_type)?;

        unit.position.y = self
            .terrain
            .get_height_at(unit.position.x, unit.position.z);
        if definition.floater || definition.can_hover {
            unit.position.y = unit.position.y.max(self.terrain.get_sea_level());
        }
        unit.previous_position = unit.position;

        let Some(unit_id) = self.try_add_unit(unit)? else {
            return Ok(None);
        };

        behavior::on_create(self, unit_id)?;
        self.events.push(GameEvent::UnitSpawned { unit_id });
        Ok(Some(unit_id))
    }

    /// Low-level insert used by loading and the deferred creation pass.
    /// Returns `None` when the unit's footprint collides with something.
    pub fn try_add_unit(&mut self, unit: UnitState) -> Result<Option<UnitId>, SimError> {
        let definition = self.get_unit_definition(&unit.unit_type)?;

        let footprint =
            self.compute_footprint_region_for(unit.position, &definition.movement_collision_info);
        if self.is_collision_at(&footprint) {
            return Ok(None);
        }

        let yard_open = unit.yard_open;
        let unit_id = self.units.insert(unit);

        let region = self
            .occupied_grid
            .try_to_region(footprint)
            .expect("footprint was collision checked");

        if definition.is_mobile {
            self.occupied_grid
                .for_each_mut(region, |cell| cell.occupied_type = OccupiedType::Unit(unit_id));
        } else {
            let yard_map = building_yard_map(&definition, footprint);
            stamp_yard_map(
                &mut self.occupied_grid,
                region.x,
                region.y,
                unit_id,
                &yard_map,
                yard_open,
            );
        }

        Ok(Some(unit_id))
    }

    // ------------------------------------------------------------------
    // Pathfinding
    // ------------------------------------------------------------------

    /// Queues a path request. A unit that re-requests moves to the back of
    /// the queue; its old pending request is discarded.
    pub fn request_path(&mut self, unit_id: UnitId) {
        let request = PathRequest { unit_id };
        if let Some(pos) = self.path_requests.iter().position(|r| *r == request) {
            self.path_requests.remove(pos);
        }
        self.path_requests.push_back(request);
    }

    // ------------------------------------------------------------------
    // Projectiles
    // ------------------------------------------------------------------

    pub fn create_projectile_from_weapon(
        &mut self,
        owner: PlayerId,
        weapon_type: &str,
        position: SimVector,
        direction: SimVector,
        distance_to_target: SimScalar,
        target_unit: Option<UnitId>,
    ) -> Result<Projectile, SimError> {
        let definition = self.get_weapon_definition(weapon_type)?;

        let die_on_frame = if let Some(timer) = definition.weapon_timer {
            let random_decay = definition.random_decay.unwrap_or(0);
            let random_val = if random_decay > 0 {
                self.rng.next_in_range(0, random_decay)
            } else {
                0
            };
            // Lifetime is the timer plus a random spread centered on it.
            let lifetime = (timer as i64 - (random_decay / 2) as i64 + random_val as i64).max(1);
            Some(GameTime::new(self.game_time.value + lifetime as u32))
        } else if matches!(
            definition.physics_type,
            crate::game::definitions::ProjectilePhysicsType::LineOfSight
        ) {
            let flight_ticks =
                crate::game::math::sim_scalar_to_u32(distance_to_target / definition.velocity) + 1;
            Some(self.game_time + flight_ticks)
        } else {
            None
        };

        Ok(Projectile {
            weapon_type: definition.weapon_type.clone(),
            owner,
            position,
            previous_position: position,
            origin: position,
            velocity: direction * definition.velocity,
            ground_bounce: definition.ground_bounce,
            damage: definition.damage.clone(),
            damage_radius: definition.damage_radius,
            die_on_frame,
            created_at: self.game_time,
            target_unit,
            is_dead: false,
        })
    }

    pub fn spawn_projectile(
        &mut self,
        owner: PlayerId,
        weapon_type: &str,
        position: SimVector,
        direction: SimVector,
        distance_to_target: SimScalar,
        target_unit: Option<UnitId>,
    ) -> Result<ProjectileId, SimError> {
        let projectile = self.create_projectile_from_weapon(
            owner,
            weapon_type,
            position,
            direction,
            distance_to_target,
            target_unit,
        )?;
        let projectile_id = self.projectiles.insert(projectile);
        self.events.push(GameEvent::ProjectileSpawned { projectile_id });
        Ok(projectile_id)
    }

    fn update_projectiles(&mut self) -> Result<(), SimError> {
        let game_time = self.game_time;
        for projectile_id in self.projectiles.ids() {
            let Some(projectile) = self.projectiles.get_mut(projectile_id) else {
                continue;
            };
            let weapon = self
                .weapon_definitions
                .get(&projectile.weapon_type)
                .cloned()
                .ok_or_else(|| SimError::MissingDefinition(projectile.weapon_type.clone()))?;

            // Expire on timer.
            if projectile.die_on_frame.is_some_and(|t| t <= game_time) {
                projectile.is_dead = true;
                let (weapon_type, position) =
                    (projectile.weapon_type.clone(), projectile.position);
                self.events.push(GameEvent::ProjectileDied {
                    projectile_id,
                    weapon_type,
                    position,
                    death_type: ProjectileDeathType::EndOfLife,
                });
                continue;
            }

            // Physics.
            match &weapon.physics_type {
                crate::game::definitions::ProjectilePhysicsType::Ballistic => {
                    projectile.velocity.y -= gravity_per_tick();
                }
                crate::game::definitions::ProjectilePhysicsType::LineOfSight => {}
                crate::game::definitions::ProjectilePhysicsType::Tracking { turn_rate } => {
                    match projectile.target_unit.and_then(|t| self.units.get(t)) {
                        Some(target) => {
                            let to_target = target.position - projectile.position;
                            projectile.velocity = crate::game::math::rotate_towards(
                                projectile.velocity,
                                to_target,
                                *turn_rate,
                            );
                        }
                        None => projectile.target_unit = None,
                    }
                }
            }

            // Move.
            projectile.previous_position = projectile.position;
            let velocity = projectile.velocity;
            projectile.position += velocity;

            // Collide.
            let snapshot = projectile.clone();
            match self.check_projectile_collision(&snapshot) {
                None => {}
                Some(ProjectileCollisionInfo::OutOfBounds) => {
                    // Silently remove projectiles that leave the map.
                    self.finish_projectile(projectile_id, ProjectileDeathType::OutOfBounds);
                }
                Some(ProjectileCollisionInfo::Sea) => {
                    self.do_projectile_impact(&snapshot, ImpactType::Water);
                    self.finish_projectile(projectile_id, ProjectileDeathType::WaterImpact);
                }
                Some(ProjectileCollisionInfo::Terrain) => {
                    if snapshot.ground_bounce {
                        if let Some(projectile) = self.projectiles.get_mut(projectile_id) {
                            projectile.velocity.y = SimScalar::ZERO;
                            projectile.position.y = projectile.previous_position.y;
                        }
                    } else {
                        self.do_projectile_impact(&snapshot, ImpactType::Normal);
                        self.finish_projectile(projectile_id, ProjectileDeathType::NormalImpact);
                    }
                }
                Some(ProjectileCollisionInfo::UnitOrFeatureOrBuilding) => {
                    self.do_projectile_impact(&snapshot, ImpactType::Normal);
                    self.finish_projectile(projectile_id, ProjectileDeathType::NormalImpact);
                }
            }
        }
        Ok(())
    }

    fn finish_projectile(&mut self, projectile_id: ProjectileId, death_type: ProjectileDeathType) {
        let Some(projectile) = self.projectiles.get_mut(projectile_id) else {
            return;
        };
        projectile.is_dead = true;
        let (weapon_type, position) = (projectile.weapon_type.clone(), projectile.position);
        self.events.push(GameEvent::ProjectileDied {
            projectile_id,
            weapon_type,
            position,
            death_type,
        });
    }

    /// Collision priority: off the map, then sea surface, then terrain, then
    /// grid occupancy, then flying-unit bounding boxes.
    fn check_projectile_collision(&self, projectile: &Projectile) -> Option<ProjectileCollisionInfo> {
        let p = projectile.position;
        let (cx, cz) = self.terrain.world_to_heightmap_coordinate(p);
        if cx < 0
            || cz < 0
            || cx as usize >= self.occupied_grid.width()
            || cz as usize >= self.occupied_grid.height()
        {
            return Some(ProjectileCollisionInfo::OutOfBounds);
        }

        let terrain_height = self.terrain.get_height_at(p.x, p.z);
        let sea_level = self.terrain.get_sea_level();
        if terrain_height < sea_level && p.y <= sea_level {
            return Some(ProjectileCollisionInfo::Sea);
        }
        if p.y <= terrain_height {
            return Some(ProjectileCollisionInfo::Terrain);
        }

        let cell = self.occupied_grid.get(cx as usize, cz as usize);
        let occupant = match cell.occupied_type {
            OccupiedType::Unit(unit_id) => Some(unit_id),
            OccupiedType::Feature(feature_id) => {
                if let Some(feature) = self.features.get(feature_id) {
                    let definition = self.get_feature_definition(feature.feature_type);
                    if p.y <= feature.position.y + definition.height {
                        return Some(ProjectileCollisionInfo::UnitOrFeatureOrBuilding);
                    }
                }
                None
            }
            OccupiedType::None => None,
        };
        // Projectiles fly through open yard cells.
        let occupant = occupant.or(match cell.building_cell {
            Some(BuildingOccupiedCell { unit, passable: false }) => Some(unit),
            _ => None,
        });
        if let Some(unit_id) = occupant {
            if let Some(unit) = self.units.get(unit_id) {
                if unit.owner != projectile.owner && !unit.is_dead() {
                    if let Ok(bounds) = self.create_bounding_box(unit) {
                        // Ignore shots passing above or below the target.
                        if p.y >= bounds.min.y && p.y <= bounds.max.y {
                            return Some(ProjectileCollisionInfo::UnitOrFeatureOrBuilding);
                        }
                    }
                }
            }
        }

        for &flying_id in &self.flying_units_set {
            let Some(unit) = self.units.get(flying_id) else {
                continue;
            };
            if unit.owner == projectile.owner || unit.is_dead() {
                continue;
            }
            if let Ok(bounds) = self.create_bounding_box(unit) {
                if bounds.contains(p) {
                    return Some(ProjectileCollisionInfo::UnitOrFeatureOrBuilding);
                }
            }
        }

        None
    }

    // ------------------------------------------------------------------
    // Damage
    // ------------------------------------------------------------------

    pub fn create_bounding_box(&self, unit: &UnitState) -> Result<BoundingBox, SimError> {
        let definition = self.get_unit_definition(&unit.unit_type)?;
        let model = self.get_model_definition(&definition.object_name)?;
        let footprint =
            self.compute_footprint_region_for(unit.position, &definition.movement_collision_info);
        let min = self.terrain.heightmap_index_to_world_corner(footprint.x, footprint.y);
        let max = self.terrain.heightmap_index_to_world_corner(
            footprint.x + footprint.width as i32,
            footprint.y + footprint.height as i32,
        );
        Ok(BoundingBox::from_min_max(
            SimVector::new(min.x, unit.position.y, min.z),
            SimVector::new(max.x, unit.position.y + model.height, max.z),
        ))
    }

    pub fn kill_unit(&mut self, unit_id: UnitId) -> Result<(), SimError> {
        let unit = self.get_unit_mut(unit_id)?;
        unit.mark_as_dead();
        let unit_type = unit.unit_type.clone();
        let position = unit.position;
        let owner = unit.owner;

        let definition = self.get_unit_definition(&unit_type)?;
        let under_water = position.y < self.terrain.get_sea_level();
        self.events.push(GameEvent::UnitDied {
            unit_id,
            unit_type,
            position,
            death_type: if under_water {
                UnitDeathType::WaterExploded
            } else {
                UnitDeathType::NormalExploded
            },
        });

        if let Some(explode_as) = definition.explode_as.clone() {
            let impact_type = if under_water {
                ImpactType::Water
            } else {
                ImpactType::Normal
            };
            let projectile = self.create_projectile_from_weapon(
                owner,
                &explode_as,
                position,
                SimVector::from_num(0, -1, 0),
                SimScalar::ZERO,
                None,
            )?;
            self.do_projectile_impact(&projectile, impact_type);
        }
        Ok(())
    }

    pub fn apply_damage(&mut self, unit_id: UnitId, damage_points: u32) -> Result<(), SimError> {
        let unit = self.get_unit_mut(unit_id)?;
        if unit.hit_points <= damage_points {
            unit.hit_points = 0;
            self.kill_unit(unit_id)?;
        } else {
            unit.hit_points -= damage_points;
        }
        Ok(())
    }

    fn do_projectile_impact(&mut self, projectile: &Projectile, _impact_type: ImpactType) {
        self.apply_damage_in_radius(projectile.position, projectile.damage_radius, projectile);
    }

    /// Radial splash damage. Damage scales linearly from full at the center
    /// to zero at the radius, measured to each unit's bounding box.
    pub fn apply_damage_in_radius(
        &mut self,
        position: SimVector,
        radius: SimScalar,
        projectile: &Projectile,
    ) {
        if radius <= SimScalar::ZERO {
            return;
        }

        let min = self
            .terrain
            .world_to_heightmap_coordinate(position - SimVector::new(radius, SimScalar::ZERO, radius));
        let max = self
            .terrain
            .world_to_heightmap_coordinate(position + SimVector::new(radius, SimScalar::ZERO, radius));
        let min_cell = self.occupied_grid.clamp_to_coords(min.0, min.1);
        let max_cell = self.occupied_grid.clamp_to_coords(max.0, max.1);
        let region = GridRegion::from_coordinates(min_cell, max_cell);

        let radius_squared = radius * radius;
        let mut seen = FixedBitSet::with_capacity(self.units.slot_count() as usize);
        let mut victims: Vec<(UnitId, u32)> = Vec::new();

        region.for_each_coord(|coords| {
            if !self.cell_within_radius(coords, position, radius_squared) {
                return;
            }

            let cell = self.occupied_grid.get_coords(coords);
            let occupant = match cell.occupied_type {
                OccupiedType::Unit(u) => Some(u),
                _ => match cell.building_cell {
                    Some(BuildingOccupiedCell { unit, passable: false }) => Some(unit),
                    _ => None,
                },
            };
            let Some(unit_id) = occupant else {
                return;
            };

            if seen.contains(unit_id.index as usize) {
                return;
            }
            seen.insert(unit_id.index as usize);

            if let Some(damage) = self.splash_damage_for(unit_id, position, radius, projectile) {
                victims.push((unit_id, damage));
            }
        });

        // Flying units are not in the grid; test them separately.
        for &flying_id in &self.flying_units_set {
            if seen.contains(flying_id.index as usize) {
                continue;
            }
            if let Some(damage) = self.splash_damage_for(flying_id, position, radius, projectile) {
                victims.push((flying_id, damage));
            }
        }

        for (unit_id, damage) in victims {
            if self.apply_damage(unit_id, damage).is_err() {
                warn!(index = unit_id.index, "splash damage target vanished");
            }
        }
    }

    fn cell_within_radius(
        &self,
        coords: GridCoordinates,
        position: SimVector,
        radius_squared: SimScalar,
    ) -> bool {
        let center = self.terrain.heightmap_index_to_world_center(coords);
        let half_x = SimScalar::from_num(HEIGHT_TILE_WIDTH_IN_WORLD_UNITS) / SimScalar::from_num(2);
        let half_z = SimScalar::from_num(HEIGHT_TILE_HEIGHT_IN_WORLD_UNITS) / SimScalar::from_num(2);
        let dx = nearest_delta(position.x, center.x - half_x, center.x + half_x);
        let dz = nearest_delta(position.z, center.z - half_z, center.z + half_z);
        dx * dx + dz * dz <= radius_squared
    }

    fn splash_damage_for(
        &self,
        unit_id: UnitId,
        position: SimVector,
        radius: SimScalar,
        projectile: &Projectile,
    ) -> Option<u32> {
        let unit = self.units.get(unit_id)?;
        if unit.is_dead() {
            return None;
        }
        let bounds = self.create_bounding_box(unit).ok()?;
        let distance_squared = bounds.distance_squared(position);
        if distance_squared > radius * radius {
            return None;
        }
        let scale = clamp(
            SimScalar::ONE - distance_squared.sqrt() / radius,
            SimScalar::ZERO,
            SimScalar::ONE,
        );
        let raw = projectile.get_damage(&unit.unit_type);
        Some(crate::game::math::sim_scalar_to_u32(
            SimScalar::from_num(raw) * scale,
        ))
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    pub fn add_resource_delta(
        &mut self,
        unit_id: UnitId,
        energy: Energy,
        metal: Metal,
    ) -> Result<bool, SimError> {
        self.add_resource_delta_split(unit_id, energy, metal, energy, metal)
    }

    /// Applies apparent deltas to the unit's bookkeeping and actual deltas to
    /// the player's economy. Returns whether both desires were satisfied.
    pub fn add_resource_delta_split(
        &mut self,
        unit_id: UnitId,
        apparent_energy: Energy,
        apparent_metal: Metal,
        actual_energy: Energy,
        actual_metal: Metal,
    ) -> Result<bool, SimError> {
        let unit = self.get_unit_mut(unit_id)?;
        unit.add_energy_delta(apparent_energy);
        unit.add_metal_delta(apparent_metal);
        let owner = unit.owner;
        Ok(self.players[owner.0].add_resource_delta(
            apparent_energy,
            apparent_metal,
            actual_energy,
            actual_metal,
        ))
    }

    /// Once per second: recompute storage caps, commit production and
    /// consumption buffers, determine stall state, then apply per-unit
    /// passive production and activated consumption.
    fn update_resources(&mut self) -> Result<(), SimError> {
        if !self.game_time.is_second_boundary() {
            return Ok(());
        }

        for player in &mut self.players {
            player.max_metal = Metal::ZERO;
            player.max_energy = Energy::ZERO;
        }

        for (_, unit) in self.units.iter() {
            let definition = self.unit_definitions.get(&unit.unit_type).cloned();
            let Some(definition) = definition else { continue };
            if unit.is_being_built(&definition) {
                continue;
            }
            let player = &mut self.players[unit.owner.0];
            if definition.commander {
                player.max_metal += player.starting_metal;
                player.max_energy += player.starting_energy;
            } else {
                player.max_metal += definition.metal_storage;
                player.max_energy += definition.energy_storage;
            }
        }

        for player in &mut self.players {
            player.metal += player.metal_production_buffer;
            player.metal_production_buffer = Metal::ZERO;
            player.energy += player.energy_production_buffer;
            player.energy_production_buffer = Energy::ZERO;

            if player.metal > Metal::ZERO {
                player.metal -= player.actual_metal_consumption_buffer;
                player.actual_metal_consumption_buffer = Metal::ZERO;
                player.metal_stalled = false;
            } else {
                player.metal_stalled = true;
            }

            player.previous_desired_metal_consumption_buffer =
                player.desired_metal_consumption_buffer;
            player.desired_metal_consumption_buffer = Metal::ZERO;

            if player.energy > Energy::ZERO {
                player.energy -= player.actual_energy_consumption_buffer;
                player.actual_energy_consumption_buffer = Energy::ZERO;
                player.energy_stalled = false;
            } else {
                player.energy_stalled = true;
            }

            player.previous_desired_energy_consumption_buffer =
                player.desired_energy_consumption_buffer;
            player.desired_energy_consumption_buffer = Energy::ZERO;

            if player.metal > player.max_metal {
                player.metal = player.max_metal;
            }
            if player.energy > player.max_energy {
                player.energy = player.max_energy;
            }
        }

        for unit_id in self.units.ids() {
            let Some(unit) = self.units.get_mut(unit_id) else { continue };
            let Some(definition) = self.unit_definitions.get(&unit.unit_type).cloned() else {
                continue;
            };

            unit.reset_resource_buffers();

            let being_built = unit.is_being_built(&definition);
            let activated = unit.activated;
            let position = unit.position;

            if !being_built {
                self.add_resource_delta(unit_id, definition.energy_make, definition.metal_make)?;
            }

            if activated {
                let sufficiently_powered =
                    self.get_unit(unit_id)?.is_sufficiently_powered;
                if sufficiently_powered && definition.extracts_metal != Metal::ZERO {
                    let footprint = self
                        .compute_footprint_region_for(position, &definition.movement_collision_info);
                    let region = self.metal_grid.clip_region(footprint);
                    let metal_value =
                        self.metal_grid
                            .accumulate(region, 0u32, |acc, v| acc + *v as u32);
                    self.add_resource_delta(
                        unit_id,
                        Energy::ZERO,
                        Metal(SimScalar::from_num(metal_value) * definition.extracts_metal.0),
                    )?;
                }

                let powered = self.add_resource_delta(
                    unit_id,
                    -definition.energy_use,
                    -definition.metal_use,
                )?;
                self.get_unit_mut(unit_id)?.is_sufficiently_powered = powered;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Yard maps, activation, bugger off
    // ------------------------------------------------------------------

    pub fn try_set_yard_open(&mut self, unit_id: UnitId, open: bool) -> Result<bool, SimError> {
        let unit = self.get_unit(unit_id)?;
        let definition = self.get_unit_definition(&unit.unit_type)?;
        let footprint =
            self.compute_footprint_region_for(unit.position, &definition.movement_collision_info);
        let Some(region) = self.occupied_grid.try_to_region(footprint) else {
            return Ok(false);
        };

        let yard_map = building_yard_map(&definition, footprint);
        if is_yardmap_blocked(&self.occupied_grid, region.x, region.y, &yard_map, open) {
            return Ok(false);
        }

        stamp_yard_map(
            &mut self.occupied_grid,
            region.x,
            region.y,
            unit_id,
            &yard_map,
            open,
        );
        self.get_unit_mut(unit_id)?.yard_open = open;
        Ok(true)
    }

    pub fn set_build_stance(&mut self, unit_id: UnitId, value: bool) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.in_build_stance = value;
        }
    }

    pub fn set_yard_open(&mut self, unit_id: UnitId, value: bool) {
        let _ = self.try_set_yard_open(unit_id, value);
    }

    pub fn set_bugger_off(&mut self, unit_id: UnitId, value: bool) {
        if value {
            let _ = self.emit_bugger_off(unit_id);
        }
    }

    /// Tells every mobile unit standing on this unit's footprint to leave.
    pub fn emit_bugger_off(&mut self, unit_id: UnitId) -> Result<(), SimError> {
        let unit = self.get_unit(unit_id)?;
        let definition = self.get_unit_definition(&unit.unit_type)?;
        let footprint =
            self.compute_footprint_region_for(unit.position, &definition.movement_collision_info);
        let Some(region) = self.occupied_grid.try_to_region(footprint) else {
            return Ok(());
        };

        let mut squatters = Vec::new();
        self.occupied_grid.for_each(region, |_, cell| {
            if let OccupiedType::Unit(other) = cell.occupied_type {
                if other != unit_id && !squatters.contains(&other) {
                    squatters.push(other);
                }
            }
        });
        for squatter in squatters {
            self.tell_to_bugger_off(squatter, footprint);
        }
        Ok(())
    }

    pub fn tell_to_bugger_off(&mut self, unit_id: UnitId, rect: DiscreteRect) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            if unit.orders.is_empty() {
                unit.add_order(UnitOrder::BuggerOff(rect));
            }
        }
    }

    pub fn activate_unit(&mut self, unit_id: UnitId) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.activate();
            self.events.push(GameEvent::UnitActivated { unit_id });
        }
    }

    pub fn deactivate_unit(&mut self, unit_id: UnitId) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.deactivate();
            self.events.push(GameEvent::UnitDeactivated { unit_id });
        }
    }

    /// Marks a unit dead without explosion or corpse. Used when a factory
    /// abandons a half-built frame.
    pub fn quietly_kill_unit(&mut self, unit_id: UnitId) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.mark_as_dead_no_corpse();
        }
    }

    // ------------------------------------------------------------------
    // Piece transforms
    // ------------------------------------------------------------------

    pub fn get_unit_piece_local_transform(
        &self,
        unit_id: UnitId,
        piece_name: &str,
    ) -> Result<Matrix4x, SimError> {
        let unit = self.get_unit(unit_id)?;
        let definition = self.get_unit_definition(&unit.unit_type)?;
        let model = self.get_model_definition(&definition.object_name)?;

        let mut index = *model
            .piece_indices_by_name
            .get(&piece_name.to_uppercase())
            .ok_or_else(|| SimError::UnknownPiece {
                unit_type: unit.unit_type.clone(),
                piece: piece_name.to_string(),
            })?;

        // Compose from the piece up through its parents.
        let mut transform = piece_local_transform(&model, unit, index);
        while let Some(parent) = model.pieces[index].parent {
            transform = piece_local_transform(&model, unit, parent) * transform;
            index = parent;
        }
        Ok(transform)
    }

    pub fn get_unit_piece_transform(
        &self,
        unit_id: UnitId,
        piece_name: &str,
    ) -> Result<Matrix4x, SimError> {
        let unit = self.get_unit(unit_id)?;
        let local = self.get_unit_piece_local_transform(unit_id, piece_name)?;
        Ok(unit.get_transform() * local)
    }

    pub fn get_unit_piece_position(
        &self,
        unit_id: UnitId,
        piece_name: &str,
    ) -> Result<SimVector, SimError> {
        let transform = self.get_unit_piece_transform(unit_id, piece_name)?;
        Ok(transform * SimVector::ZERO)
    }

    // ------------------------------------------------------------------
    // Victory and cleanup
    // ------------------------------------------------------------------

    pub fn compute_win_status(&self) -> WinStatus {
        let mut living_player = None;
        for (i, player) in self.players.iter().enumerate() {
            if player.status == GamePlayerStatus::Alive {
                if living_player.is_some() {
                    return WinStatus::Undecided;
                }
                living_player = Some(PlayerId(i));
            }
        }
        match living_player {
            Some(winner) => WinStatus::Won { winner },
            None => WinStatus::Draw,
        }
    }

    pub fn kill_player(&mut self, player_id: PlayerId) -> Result<(), SimError> {
        self.players[player_id.0].status = GamePlayerStatus::Dead;
        for unit_id in self.units.ids() {
            let Some(unit) = self.units.get(unit_id) else { continue };
            if unit.is_dead() || !unit.is_owned_by(player_id) {
                continue;
            }
            self.kill_unit(unit_id)?;
        }
        Ok(())
    }

    /// A player whose commander died this tick dies with it.
    fn process_victory_condition(&mut self) -> Result<(), SimError> {
        let mut doomed_players = Vec::new();
        for (_, unit) in self.units.iter() {
            let Some(definition) = self.unit_definitions.get(&unit.unit_type) else {
                continue;
            };
            if definition.commander && unit.is_dead() {
                doomed_players.push(unit.owner);
            }
        }
        for player in doomed_players {
            if self.players[player.0].status == GamePlayerStatus::Alive {
                self.kill_player(player)?;
            }
        }
        Ok(())
    }

    fn delete_dead_units(&mut self) -> Result<(), SimError> {
        let mut corpses = Vec::new();
        let mut to_remove = Vec::new();

        for (unit_id, unit) in self.units.iter() {
            let leave_corpse = match unit.life_state {
                crate::game::unit::LifeState::Alive => continue,
                crate::game::unit::LifeState::Dead { leave_corpse } => leave_corpse,
            };
            to_remove.push(unit_id);

            let Some(definition) = self.unit_definitions.get(&unit.unit_type) else {
                continue;
            };
            if leave_corpse {
                if let Some(corpse) = &definition.corpse {
                    corpses.push(CorpseSpawnInfo {
                        feature_name: corpse.clone(),
                        position: unit.position,
                        rotation: unit.rotation,
                    });
                }
            }
        }

        for unit_id in to_remove {
            let Some(unit) = self.units.get(unit_id) else { continue };
            let definition = self.get_unit_definition(&unit.unit_type)?;
            let footprint = self
                .compute_footprint_region_for(unit.position, &definition.movement_collision_info);

            if definition.is_mobile {
                if self.flying_units_set.remove(&unit_id) {
                    // Flying units hold no grid cells.
                } else if let Some(region) = self.occupied_grid.try_to_region(footprint) {
                    self.occupied_grid.for_each_mut(region, |cell| {
                        if cell.occupied_type == OccupiedType::Unit(unit_id) {
                            cell.occupied_type = OccupiedType::None;
                        }
                    });
                }
            } else if let Some(region) = self.occupied_grid.try_to_region(footprint) {
                self.occupied_grid.for_each_mut(region, |cell| {
                    if matches!(cell.building_cell, Some(b) if b.unit == unit_id) {
                        cell.building_cell = None;
                    }
                });
            }

            self.units.remove(unit_id);
        }

        for corpse in corpses {
            self.try_spawn_feature(&corpse.feature_name, corpse.position, corpse.rotation);
        }
        Ok(())
    }

    fn delete_dead_projectiles(&mut self) {
        self.projectiles.retain(|_, projectile| !projectile.is_dead);
    }

    /// Commits deferred unit-creation requests queued by builders and
    /// factories during the behavior phase.
    fn spawn_new_units(&mut self) -> Result<(), SimError> {
        while let Some(requester_id) = self.unit_creation_requests.pop_front() {
            let Some(requester) = self.units.get(requester_id) else {
                continue;
            };

            if let UnitBehaviorState::CreatingUnit {
                unit_type,
                owner,
                position,
                status: UnitCreationStatus::Pending,
            } = &requester.behavior_state
            {
                let (unit_type, owner, position) = (unit_type.clone(), *owner, *position);
                let new_unit = self.try_spawn_unit(&unit_type, owner, position, None)?;
                let status = match new_unit {
                    Some(unit_id) => {
                        self.events
                            .push(GameEvent::UnitStartedBuilding { unit_id: requester_id });
                        UnitCreationStatus::Done { unit_id }
                    }
                    None => UnitCreationStatus::Failed,
                };
                if let Some(requester) = self.units.get_mut(requester_id) {
                    if let UnitBehaviorState::CreatingUnit { status: s, .. } =
                        &mut requester.behavior_state
                    {
                        *s = status;
                    }
                }
                continue;
            }

            let Some(requester) = self.units.get(requester_id) else {
                continue;
            };
            let factory_request = match &requester.factory_state {
                FactoryBehaviorState::CreatingUnit {
                    unit_type,
                    owner,
                    position,
                    rotation,
                    status: UnitCreationStatus::Pending,
                } => Some((unit_type.clone(), *owner, *position, *rotation)),
                _ => None,
            };
            if let Some((unit_type, owner, position, rotation)) = factory_request {
                let new_unit = self.try_spawn_unit(&unit_type, owner, position, Some(rotation))?;
                let status = match new_unit {
                    Some(unit_id) => UnitCreationStatus::Done { unit_id },
                    None => UnitCreationStatus::Failed,
                };
                if let Some(requester) = self.units.get_mut(requester_id) {
                    if let FactoryBehaviorState::CreatingUnit { status: s, .. } =
                        &mut requester.factory_state
                    {
                        *s = status;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // The tick
    // ------------------------------------------------------------------

    /// Advances the simulation one fixed step. The phase order here is part
    /// of the lockstep contract.
    pub fn tick(&mut self) -> Result<(), SimError> {
        self.game_time += 1;

        self.update_resources()?;

        let path_budget = self.config.path_requests_per_tick;
        pathfinding::service_path_requests(self, path_budget);

        let dt = sim_tick_delta();
        for unit_id in self.units.ids() {
            behavior::update(self, unit_id)?;

            if let Some(unit) = self.units.get_mut(unit_id) {
                for piece in &mut unit.pieces {
                    piece.update(dt);
                }
            }

            run_unit_cob_scripts(self, unit_id)?;
        }

        self.update_projectiles()?;

        self.process_victory_condition()?;

        self.delete_dead_units()?;

        self.delete_dead_projectiles();

        self.spawn_new_units()?;

        Ok(())
    }

    pub fn compute_hash(&self) -> GameHash {
        compute_hash_of(self)
    }
}

fn nearest_delta(v: SimScalar, lo: SimScalar, hi: SimScalar) -> SimScalar {
    if v < lo {
        lo - v
    } else if v > hi {
        v - hi
    } else {
        SimScalar::ZERO
    }
}

/// A building's yard map, or a fully blocking one if none is configured.
fn building_yard_map(definition: &UnitDefinition, footprint: DiscreteRect) -> Grid<YardMapCell> {
    match &definition.yard_map {
        Some(map) => map.clone(),
        None => Grid::filled(
            footprint.width as usize,
            footprint.height as usize,
            YardMapCell::Ground,
        ),
    }
}

fn piece_local_transform(
    model: &UnitModelDefinition,
    unit: &UnitState,
    index: usize,
) -> Matrix4x {
    let origin = model.pieces[index].origin;
    let state = &unit.pieces[index];
    Matrix4x::translation(origin + state.offset)
        * Matrix4x::rotation_z(state.rotation_z)
        * Matrix4x::rotation_y(state.rotation_y)
        * Matrix4x::rotation_x(state.rotation_x)
}

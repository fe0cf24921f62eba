//! Universal invariants checked over running simulations.

use kestrel::game::angle::SimAngle;
use kestrel::game::math::SimVector;
use kestrel::game::occupied_grid::OccupiedType;
use kestrel::game::simulation::GameSimulation;
use kestrel::game::testing;
use kestrel::game::unit::{is_flying, UnitOrder};

/// Every living ground unit's footprint cells must name it, and no cell may
/// name a dead or absent unit.
fn assert_occupancy_consistent(sim: &GameSimulation) {
    for (unit_id, unit) in sim.units.iter() {
        if unit.is_dead() || is_flying(&unit.physics) {
            continue;
        }
        let definition = sim.get_unit_definition(&unit.unit_type).unwrap();
        if !definition.is_mobile {
            continue;
        }
        let footprint =
            sim.compute_footprint_region_for(unit.position, &definition.movement_collision_info);
        let region = sim
            .occupied_grid
            .try_to_region(footprint)
            .expect("living unit footprint must be on the grid");
        let mut all_owned = true;
        sim.occupied_grid.for_each(region, |_, cell| {
            if cell.occupied_type != OccupiedType::Unit(unit_id) {
                all_owned = false;
            }
        });
        assert!(all_owned, "unit {:?} does not own its footprint", unit_id);
    }

    // No cell claims ownership by an absent unit.
    for y in 0..sim.occupied_grid.height() {
        for x in 0..sim.occupied_grid.width() {
            let cell = sim.occupied_grid.get(x, y);
            if let OccupiedType::Unit(id) = cell.occupied_type {
                assert!(
                    sim.units.get(id).map(|u| !u.is_dead()).unwrap_or(false),
                    "cell ({}, {}) owned by dead or absent unit",
                    x,
                    y
                );
            }
            if let Some(building) = cell.building_cell {
                assert!(
                    sim.units.contains(building.unit),
                    "stale building cell at ({}, {})",
                    x,
                    y
                );
            }
        }
    }
}

fn assert_health_bounds(sim: &GameSimulation) {
    for (_, unit) in sim.units.iter() {
        let definition = sim.get_unit_definition(&unit.unit_type).unwrap();
        assert!(unit.hit_points <= definition.max_hit_points);
        if unit.hit_points == 0 && !unit.is_being_built(&definition) {
            assert!(unit.is_dead(), "zero-hp unit still alive");
        }
    }
}

#[test]
fn occupancy_and_health_hold_through_movement_and_combat() {
    let mut sim = testing::flat_world();
    let p0 = testing::add_test_player(&mut sim, 10_000, 10_000);
    let p1 = testing::add_test_player(&mut sim, 10_000, 10_000);

    testing::register_unit_type(&mut sim, testing::minimal_definition("SCOUT"));
    let mut gunner = testing::minimal_definition("GUNNER");
    gunner.weapon1 = Some("GUN".to_string());
    let script = testing::script_with_queries(&["base", "barrel"], &[("QueryPrimary", 1)]);
    // Elevated barrel so shots clear the firer's own ground cells.
    let model = testing::minimal_model(
        "GUNNER",
        &[("base", SimVector::ZERO), ("barrel", SimVector::from_num(0, 8, 0))],
    );
    testing::register_unit_type_full(&mut sim, gunner, model, script);
    let mut weapon = testing::minimal_weapon("GUN");
    weapon.max_range = kestrel::game::math::SimScalar::from_num(120);
    weapon
        .damage
        .insert("DEFAULT".to_string(), 40);
    testing::register_weapon(&mut sim, weapon);

    // Two opposing gunners in range of each other, plus scouts milling about.
    for (unit_type, owner, x, z) in [
        ("GUNNER", p0, -40i64, 0i64),
        ("GUNNER", p1, 40, 0),
        ("SCOUT", p0, -100, -100),
        ("SCOUT", p1, 100, 100),
    ] {
        testing::spawn_completed_unit(
            &mut sim,
            unit_type,
            owner,
            SimVector::from_num(x, 0, z),
            Some(SimAngle::ZERO),
        )
        .unwrap()
        .expect("spawn should succeed");
    }

    // March the scouts across the map while the gunners trade fire.
    let scout_ids: Vec<_> = sim
        .units
        .iter()
        .filter(|(_, u)| u.unit_type == "SCOUT")
        .map(|(id, _)| id)
        .collect();
    for (i, id) in scout_ids.iter().enumerate() {
        let dest = if i == 0 {
            SimVector::from_num(100, 0, -100)
        } else {
            SimVector::from_num(-100, 0, 100)
        };
        sim.get_unit_mut(*id).unwrap().add_order(UnitOrder::Move(dest));
    }

    for _ in 0..240 {
        sim.tick().unwrap();
        sim.drain_events();
        assert_occupancy_consistent(&sim);
        assert_health_bounds(&sim);
    }
}

/// Build progress is monotonic and completion fires exactly once; checked
/// against a builder-driven construction rather than a factory.
#[test]
fn dead_units_release_their_cells() {
    let mut sim = testing::flat_world();
    let player = testing::add_test_player(&mut sim, 1000, 1000);
    testing::register_unit_type(&mut sim, testing::minimal_definition("SCOUT"));

    let unit_id = testing::spawn_completed_unit(
        &mut sim,
        "SCOUT",
        player,
        SimVector::from_num(0, 0, 0),
        None,
    )
    .unwrap()
    .unwrap();

    sim.apply_damage(unit_id, 10_000).unwrap();
    assert!(sim.get_unit(unit_id).unwrap().is_dead());

    sim.tick().unwrap();
    assert!(!sim.units.contains(unit_id));
    assert_occupancy_consistent(&sim);
}

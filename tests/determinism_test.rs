//! Determinism: identical worlds fed identical commands agree tick-for-tick.

use kestrel::game::angle::SimAngle;
use kestrel::game::events::GameEvent;
use kestrel::game::math::SimVector;
use kestrel::game::simulation::GameSimulation;
use kestrel::game::testing;
use kestrel::game::unit::{UnitId, UnitOrder};

fn build_world() -> (GameSimulation, Vec<UnitId>) {
    let mut sim = testing::flat_world();
    let p0 = testing::add_test_player(&mut sim, 1000, 1000);
    let p1 = testing::add_test_player(&mut sim, 1000, 1000);

    testing::register_unit_type(&mut sim, testing::minimal_definition("SCOUT"));

    let mut gunner = testing::minimal_definition("GUNNER");
    gunner.weapon1 = Some("GUN".to_string());
    let script = testing::script_with_queries(&["base", "barrel"], &[("QueryPrimary", 1)]);
    testing::register_unit_type_with_script(&mut sim, gunner, script);
    testing::register_weapon(&mut sim, testing::minimal_weapon("GUN"));

    let mut ids = Vec::new();
    for (unit_type, owner, x, z) in [
        ("SCOUT", p0, -100i64, -100i64),
        ("SCOUT", p0, -100, -60),
        ("GUNNER", p0, -60, -100),
        ("SCOUT", p1, 120, 120),
        ("GUNNER", p1, 80, 120),
    ] {
        let id = testing::spawn_completed_unit(
            &mut sim,
            unit_type,
            owner,
            SimVector::from_num(x, 0, z),
            Some(SimAngle::ZERO),
        )
        .unwrap()
        .expect("spawn should succeed");
        ids.push(id);
    }
    (sim, ids)
}

fn issue_scripted_commands(sim: &mut GameSimulation, ids: &[UnitId], tick: u32) {
    // A fixed command schedule, the same for every run.
    match tick {
        5 => {
            sim.get_unit_mut(ids[0])
                .unwrap()
                .add_order(UnitOrder::Move(SimVector::from_num(40, 0, 40)));
        }
        20 => {
            sim.get_unit_mut(ids[1])
                .unwrap()
                .add_order(UnitOrder::Move(SimVector::from_num(60, 0, -40)));
            sim.get_unit_mut(ids[3])
                .unwrap()
                .add_order(UnitOrder::Move(SimVector::from_num(-40, 0, 60)));
        }
        60 => {
            sim.get_unit_mut(ids[2])
                .unwrap()
                .add_order(UnitOrder::Attack(
                    kestrel::game::unit::AttackTarget::Ground(SimVector::from_num(120, 10, 120)),
                ));
        }
        _ => {}
    }
}

#[test]
fn identical_runs_hash_identically_every_tick() {
    let (mut sim_a, ids_a) = build_world();
    let (mut sim_b, ids_b) = build_world();

    for tick in 0..300 {
        issue_scripted_commands(&mut sim_a, &ids_a, tick);
        issue_scripted_commands(&mut sim_b, &ids_b, tick);

        sim_a.tick().unwrap();
        sim_b.tick().unwrap();
        sim_a.drain_events();
        sim_b.drain_events();

        assert_eq!(
            sim_a.compute_hash(),
            sim_b.compute_hash(),
            "simulations diverged at tick {}",
            tick
        );
    }
}

/// Property 7: queued orders complete in FIFO order, one arrival per move.
#[test]
fn queued_orders_complete_in_order() {
    let mut sim = testing::flat_world();
    let player = testing::add_test_player(&mut sim, 1000, 1000);
    testing::register_unit_type(&mut sim, testing::minimal_definition("SCOUT"));

    let unit_id = testing::spawn_completed_unit(
        &mut sim,
        "SCOUT",
        player,
        SimVector::from_num(0, 0, 0),
        Some(SimAngle::ZERO),
    )
    .unwrap()
    .unwrap();

    let waypoints = [
        SimVector::from_num(30, 0, 0),
        SimVector::from_num(30, 0, 30),
        SimVector::from_num(0, 0, 30),
    ];
    {
        let unit = sim.get_unit_mut(unit_id).unwrap();
        for waypoint in waypoints {
            unit.add_order(UnitOrder::Move(waypoint));
        }
        assert_eq!(unit.orders.len(), 3);
    }

    let mut arrivals = 0;
    for _ in 0..400 {
        sim.tick().unwrap();
        for event in sim.drain_events() {
            if matches!(event, GameEvent::UnitArrived { .. }) {
                arrivals += 1;
            }
        }
        if sim.get_unit(unit_id).unwrap().orders.is_empty() {
            break;
        }
    }

    assert_eq!(arrivals, 3);
    let final_position = sim.get_unit(unit_id).unwrap().position;
    let last = waypoints[2];
    assert!(
        final_position.xz().distance_squared(last.xz())
            < kestrel::game::math::SimScalar::from_num(4),
        "unit ended at {:?}",
        final_position
    );
}

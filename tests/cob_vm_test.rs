//! Script VM behavior driven through whole simulation ticks: piece motion
//! waits, sleeps, signals, calls and synchronous queries.

use kestrel::game::cob::script::OpCode;
use kestrel::game::cob::run_cob_query;
use kestrel::game::math::SimVector;
use kestrel::game::simulation::GameSimulation;
use kestrel::game::testing::{self, CobScriptBuilder};
use kestrel::game::unit::UnitId;
use kestrel::game::SimError;

fn build_vm_world() -> (GameSimulation, UnitId) {
    let mut builder = CobScriptBuilder::new();
    builder.piece("base");
    let arm = builder.piece("arm");

    builder.begin_function("Create").ret(0);

    // Slide the arm 2 units along z at 60 units/second, wait for it, then
    // flag completion in static 0.
    builder
        .begin_function("Deploy")
        .push_constant(60 << 16)
        .push_constant(2 << 16)
        .op(OpCode::Move)
        .word(arm as u32)
        .word(2)
        .op(OpCode::WaitForMove)
        .word(arm as u32)
        .word(2)
        .push_constant(1)
        .op(OpCode::PopStatic)
        .word(0)
        .ret(0);

    // Sleep 200ms then flag static 1.
    builder
        .begin_function("Nap")
        .push_constant(200)
        .op(OpCode::Sleep)
        .push_constant(7)
        .op(OpCode::PopStatic)
        .word(1)
        .ret(0);

    // Sleeps forever unless killed by signal bit 2.
    builder
        .begin_function("Watcher")
        .push_constant(2)
        .op(OpCode::SetSignalMask)
        .push_constant(1_000_000)
        .op(OpCode::Sleep)
        .push_constant(9)
        .op(OpCode::PopStatic)
        .word(2)
        .ret(0);

    builder
        .begin_function("Killer")
        .push_constant(2)
        .op(OpCode::Signal)
        .ret(0);

    // A synchronous query must never block.
    builder
        .begin_function("BadQuery")
        .push_constant(1000)
        .op(OpCode::Sleep)
        .ret(0);

    // Helper(x) stores x + 3 into static 3.
    let helper_id = 6;
    builder
        .begin_function("Helper")
        .op(OpCode::PushLocalVar)
        .word(0)
        .push_constant(3)
        .op(OpCode::Add)
        .op(OpCode::PopStatic)
        .word(3)
        .ret(0);

    builder
        .begin_function("Outer")
        .push_constant(5)
        .op(OpCode::CallScript)
        .word(helper_id)
        .word(1)
        .ret(0);

    let script = builder.build();

    let mut sim = testing::flat_world();
    let player = testing::add_test_player(&mut sim, 1000, 1000);
    testing::register_unit_type_with_script(&mut sim, testing::minimal_definition("BOT"), script);
    let unit_id = testing::spawn_completed_unit(
        &mut sim,
        "BOT",
        player,
        SimVector::from_num(0, 0, 0),
        None,
    )
    .unwrap()
    .unwrap();
    (sim, unit_id)
}

fn get_static(sim: &GameSimulation, unit_id: UnitId, id: usize) -> i32 {
    sim.get_unit(unit_id).unwrap().cob_env.get_static(id)
}

#[test]
fn wait_for_move_resumes_when_piece_arrives() {
    let (mut sim, unit_id) = build_vm_world();
    sim.get_unit_mut(unit_id)
        .unwrap()
        .cob_env
        .create_thread("Deploy", Vec::new());

    sim.tick().unwrap();
    // The thread has issued the move and is now blocked on it.
    assert_eq!(get_static(&sim, unit_id, 0), 0);

    let mut completed_at = None;
    for tick in 0..10 {
        sim.tick().unwrap();
        if get_static(&sim, unit_id, 0) == 1 {
            completed_at = Some(tick);
            break;
        }
    }
    assert!(completed_at.is_some(), "wait-for-move never released");

    let arm = sim.get_unit(unit_id).unwrap().find_piece("arm").unwrap();
    assert_eq!(arm.offset.z, kestrel::game::math::SimScalar::from_num(2));
}

#[test]
fn sleep_wakes_after_the_requested_duration() {
    let (mut sim, unit_id) = build_vm_world();
    sim.get_unit_mut(unit_id)
        .unwrap()
        .cob_env
        .create_thread("Nap", Vec::new());

    // 200ms at 33ms ticks is 6 ticks of sleep.
    for _ in 0..5 {
        sim.tick().unwrap();
        assert_eq!(get_static(&sim, unit_id, 1), 0, "woke too early");
    }
    for _ in 0..3 {
        sim.tick().unwrap();
    }
    assert_eq!(get_static(&sim, unit_id, 1), 7);
}

#[test]
fn signal_kills_masked_threads() {
    let (mut sim, unit_id) = build_vm_world();
    let watcher = sim
        .get_unit_mut(unit_id)
        .unwrap()
        .cob_env
        .create_thread("Watcher", Vec::new())
        .unwrap();

    sim.tick().unwrap();
    assert!(sim.get_unit(unit_id).unwrap().cob_env.threads[watcher].is_some());

    sim.get_unit_mut(unit_id)
        .unwrap()
        .cob_env
        .create_thread("Killer", Vec::new());
    sim.tick().unwrap();

    // The watcher died before it could write its flag, and stays dead.
    assert!(sim.get_unit(unit_id).unwrap().cob_env.threads[watcher].is_none());
    for _ in 0..40 {
        sim.tick().unwrap();
    }
    assert_eq!(get_static(&sim, unit_id, 2), 0);
}

#[test]
fn call_script_passes_arguments() {
    let (mut sim, unit_id) = build_vm_world();
    sim.get_unit_mut(unit_id)
        .unwrap()
        .cob_env
        .create_thread("Outer", Vec::new());
    sim.tick().unwrap();
    assert_eq!(get_static(&sim, unit_id, 3), 8);
}

#[test]
fn blocking_synchronous_query_is_a_hard_error() {
    let (mut sim, unit_id) = build_vm_world();
    let result = run_cob_query(&mut sim, unit_id, "BadQuery");
    assert!(matches!(
        result,
        Err(SimError::BlockedSynchronousQuery { .. })
    ));
    // Queries for scripts that don't exist are merely absent.
    let missing = run_cob_query(&mut sim, unit_id, "NoSuchScript").unwrap();
    assert!(missing.is_none());
}

#[test]
fn query_returns_out_parameter() {
    let mut builder = CobScriptBuilder::new();
    builder.piece("base");
    builder.begin_function("Create").ret(0);
    builder
        .begin_function("QueryPrimary")
        .push_constant(42)
        .pop_local_var(0)
        .ret(1);
    let script = builder.build();

    let mut sim = testing::flat_world();
    let player = testing::add_test_player(&mut sim, 1000, 1000);
    testing::register_unit_type_with_script(&mut sim, testing::minimal_definition("Q"), script);
    let unit_id =
        testing::spawn_completed_unit(&mut sim, "Q", player, SimVector::from_num(0, 0, 0), None)
            .unwrap()
            .unwrap();

    let answer = run_cob_query(&mut sim, unit_id, "QueryPrimary").unwrap();
    assert_eq!(answer, Some(42));
}

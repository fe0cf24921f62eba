//! Lockstep protocol behavior: command buffering across sessions, hash
//! verification, and desync detection with state dumps.

use kestrel::game::math::SimVector;
use kestrel::game::player::{GamePlayerInfo, GamePlayerType, PlayerId};
use kestrel::game::simulation::GameSimulation;
use kestrel::game::testing;
use kestrel::game::unit::{UnitId, UnitOrder};
use kestrel::net::{
    LockstepError, LockstepSession, NetworkMailbox, OrderMode, PlayerCommand,
    PlayerCommandService, UnitCommandAction,
};

fn build_two_player_world() -> (GameSimulation, UnitId, UnitId) {
    let mut sim = testing::flat_world();
    let p0 = testing::add_test_player(&mut sim, 1000, 1000);
    let p1 = testing::add_test_player(&mut sim, 1000, 1000);
    testing::register_unit_type(&mut sim, testing::minimal_definition("SCOUT"));

    let a = testing::spawn_completed_unit(&mut sim, "SCOUT", p0, SimVector::from_num(-80, 0, 0), None)
        .unwrap()
        .unwrap();
    let b = testing::spawn_completed_unit(&mut sim, "SCOUT", p1, SimVector::from_num(80, 0, 0), None)
        .unwrap()
        .unwrap();
    (sim, a, b)
}

/// Two cross-wired sessions stay in lockstep and agree on every hash, with a
/// locally issued command flowing to both simulations.
#[test]
fn cross_wired_sessions_stay_in_sync() {
    let (sim_a, unit_a, _) = build_two_player_world();
    let (sim_b, _, _) = build_two_player_world();

    let (a_to_b_tx, a_to_b_rx) = crossbeam_channel::unbounded();
    let (b_to_a_tx, b_to_a_rx) = crossbeam_channel::unbounded();
    let mailbox_a = NetworkMailbox {
        inbound: b_to_a_rx,
        outbound: a_to_b_tx,
    };
    let mailbox_b = NetworkMailbox {
        inbound: a_to_b_rx,
        outbound: b_to_a_tx,
    };

    let mut session_a = LockstepSession::new(sim_a, PlayerId(0), mailbox_a);
    let mut session_b = LockstepSession::new(sim_b, PlayerId(1), mailbox_b);

    session_a.collect_local_command(PlayerCommand::UnitCommand {
        unit_id: unit_a,
        action: UnitCommandAction::IssueOrder {
            order: UnitOrder::Move(SimVector::from_num(0, 0, 40)),
            mode: OrderMode::Queued,
        },
    });

    for _ in 0..200 {
        session_a.update(33.4).expect("session a failed");
        session_b.update(33.4).expect("session b failed");
    }

    // The sessions verified each other's hashes on every compared tick; any
    // disagreement would have surfaced as a desync error above. Align the
    // two on the same tick and compare final state directly as well.
    while session_a.sim.game_time < session_b.sim.game_time {
        session_a.update(33.4).expect("session a failed");
    }
    while session_b.sim.game_time < session_a.sim.game_time {
        session_b.update(33.4).expect("session b failed");
    }

    assert!(session_a.scene_time().value > 100);
    assert_eq!(session_a.sim.game_time, session_b.sim.game_time);
    assert_eq!(session_a.last_hash(), session_b.last_hash());

    // The command reached both simulations: player 0's unit moved off its
    // spawn point in each.
    let moved_a = session_a.sim.units.get(unit_a).unwrap().position;
    assert!(moved_a.z > kestrel::game::math::SimScalar::from_num(10));
}

/// A tick cannot be popped until every participant's slot has arrived.
#[test]
fn tick_blocks_until_all_players_commit() {
    let (sim, _, _) = build_two_player_world();
    let (mailbox, _incoming, _outgoing) = NetworkMailbox::disconnected();
    let mut session = LockstepSession::new(sim, PlayerId(0), mailbox);

    // Player 1 is a human peer who never sends anything: the session must
    // refuse to advance rather than desync.
    session.update(100.0).unwrap();
    assert_eq!(session.scene_time().value, 0);
    assert_eq!(session.sim.game_time.value, 0);
}

/// Computer players have their slots filled locally, so a session with only
/// computer opponents advances alone.
#[test]
fn computer_player_slots_are_filled_locally() {
    let mut sim = testing::flat_world();
    testing::add_test_player(&mut sim, 1000, 1000);
    sim.add_player(GamePlayerInfo::new(
        None,
        GamePlayerType::Computer,
        1,
        "CORE".to_string(),
        kestrel::game::player::Metal::from_num(1000),
        kestrel::game::player::Energy::from_num(1000),
    ));
    testing::register_unit_type(&mut sim, testing::minimal_definition("SCOUT"));

    let (mailbox, _incoming, _outgoing) = NetworkMailbox::disconnected();
    let mut session = LockstepSession::new(sim, PlayerId(0), mailbox);

    for _ in 0..30 {
        session.update(33.4).unwrap();
    }
    assert!(session.sim.game_time.value >= 25);
}

/// S6: one participant's stream gains an extra build-queue command; the very
/// next hash exchange catches the divergence and both sides dump state.
#[test]
fn injected_command_is_caught_as_desync() {
    let (mut sim_a, unit_a, _) = build_two_player_world();
    let (mut sim_b, _, _) = build_two_player_world();

    for _ in 0..100 {
        sim_a.tick().unwrap();
        sim_b.tick().unwrap();
        assert_eq!(sim_a.compute_hash(), sim_b.compute_hash());
    }

    // The corrupt stream: a command applied on one side only.
    sim_a
        .get_unit_mut(unit_a)
        .unwrap()
        .modify_build_queue("SCOUT", 1);

    sim_a.tick().unwrap();
    sim_b.tick().unwrap();

    let mut service = PlayerCommandService::new();
    let p0 = service.register_player();
    let p1 = service.register_player();
    service.push_hash(p0, sim_a.compute_hash());
    service.push_hash(p1, sim_b.compute_hash());
    assert!(!service.check_hashes(), "desync was not detected");

    // Both sides dump state for offline comparison.
    let dir = std::env::temp_dir();
    let path_a = dir.join("kestrel-desync-a.json");
    let path_b = dir.join("kestrel-desync-b.json");
    kestrel::game::dump::write_desync_dump(&sim_a, &path_a).unwrap();
    kestrel::game::dump::write_desync_dump(&sim_b, &path_b).unwrap();

    let dump_a: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path_a).unwrap()).unwrap();
    let dump_b: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path_b).unwrap()).unwrap();
    assert_eq!(dump_a["gameTime"], dump_b["gameTime"]);
    assert_ne!(dump_a["hash"], dump_b["hash"]);

    let _ = std::fs::remove_file(path_a);
    let _ = std::fs::remove_file(path_b);
}

/// Desync inside a session surfaces as a `LockstepError::Desync`.
#[test]
fn session_aborts_on_hash_mismatch() {
    let (sim, _, _) = build_two_player_world();
    let (mailbox, incoming, _outgoing) = NetworkMailbox::disconnected();
    let mut session = LockstepSession::new(sim, PlayerId(0), mailbox);

    // The peer commits an empty frame and then lies about the result.
    incoming
        .send(kestrel::net::NetMessage::Commands {
            player: PlayerId(1),
            scene_time: 0,
            commands: Vec::new(),
        })
        .unwrap();
    session.update(33.4).unwrap();
    assert_eq!(session.scene_time().value, 1);

    incoming
        .send(kestrel::net::NetMessage::Hash {
            player: PlayerId(1),
            scene_time: 1,
            hash: kestrel::game::hash::GameHash { value: 0xBAD },
        })
        .unwrap();
    incoming
        .send(kestrel::net::NetMessage::Commands {
            player: PlayerId(1),
            scene_time: 1,
            commands: Vec::new(),
        })
        .unwrap();

    let result = session.update(33.4);
    assert!(matches!(result, Err(LockstepError::Desync { .. })));

    // Clean up the dump the session wrote on abort.
    for entry in std::fs::read_dir(".").unwrap().flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("kestrel-dump-") && name.ends_with(".json") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

//! State dumps for desync forensics.
//!
//! The dump document contains the same fields, in the same order, as the
//! state hash. On a desync each participant writes one out so the diverging
//! field can be diffed offline. A gzipped per-tick stream of the same
//! documents can be enabled for deep debugging.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use crate::game::player::GamePlayerStatus;
use crate::game::simulation::GameSimulation;
use crate::game::unit::{FactoryBehaviorState, UnitBehaviorState, UnitPhysicsInfo};

fn behavior_state_name(state: &UnitBehaviorState) -> &'static str {
    match state {
        UnitBehaviorState::Idle => "idle",
        UnitBehaviorState::CreatingUnit { .. } => "creatingUnit",
        UnitBehaviorState::Building { .. } => "building",
    }
}

fn physics_state_name(physics: &UnitPhysicsInfo) -> &'static str {
    match physics {
        UnitPhysicsInfo::Ground(_) => "ground",
        UnitPhysicsInfo::Air(_) => "air",
    }
}

fn factory_state_name(state: &FactoryBehaviorState) -> &'static str {
    match state {
        FactoryBehaviorState::Idle => "idle",
        FactoryBehaviorState::CreatingUnit { .. } => "creatingUnit",
        FactoryBehaviorState::Building { .. } => "building",
    }
}

/// Builds the JSON document describing hash-relevant simulation state.
pub fn dump_json(sim: &GameSimulation) -> serde_json::Value {
    let players: Vec<_> = sim
        .players
        .iter()
        .map(|p| {
            json!({
                "metal": p.metal.0.to_bits(),
                "energy": p.energy.0.to_bits(),
                "maxMetal": p.max_metal.0.to_bits(),
                "maxEnergy": p.max_energy.0.to_bits(),
                "metalStalled": p.metal_stalled,
                "energyStalled": p.energy_stalled,
                "status": match p.status {
                    GamePlayerStatus::Alive => "alive",
                    GamePlayerStatus::Dead => "dead",
                },
            })
        })
        .collect();

    let units: Vec<_> = sim
        .units
        .iter()
        .map(|(id, u)| {
            json!({
                "id": id.index,
                "generation": id.generation,
                "unitType": u.unit_type,
                "position": [
                    u.position.x.to_bits(),
                    u.position.y.to_bits(),
                    u.position.z.to_bits(),
                ],
                "rotation": u.rotation.value,
                "hitPoints": u.hit_points,
                "buildTimeCompleted": u.build_time_completed,
                "behaviorState": behavior_state_name(&u.behavior_state),
                "physicsState": physics_state_name(&u.physics),
                "factoryState": factory_state_name(&u.factory_state),
            })
        })
        .collect();

    json!({
        "gameTime": sim.game_time.value,
        "hash": sim.compute_hash().value,
        "players": players,
        "units": units,
    })
}

/// A gzipped newline-delimited stream of per-tick state dumps.
pub struct StateLogStream {
    encoder: GzEncoder<std::fs::File>,
}

impl StateLogStream {
    pub fn create(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            encoder: GzEncoder::new(file, Compression::fast()),
        })
    }

    pub fn write_tick(&mut self, sim: &GameSimulation) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.encoder, &dump_json(sim))?;
        self.encoder.write_all(b"\n")
    }

    pub fn finish(self) -> std::io::Result<()> {
        self.encoder.finish().map(|_| ())
    }
}

/// Writes a one-shot dump file, used when a desync is detected.
pub fn write_desync_dump(sim: &GameSimulation, path: &std::path::Path) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(&dump_json(sim))?;
    std::fs::write(path, text)
}

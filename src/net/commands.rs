//! The player command model and its wire encoding.
//!
//! Commands are the only inputs that may influence simulation state. They
//! are collected locally, exchanged with peers, and applied on the tick they
//! were buffered for - never on the tick they were produced.

use serde::{Deserialize, Serialize};

use crate::game::hash::GameHash;
use crate::game::player::PlayerId;
use crate::game::simulation::GameSimulation;
use crate::game::unit::{UnitFireOrders, UnitId, UnitOrder};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderMode {
    /// Replace the unit's order queue.
    Immediate,
    /// Append to the unit's order queue.
    Queued,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UnitCommandAction {
    IssueOrder { order: UnitOrder, mode: OrderMode },
    Stop,
    SetFireOrders(UnitFireOrders),
    SetOnOff(bool),
    ModifyBuildQueue { unit_type: String, count: i32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PlayerCommand {
    UnitCommand {
        unit_id: UnitId,
        action: UnitCommandAction,
    },
    PauseGame,
    UnpauseGame,
}

/// A message exchanged with peers over the network thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NetMessage {
    Commands {
        player: PlayerId,
        scene_time: u32,
        commands: Vec<PlayerCommand>,
    },
    Hash {
        player: PlayerId,
        scene_time: u32,
        hash: GameHash,
    },
}

impl NetMessage {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("net message serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// Applies one committed command to the simulation. Commands referencing
/// units the player does not own (or that no longer exist) are dropped.
pub fn apply_player_command(sim: &mut GameSimulation, player: PlayerId, command: &PlayerCommand) {
    let PlayerCommand::UnitCommand { unit_id, action } = command else {
        // Pause commands are handled by the session driver.
        return;
    };

    let owned = match sim.units.get(*unit_id) {
        Some(unit) => unit.is_owned_by(player),
        None => false,
    };
    if !owned {
        debug!(player = player.0, "dropping command for unowned or dead unit");
        return;
    }

    match action {
        UnitCommandAction::IssueOrder { order, mode } => {
            let unit = sim.units.get_mut(*unit_id).expect("ownership checked");
            match mode {
                OrderMode::Immediate => {
                    unit.clear_orders();
                    unit.add_order(order.clone());
                }
                OrderMode::Queued => unit.add_order(order.clone()),
            }
        }
        UnitCommandAction::Stop => {
            let unit = sim.units.get_mut(*unit_id).expect("ownership checked");
            unit.clear_orders();
        }
        UnitCommandAction::SetFireOrders(fire_orders) => {
            let unit = sim.units.get_mut(*unit_id).expect("ownership checked");
            unit.fire_orders = *fire_orders;
        }
        UnitCommandAction::SetOnOff(on) => {
            if *on {
                sim.activate_unit(*unit_id);
            } else {
                sim.deactivate_unit(*unit_id);
            }
        }
        UnitCommandAction::ModifyBuildQueue { unit_type, count } => {
            let unit = sim.units.get_mut(*unit_id).expect("ownership checked");
            unit.modify_build_queue(&unit_type.to_uppercase(), *count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::math::SimVector;

    #[test]
    fn net_messages_round_trip_through_bincode() {
        let message = NetMessage::Commands {
            player: PlayerId(1),
            scene_time: 42,
            commands: vec![
                PlayerCommand::UnitCommand {
                    unit_id: UnitId::new(3, 0),
                    action: UnitCommandAction::IssueOrder {
                        order: UnitOrder::Move(SimVector::from_num(10, 0, 20)),
                        mode: OrderMode::Queued,
                    },
                },
                PlayerCommand::PauseGame,
            ],
        };
        let bytes = message.encode();
        let decoded = NetMessage::decode(&bytes).unwrap();
        match decoded {
            NetMessage::Commands {
                player, commands, ..
            } => {
                assert_eq!(player, PlayerId(1));
                assert_eq!(commands.len(), 2);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}

//! Per-player command buffers and the hash ledger.
//!
//! Each player has a FIFO of command slots, one per future tick. A tick can
//! only be popped when every player has a slot at the head. Hashes submitted
//! for the same tick by all players are compared in order; a mismatch is a
//! desync.

use std::collections::VecDeque;

use crate::game::hash::GameHash;
use crate::game::player::PlayerId;
use crate::net::commands::PlayerCommand;

#[derive(Default)]
pub struct PlayerCommandService {
    command_buffers: Vec<VecDeque<Vec<PlayerCommand>>>,
    hash_buffers: Vec<VecDeque<GameHash>>,
}

impl PlayerCommandService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_player(&mut self) -> PlayerId {
        self.command_buffers.push(VecDeque::new());
        self.hash_buffers.push(VecDeque::new());
        PlayerId(self.command_buffers.len() - 1)
    }

    pub fn player_count(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn push_commands(&mut self, player: PlayerId, commands: Vec<PlayerCommand>) {
        self.command_buffers[player.0].push_back(commands);
    }

    pub fn buffered_command_count(&self, player: PlayerId) -> usize {
        self.command_buffers[player.0].len()
    }

    /// Pops one committed slot per player, or `None` if any player's slot for
    /// the next tick has not arrived yet.
    pub fn try_pop_commands(&mut self) -> Option<Vec<(PlayerId, Vec<PlayerCommand>)>> {
        if self.command_buffers.iter().any(|buffer| buffer.is_empty()) {
            return None;
        }
        Some(
            self.command_buffers
                .iter_mut()
                .enumerate()
                .map(|(i, buffer)| {
                    (
                        PlayerId(i),
                        buffer.pop_front().expect("checked non-empty"),
                    )
                })
                .collect(),
        )
    }

    pub fn push_hash(&mut self, player: PlayerId, hash: GameHash) {
        self.hash_buffers[player.0].push_back(hash);
    }

    /// Verifies every tick for which all players have submitted a hash.
    /// Returns false on the first disagreement. Verified entries are
    /// consumed.
    pub fn check_hashes(&mut self) -> bool {
        loop {
            if self.hash_buffers.is_empty()
                || self.hash_buffers.iter().any(|buffer| buffer.is_empty())
            {
                return true;
            }
            let mut first = None;
            for buffer in &mut self.hash_buffers {
                let hash = buffer.pop_front().expect("checked non-empty");
                match first {
                    None => first = Some(hash),
                    Some(expected) => {
                        if hash != expected {
                            return false;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_blocks_until_every_player_has_a_slot() {
        let mut service = PlayerCommandService::new();
        let p0 = service.register_player();
        let p1 = service.register_player();

        service.push_commands(p0, Vec::new());
        assert!(service.try_pop_commands().is_none());

        service.push_commands(p1, Vec::new());
        let popped = service.try_pop_commands().unwrap();
        assert_eq!(popped.len(), 2);
        assert!(service.try_pop_commands().is_none());
    }

    #[test]
    fn matching_hashes_pass_and_are_consumed() {
        let mut service = PlayerCommandService::new();
        let p0 = service.register_player();
        let p1 = service.register_player();

        service.push_hash(p0, GameHash { value: 7 });
        assert!(service.check_hashes());

        service.push_hash(p1, GameHash { value: 7 });
        assert!(service.check_hashes());
        // Consumed: a later mismatching pair is a fresh comparison.
        service.push_hash(p0, GameHash { value: 8 });
        service.push_hash(p1, GameHash { value: 9 });
        assert!(!service.check_hashes());
    }

    #[test]
    fn hash_comparison_is_per_tick() {
        let mut service = PlayerCommandService::new();
        let p0 = service.register_player();
        let p1 = service.register_player();

        // Player 0 is two ticks ahead on submissions.
        service.push_hash(p0, GameHash { value: 1 });
        service.push_hash(p0, GameHash { value: 2 });
        service.push_hash(p1, GameHash { value: 1 });
        assert!(service.check_hashes());
        service.push_hash(p1, GameHash { value: 2 });
        assert!(service.check_hashes());
    }
}

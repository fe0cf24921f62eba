//! The lockstep session driver.
//!
//! Owns the simulation and the command service on the simulation thread.
//! The network thread talks to it only through the mailbox channels: inbound
//! peer messages are drained once per update, outbound messages are flushed
//! by the network thread at its own pace.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::game::dump::{write_desync_dump, StateLogStream};
use crate::game::hash::GameHash;
use crate::game::player::{GamePlayerType, PlayerId};
use crate::game::simulation::GameSimulation;
use crate::game::{SimError, SIM_MILLISECONDS_PER_TICK};
use crate::net::command_service::PlayerCommandService;
use crate::net::commands::{apply_player_command, NetMessage, PlayerCommand};

/// Scene time counts attempted simulation steps; unlike game time it also
/// advances on catch-up skips.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneTime {
    pub value: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LockstepError {
    #[error("desync detected at scene time {scene_time}")]
    Desync { scene_time: u32 },
    #[error(transparent)]
    Sim(#[from] SimError),
}

/// The session's two contact points with the network thread.
pub struct NetworkMailbox {
    pub inbound: Receiver<NetMessage>,
    pub outbound: Sender<NetMessage>,
}

impl NetworkMailbox {
    /// A loopback mailbox for single-player and tests: outbound messages are
    /// discarded, inbound never delivers.
    pub fn disconnected() -> (Self, Sender<NetMessage>, Receiver<NetMessage>) {
        let (in_tx, in_rx) = crossbeam_channel::unbounded();
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        (
            Self {
                inbound: in_rx,
                outbound: out_tx,
            },
            in_tx,
            out_rx,
        )
    }
}

pub struct LockstepSession {
    pub sim: GameSimulation,
    pub command_service: PlayerCommandService,
    mailbox: NetworkMailbox,

    local_player: PlayerId,
    scene_time: SceneTime,
    paused: bool,

    /// Commands collected from local input since the last submission.
    local_command_buffer: Vec<PlayerCommand>,

    /// Wall-clock milliseconds not yet converted into ticks.
    milliseconds_buffer: f32,

    /// Largest observed average round-trip time to any peer, in milliseconds.
    max_rtt_millis: f32,

    /// The most recent scene time acknowledged by each peer.
    peer_scene_times: Vec<SceneTime>,

    /// Hash exchange only happens between human participants; a lone human
    /// has nobody to disagree with.
    verify_hashes: bool,

    state_log: Option<StateLogStream>,
    blocked_logged: bool,
}

impl LockstepSession {
    pub fn new(
        sim: GameSimulation,
        local_player: PlayerId,
        mailbox: NetworkMailbox,
    ) -> Self {
        let mut command_service = PlayerCommandService::new();
        for _ in 0..sim.players.len() {
            command_service.register_player();
        }
        let peer_count = sim.players.len();
        let human_count = sim
            .players
            .iter()
            .filter(|p| p.player_type == GamePlayerType::Human)
            .count();
        let state_log = sim
            .config
            .state_log_path
            .as_ref()
            .and_then(|path| StateLogStream::create(std::path::Path::new(path)).ok());
        Self {
            sim,
            command_service,
            mailbox,
            local_player,
            scene_time: SceneTime::default(),
            paused: false,
            local_command_buffer: Vec::new(),
            milliseconds_buffer: 0.0,
            max_rtt_millis: 16.0,
            peer_scene_times: vec![SceneTime::default(); peer_count],
            verify_hashes: human_count > 1,
            state_log,
            blocked_logged: false,
        }
    }

    pub fn scene_time(&self) -> SceneTime {
        self.scene_time
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Queues a locally issued command for the next submission.
    pub fn collect_local_command(&mut self, command: PlayerCommand) {
        self.local_command_buffer.push(command);
    }

    /// Updates the RTT estimate from the network layer's measurements.
    pub fn set_max_rtt_millis(&mut self, rtt: f32) {
        self.max_rtt_millis = rtt;
    }

    /// Target number of buffered command frames, derived from peer latency.
    fn target_command_buffer_size(&self) -> usize {
        let max_rtt = self.max_rtt_millis.clamp(16.0, 2000.0);
        let high_latency_millis = max_rtt + (max_rtt / 4.0) + 200.0;
        (high_latency_millis / 16.0) as usize + 1
    }

    fn drain_mailbox(&mut self) {
        loop {
            match self.mailbox.inbound.try_recv() {
                Ok(NetMessage::Commands {
                    player,
                    scene_time,
                    commands,
                }) => {
                    self.command_service.push_commands(player, commands);
                    if let Some(peer_time) = self.peer_scene_times.get_mut(player.0) {
                        *peer_time = (*peer_time).max(SceneTime { value: scene_time });
                    }
                }
                Ok(NetMessage::Hash {
                    player,
                    hash,
                    ..
                }) => {
                    self.command_service.push_hash(player, hash);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Average of the peers' most recently acknowledged scene times.
    fn estimate_average_scene_time(&self) -> SceneTime {
        let mut sum = self.scene_time.value as u64;
        let mut count = 1u64;
        for (i, peer_time) in self.peer_scene_times.iter().enumerate() {
            if i == self.local_player.0 {
                continue;
            }
            if self.sim.players[i].player_type == GamePlayerType::Computer {
                continue;
            }
            sum += peer_time.value as u64;
            count += 1;
        }
        SceneTime {
            value: (sum / count) as u32,
        }
    }

    fn submit_commands(&mut self) {
        let target = self.target_command_buffer_size();
        let mut buffered = self
            .command_service
            .buffered_command_count(self.local_player);

        // Too many frames buffered: defer submission to drop back down.
        if buffered <= target {
            let commands = std::mem::take(&mut self.local_command_buffer);
            self.command_service
                .push_commands(self.local_player, commands.clone());
            let _ = self.mailbox.outbound.send(NetMessage::Commands {
                player: self.local_player,
                scene_time: self.scene_time.value,
                commands,
            });
            buffered += 1;
        }

        // Fill up to the required threshold with empty frames.
        while buffered < target {
            self.command_service
                .push_commands(self.local_player, Vec::new());
            let _ = self.mailbox.outbound.send(NetMessage::Commands {
                player: self.local_player,
                scene_time: self.scene_time.value,
                commands: Vec::new(),
            });
            buffered += 1;
        }

        // Computer players produce empty frames locally.
        for i in 0..self.sim.players.len() {
            let id = PlayerId(i);
            if self.sim.players[i].player_type == GamePlayerType::Computer
                && self.command_service.buffered_command_count(id) == 0
            {
                self.command_service.push_commands(id, Vec::new());
            }
        }
    }

    /// One frame of the outer loop: drain the network, submit commands, and
    /// run as many simulation steps as wall time allows, with catch-up.
    pub fn update(&mut self, elapsed_millis: f32) -> Result<(), LockstepError> {
        self.drain_mailbox();
        self.submit_commands();

        let average = self.estimate_average_scene_time();
        const FRAME_TOLERANCE: u32 = 3;
        const FRAME_CHECK_INTERVAL: u32 = 5;
        let high_scene_time = average.value + FRAME_TOLERANCE;
        let low_scene_time = average.value.saturating_sub(FRAME_TOLERANCE);

        self.milliseconds_buffer += elapsed_millis;
        let tick_millis = SIM_MILLISECONDS_PER_TICK as f32;
        while self.milliseconds_buffer >= tick_millis {
            self.milliseconds_buffer -= tick_millis;

            let at_check = self.scene_time.value % FRAME_CHECK_INTERVAL == 0;
            if at_check && self.scene_time.value > high_scene_time {
                // We are running ahead of our peers; skip this step to let
                // them catch up. Scene time still advances.
                self.scene_time.value += 1;
                continue;
            }

            self.try_tick_game()?;

            // Run an extra step every so often to catch back up.
            if at_check && self.scene_time.value < low_scene_time {
                self.try_tick_game()?;
            }
        }
        Ok(())
    }

    /// Attempts exactly one lockstep step.
    pub fn try_tick_game(&mut self) -> Result<(), LockstepError> {
        if !self.command_service.check_hashes() {
            let dump_name = format!("kestrel-dump-{}.json", self.scene_time.value);
            if let Err(e) = write_desync_dump(&self.sim, std::path::Path::new(&dump_name)) {
                error!("failed to write desync dump: {}", e);
            }
            return Err(LockstepError::Desync {
                scene_time: self.scene_time.value,
            });
        }

        let Some(command_sets) = self.command_service.try_pop_commands() else {
            if !self.blocked_logged {
                info!("blocked waiting for player commands");
                self.blocked_logged = true;
            }
            return Ok(());
        };
        self.blocked_logged = false;

        self.scene_time.value += 1;

        for (player, commands) in &command_sets {
            for command in commands {
                match command {
                    PlayerCommand::PauseGame => self.paused = true,
                    PlayerCommand::UnpauseGame => self.paused = false,
                    other => apply_player_command(&mut self.sim, *player, other),
                }
            }
        }

        if self.paused {
            return Ok(());
        }

        self.sim.tick()?;

        if self.verify_hashes {
            let hash = self.sim.compute_hash();
            self.command_service.push_hash(self.local_player, hash);
            let _ = self.mailbox.outbound.send(NetMessage::Hash {
                player: self.local_player,
                scene_time: self.scene_time.value,
                hash,
            });
        }

        if let Some(log) = &mut self.state_log {
            if let Err(e) = log.write_tick(&self.sim) {
                debug!("state log write failed: {}", e);
            }
        }

        Ok(())
    }

    pub fn last_hash(&self) -> GameHash {
        self.sim.compute_hash()
    }
}

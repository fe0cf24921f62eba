/// Lockstep command-and-hash protocol.
///
/// - **commands**: the player command model and its wire encoding
/// - **command_service**: per-player tick-slot buffers and the hash ledger
/// - **session**: the driver that sizes buffers from RTT, paces ticks and
///   detects desyncs
pub mod command_service;
pub mod commands;
pub mod session;

pub use command_service::PlayerCommandService;
pub use commands::{NetMessage, OrderMode, PlayerCommand, UnitCommandAction};
pub use session::{LockstepError, LockstepSession, NetworkMailbox, SceneTime};

pub mod game;
pub mod net;

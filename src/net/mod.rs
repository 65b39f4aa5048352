//! The TCP + newline-delimited-JSON net layer (spec §6).

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;

pub use broadcast::Broadcaster;
pub use protocol::{ClientMessage, ServerEvent};

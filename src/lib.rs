//! `cnc_core`: the controller session daemon's library crate. `cncd`
//! (`src/main.rs`) is a thin CLI shell around [`hub::SessionHub`] and
//! [`net::server::serve`].

pub mod config;
pub mod controllers;
pub mod error;
pub mod hub;
pub mod job;
pub mod net;
pub mod session;

pub use error::{CoreError, CoreResult};
pub use hub::SessionHub;

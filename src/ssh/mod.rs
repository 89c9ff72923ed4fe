//! Built-in SSH front door.
//!
//! Accepts public-key auth against stored keys and re-executes the `serv`
//! dispatcher for every exec request, bridging the channel to its stdio.

pub mod server;
pub mod session;

pub use server::start_ssh_server;

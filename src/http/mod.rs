//! HTTP front door for git.
//!
//! Serves the smart protocol (ref advertisement plus stateless RPC) and the
//! dumb protocol's static files below `/{owner}/{repo}/`, after the same
//! access decision the SSH path uses.

pub mod dumb;
pub mod handler;
pub mod routes;
pub mod rpc;

//! # Rill Client
//!
//! Utilities for connecting to and interacting with a Rill control server:
//! a thin framed-TCP connection plus typed helpers for the common calls.

mod tcp;

pub use rill_server::{ControlCommand, ControlResponse};
pub use tcp::RillConnection;

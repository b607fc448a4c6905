//! # Rill Server
//!
//! TCP control server for a Rill node.

mod server;

pub use server::{ControlCommand, ControlResponse, RillServer};

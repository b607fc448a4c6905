//! Actor instances and their lifecycle.
//!
//! Actor computation bodies live outside the core; what the runtime owns
//! is identity, lifecycle, managed state, and the port map. The migration
//! protocol itself is orchestrated by the node loop on top of
//! [`ActorManager`].

mod manager;
mod snapshot;

pub use manager::ActorManager;
pub use snapshot::{ActorSnapshot, ManagedState, StateField};

use crate::id::{ActorId, AppId, PortId, ReplicationId};
use crate::port::PortSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of a resident actor. `Migrating` is transient: it resolves to
/// removal (success) or back to the prior lifecycle (rollback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorLifecycle {
    Enabled,
    Disabled,
    Migrating,
}

/// Declarative description of an actor to instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorSpec {
    pub actor_type: String,
    pub name: String,
    #[serde(default)]
    pub state: ManagedState,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

#[derive(Debug)]
pub struct Actor {
    pub id: ActorId,
    pub actor_type: String,
    pub name: String,
    pub lifecycle: ActorLifecycle,
    pub state: ManagedState,
    /// Port name to port id; the ports themselves live in the port
    /// manager's table.
    pub ports: HashMap<String, PortId>,
    pub app_id: Option<AppId>,
    pub replication_id: Option<ReplicationId>,
}

impl Actor {
    pub fn is_enabled(&self) -> bool {
        self.lifecycle == ActorLifecycle::Enabled
    }
}

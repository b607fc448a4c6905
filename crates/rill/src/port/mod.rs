//! Ports and the port-connection graph.
//!
//! A port is a typed, directional connection point on an actor. Connection
//! state is independent of the owning actor's lifecycle and survives
//! temporary disconnects during migration. Routing policies are port-level
//! metadata; token interpretation belongs to the execution engine, not
//! here.

mod manager;

pub use manager::PortManager;

use crate::id::{ActorId, NodeId, PortId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    In,
    Out,
}

impl PortDirection {
    /// The direction a peer port must have to attach to this one.
    pub fn complement(&self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
        }
    }
}

/// Multi-peer routing policy. The port manager keeps the bookkeeping these
/// policies need (round-robin cursor, collect tags) but never interprets
/// per-token semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum RoutingPolicy {
    /// Broadcast to every peer.
    Fanout,
    /// Distribute across peers in turn.
    RoundRobin,
    /// Aggregate from peers, optionally keyed by tag.
    Collect { tag: Option<String> },
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self::Fanout
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortProperties {
    #[serde(default)]
    pub routing: RoutingPolicy,
    /// Number of peers the port accepts; connecting beyond it is a
    /// CONFLICT.
    #[serde(default = "default_nbr_peers")]
    pub nbr_peers: u32,
}

fn default_nbr_peers() -> u32 {
    1
}

impl Default for PortProperties {
    fn default() -> Self {
        Self {
            routing: RoutingPolicy::default(),
            nbr_peers: default_nbr_peers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    /// A connect or rewire is in flight.
    Pending,
    /// EXHAUST in progress: no new data accepted, queue draining.
    Exhausting,
}

/// Reference to a port on some node. Cross-node references are always
/// (node id, local id) pairs, never shared pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub node_id: NodeId,
    pub actor_id: ActorId,
    pub port_id: PortId,
}

/// Disconnect semantics, ordered from least to most final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DisconnectMode {
    /// Mark disconnected but retain peer metadata (migration rewiring).
    Temporary,
    /// Remove peer references on both sides, discard undelivered data.
    Terminate,
    /// Stop accepting new data, drain, then finalize as Terminate.
    Exhaust,
}

/// Declarative port definition, supplied at actor creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub direction: PortDirection,
    #[serde(default)]
    pub properties: PortProperties,
}

#[derive(Debug)]
pub struct Port {
    pub id: PortId,
    pub name: String,
    pub direction: PortDirection,
    pub actor_id: ActorId,
    pub properties: PortProperties,
    pub state: ConnectionState,
    pub peers: Vec<PeerRef>,
    /// Undelivered data, drained by the execution engine. Only its
    /// emptiness matters to EXHAUST finalization.
    pub queue: VecDeque<Value>,
    /// Round-robin cursor over `peers`.
    pub next_peer: usize,
}

impl Port {
    pub fn new(actor_id: ActorId, spec: &PortSpec) -> Self {
        Self {
            id: PortId::generate(),
            name: spec.name.clone(),
            direction: spec.direction,
            actor_id,
            properties: spec.properties.clone(),
            state: ConnectionState::Disconnected,
            peers: Vec::new(),
            queue: VecDeque::new(),
            next_peer: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether the peer-count policy admits one more peer.
    pub fn accepts_peer(&self) -> bool {
        (self.peers.len() as u32) < self.properties.nbr_peers
    }

    pub fn has_peer(&self, peer: &PeerRef) -> bool {
        self.peers.contains(peer)
    }

    /// JSON state report for the control API.
    pub fn report(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "direction": self.direction,
            "actor_id": self.actor_id,
            "properties": self.properties,
            "state": self.state,
            "peers": self.peers,
            "queued": self.queue.len(),
        })
    }
}

/// Serializable port image carried inside an actor snapshot. Peer
/// references are retained so the destination can resume connectivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSnapshot {
    pub id: PortId,
    pub name: String,
    pub direction: PortDirection,
    pub properties: PortProperties,
    pub state: ConnectionState,
    pub peers: Vec<PeerRef>,
    pub queue: Vec<Value>,
}

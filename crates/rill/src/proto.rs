//! Wire format for node-to-node links.
//!
//! Everything between two nodes travels as length-delimited JSON frames on
//! one TCP link per node pair. Logical tunnels are multiplexed on top;
//! requests are correlated to replies by a per-link monotonic message id.

use crate::actor::{ActorSnapshot, ActorSpec};
use crate::errors::ResponseStatus;
use crate::id::{ActorId, AppId, NodeId, PortId, ReplicationId};
use crate::port::{DisconnectMode, PeerRef, PortDirection, PortProperties};
use crate::registry::{RegistryOp, RegistryReply};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declared purpose of a tunnel; one tunnel per (peer, type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// Actor, port and replication coordination.
    Proto,
    /// Registry proxy traffic.
    Registry,
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proto => write!(f, "proto"),
            Self::Registry => write!(f, "registry"),
        }
    }
}

/// One frame on a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// First frame in each direction after TCP connect.
    Hello { node_id: NodeId, rt_uri: String },
    TunnelOpen {
        tunnel_id: Uuid,
        tunnel_type: TunnelType,
    },
    TunnelOpenReply {
        tunnel_type: TunnelType,
        ok: bool,
        reason: Option<String>,
    },
    TunnelClose { tunnel_type: TunnelType },
    Request {
        tunnel_type: TunnelType,
        msg_id: u64,
        payload: Payload,
    },
    Reply {
        msg_id: u64,
        status: ResponseStatus,
        body: ReplyBody,
    },
}

impl Frame {
    pub fn to_log(&self) -> String {
        match self {
            Frame::Hello { node_id, .. } => format!("Hello from {}", node_id),
            Frame::TunnelOpen { tunnel_type, .. } => format!("TunnelOpen {}", tunnel_type),
            Frame::TunnelOpenReply { tunnel_type, ok, .. } => {
                format!("TunnelOpenReply {} ok={}", tunnel_type, ok)
            }
            Frame::TunnelClose { tunnel_type } => format!("TunnelClose {}", tunnel_type),
            Frame::Request {
                tunnel_type,
                msg_id,
                ..
            } => format!("Request {} #{}", tunnel_type, msg_id),
            Frame::Reply { msg_id, status, .. } => format!("Reply #{} {}", msg_id, status),
        }
    }
}

/// Request payload, routed by tunnel type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Proto(ProtoRequest),
    Registry(RegistryOp),
}

/// Reply payload matching the request kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyBody {
    None,
    Proto(ProtoReply),
    Registry(RegistryReply),
}

/// Destination port addressing for a cross-node connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortTarget {
    pub actor_id: ActorId,
    pub port_name: Option<String>,
    pub port_id: Option<PortId>,
}

/// The requesting side of a cross-node connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortOrigin {
    pub peer: PeerRef,
    pub direction: PortDirection,
    pub properties: PortProperties,
}

/// Coordination requests carried on the Proto tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtoRequest {
    /// Instantiate a fresh actor here (deployment / replication).
    ActorNew {
        spec: ActorSpec,
        app_id: Option<AppId>,
        replication_id: Option<ReplicationId>,
    },
    ActorDestroy { actor_id: ActorId },
    /// Forwarded migration request, exactly one hop to the owner.
    ActorMigrateDirect {
        actor_id: ActorId,
        dest_node_id: NodeId,
    },
    /// Migration transfer: reconstruct this actor here and claim it.
    ActorTransfer { snapshot: ActorSnapshot },
    /// Cross-node connect handshake.
    PortConnect {
        target: PortTarget,
        origin: PortOrigin,
    },
    /// Forwarded connect: the receiving node owns the named port and runs
    /// the handshake itself (deployment wiring).
    PortSetup { request: crate::messages::ConnectRequest },
    /// A peer terminated the connection; drop the back-reference.
    PortDisconnect {
        port_id: PortId,
        peer: PeerRef,
        mode: DisconnectMode,
    },
    /// Migration rewiring: repoint one peer reference.
    PortReplacePeer {
        port_id: PortId,
        match_peer: PeerRef,
        new_peer: PeerRef,
    },
}

impl ProtoRequest {
    pub fn to_log(&self) -> String {
        match self {
            Self::ActorNew { spec, .. } => format!("ActorNew {}", spec.actor_type),
            Self::ActorDestroy { actor_id } => format!("ActorDestroy {}", actor_id),
            Self::ActorMigrateDirect { actor_id, .. } => {
                format!("ActorMigrateDirect {}", actor_id)
            }
            Self::ActorTransfer { snapshot } => format!("ActorTransfer {}", snapshot.actor_id),
            Self::PortConnect { target, .. } => format!("PortConnect -> {}", target.actor_id),
            Self::PortSetup { request } => format!(
                "PortSetup {}.{} -> {}.{}",
                request.actor_id, request.port_name, request.peer_actor_id, request.peer_port_name
            ),
            Self::PortDisconnect { port_id, .. } => format!("PortDisconnect {}", port_id),
            Self::PortReplacePeer { port_id, .. } => format!("PortReplacePeer {}", port_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtoReply {
    ActorCreated { actor_id: ActorId },
    PortConnected { port_id: PortId },
}

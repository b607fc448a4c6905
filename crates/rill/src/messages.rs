//! Commands consumed by the node runtime loop.
//!
//! Every operation on a node is a message through its command channel; the
//! loop owns all mutable state and replies through the enclosed oneshot
//! sender, so each asynchronous operation resolves exactly one completion.

use crate::actor::ActorSpec;
use crate::errors::ResponseStatus;
use crate::id::{ActorId, AppId, NodeId, PortId, ReplicationId};
use crate::node::NodeInfo;
use crate::port::{DisconnectMode, PeerRef, PortDirection};
use crate::proto::Frame;
use crate::registry::{RegistryOp, RegistryReply};
use crate::tunnel::{LinkHandle, TunnelEvent};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// A connect request as seen by the control plane: the local end by
/// actor/port name, the peer end by (node, actor, port name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub actor_id: ActorId,
    pub port_name: String,
    pub port_dir: PortDirection,
    pub peer_node_id: Option<NodeId>,
    pub peer_actor_id: ActorId,
    pub peer_port_name: String,
}

/// Port addressing for disconnect and property operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortSelector {
    pub actor_id: Option<ActorId>,
    pub port_name: Option<String>,
    pub port_id: Option<PortId>,
}

#[derive(Debug)]
pub enum NodeCommand {
    // -- control plane ---------------------------------------------------
    NodeInfo {
        response_tx: oneshot::Sender<NodeInfo>,
    },
    ListNodes {
        response_tx: oneshot::Sender<Result<Vec<NodeId>>>,
    },
    PeerSetup {
        uris: Vec<String>,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    NewActor {
        spec: ActorSpec,
        app_id: Option<AppId>,
        replication_id: Option<ReplicationId>,
        response_tx: oneshot::Sender<Result<ActorId>>,
    },
    DestroyActor {
        actor_id: ActorId,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    ListActors {
        response_tx: oneshot::Sender<Vec<ActorId>>,
    },
    ActorReport {
        actor_id: ActorId,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    EnableActor {
        actor_id: ActorId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    DisableActor {
        actor_id: ActorId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    MigrateActor {
        actor_id: ActorId,
        dest_node_id: NodeId,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    ConnectPorts {
        request: ConnectRequest,
        response_tx: oneshot::Sender<(ResponseStatus, Option<PortId>)>,
    },
    DisconnectPorts {
        selector: PortSelector,
        mode: DisconnectMode,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    SetPortProperty {
        selector: PortSelector,
        property: String,
        value: Value,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    GetPortState {
        selector: PortSelector,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    Replicate {
        replication_id: ReplicationId,
        peer_node_id: Option<NodeId>,
        dereplicate: bool,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    RegisterReplication {
        replication_id: ReplicationId,
        master: ActorId,
        response_tx: oneshot::Sender<()>,
    },
    StorageOp {
        op: RegistryOp,
        response_tx: oneshot::Sender<(ResponseStatus, RegistryReply)>,
    },
    RegisterApplication {
        app_id: AppId,
        name: String,
        actors: Vec<ActorId>,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    ListApplications {
        response_tx: oneshot::Sender<Vec<AppId>>,
    },
    GetApplication {
        app_id: AppId,
        response_tx: oneshot::Sender<Result<(String, Vec<ActorId>)>>,
    },
    RemoveApplication {
        app_id: AppId,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    SubscribeTunnelEvents {
        events_tx: mpsc::UnboundedSender<TunnelEvent>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },

    // -- cross-node / internal -------------------------------------------
    /// Create an actor on behalf of a remote deployer or the replication
    /// driver.
    RemoteActorNew {
        node_id: NodeId,
        spec: ActorSpec,
        app_id: Option<AppId>,
        replication_id: Option<ReplicationId>,
        response_tx: oneshot::Sender<Result<ActorId>>,
    },
    /// Destroy an actor wherever it lives, on behalf of a driver task.
    RemoteActorDestroy {
        node_id: NodeId,
        actor_id: ActorId,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    /// Forward a connect request to the node owning the originating port.
    ForwardConnect {
        owner: NodeId,
        request: ConnectRequest,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    /// Forward a migration request one hop to the actor's owner.
    ForwardMigrate {
        owner: NodeId,
        actor_id: ActorId,
        dest_node_id: NodeId,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    /// A link finished its handshake.
    LinkEstablished {
        link: LinkHandle,
        initiated: bool,
    },
    /// An outbound dial failed before the handshake completed.
    DialFailed {
        uri: String,
        error: String,
    },
    /// The link reader hit EOF or an error.
    LinkDown {
        peer: NodeId,
    },
    /// One decoded frame from a peer.
    LinkFrame {
        peer: NodeId,
        frame: Frame,
    },
    /// A spawned protocol driver wants to answer a tunnel request.
    TunnelReply {
        peer: NodeId,
        msg_id: u64,
        status: ResponseStatus,
        body: crate::proto::ReplyBody,
    },
    /// Transfer reply arrived for an in-flight migration.
    FinishMigration {
        actor_id: ActorId,
        dest_node_id: NodeId,
        transfer_status: ResponseStatus,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    /// Rewiring finished for a confirmed migration.
    CompleteMigration {
        actor_id: ActorId,
        dest_node_id: NodeId,
        failed_rewires: Vec<PeerRef>,
        response_tx: oneshot::Sender<ResponseStatus>,
    },
    /// Peer answered a cross-node port connect; attach locally on success.
    /// `origin` is the local end as the peer recorded it, so a failed
    /// local attach can be undone on the remote side.
    FinishConnect {
        origin: PeerRef,
        status: ResponseStatus,
        peer: Option<PeerRef>,
        response_tx: oneshot::Sender<(ResponseStatus, Option<PortId>)>,
    },
    /// The replication driver finished one scale operation.
    ReplicationDone {
        replication_id: ReplicationId,
        status: ResponseStatus,
        new_replica: Option<(NodeId, ActorId)>,
        dropped_replica: Option<ActorId>,
        response_tx: Option<oneshot::Sender<ResponseStatus>>,
    },
    /// Periodic maintenance: scheduler turn.
    Tick,
}

impl NodeCommand {
    pub fn to_log(&self) -> String {
        match self {
            Self::NodeInfo { .. } => "NodeInfo".into(),
            Self::ListNodes { .. } => "ListNodes".into(),
            Self::PeerSetup { uris, .. } => format!("PeerSetup: {} peers", uris.len()),
            Self::NewActor { spec, .. } => format!("NewActor: {}", spec.actor_type),
            Self::DestroyActor { actor_id, .. } => format!("DestroyActor: {}", actor_id),
            Self::ListActors { .. } => "ListActors".into(),
            Self::ActorReport { actor_id, .. } => format!("ActorReport: {}", actor_id),
            Self::EnableActor { actor_id, .. } => format!("EnableActor: {}", actor_id),
            Self::DisableActor { actor_id, .. } => format!("DisableActor: {}", actor_id),
            Self::MigrateActor {
                actor_id,
                dest_node_id,
                ..
            } => format!("MigrateActor: {} -> {}", actor_id, dest_node_id),
            Self::ConnectPorts { request, .. } => format!(
                "ConnectPorts: {}.{} -> {}.{}",
                request.actor_id, request.port_name, request.peer_actor_id, request.peer_port_name
            ),
            Self::DisconnectPorts { mode, .. } => format!("DisconnectPorts: {:?}", mode),
            Self::SetPortProperty { property, .. } => format!("SetPortProperty: {}", property),
            Self::GetPortState { .. } => "GetPortState".into(),
            Self::Replicate {
                replication_id,
                dereplicate,
                ..
            } => format!("Replicate: {} dereplicate={}", replication_id, dereplicate),
            Self::RegisterReplication { replication_id, .. } => {
                format!("RegisterReplication: {}", replication_id)
            }
            Self::StorageOp { op, .. } => format!("StorageOp: {}", op.to_log()),
            Self::RegisterApplication { name, .. } => format!("RegisterApplication: {}", name),
            Self::ListApplications { .. } => "ListApplications".into(),
            Self::GetApplication { app_id, .. } => format!("GetApplication: {}", app_id),
            Self::RemoveApplication { app_id, .. } => format!("RemoveApplication: {}", app_id),
            Self::SubscribeTunnelEvents { .. } => "SubscribeTunnelEvents".into(),
            Self::Shutdown { .. } => "Shutdown".into(),
            Self::RemoteActorNew { node_id, .. } => format!("RemoteActorNew on {}", node_id),
            Self::RemoteActorDestroy {
                node_id, actor_id, ..
            } => format!("RemoteActorDestroy: {} on {}", actor_id, node_id),
            Self::ForwardConnect { owner, .. } => format!("ForwardConnect via {}", owner),
            Self::ForwardMigrate {
                owner, actor_id, ..
            } => format!("ForwardMigrate: {} via {}", actor_id, owner),
            Self::LinkEstablished { link, .. } => format!("LinkEstablished: {}", link.peer),
            Self::DialFailed { uri, .. } => format!("DialFailed: {}", uri),
            Self::LinkDown { peer } => format!("LinkDown: {}", peer),
            Self::LinkFrame { peer, frame } => {
                format!("LinkFrame from {}: {}", peer, frame.to_log())
            }
            Self::TunnelReply { msg_id, .. } => format!("TunnelReply #{}", msg_id),
            Self::FinishMigration { actor_id, .. } => format!("FinishMigration: {}", actor_id),
            Self::CompleteMigration { actor_id, .. } => {
                format!("CompleteMigration: {}", actor_id)
            }
            Self::FinishConnect { origin, status, .. } => {
                format!("FinishConnect: {} {}", origin.port_id, status)
            }
            Self::ReplicationDone { replication_id, .. } => {
                format!("ReplicationDone: {}", replication_id)
            }
            Self::Tick => "Tick".into(),
        }
    }
}

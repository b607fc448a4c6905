//! Control protocol: length-delimited JSON over TCP, one request frame to
//! one response frame, except `SubscribeTunnelEvents` which streams event
//! frames until the connection closes.

use anyhow::Result;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info};

use rill::app::{DeployRequest, DeployResult, Deployer, Requirement};
use rill::messages::{ConnectRequest, PortSelector};
use rill::node::{Node, NodeHandle, NodeInfo};
use rill::registry::{RegistryOp, RegistryReply};
use rill::shutdown::ShutdownController;
use rill::{
    ActorId, ActorSpec, AppId, DisconnectMode, NodeConfig, NodeId, PortId, ReplicationId,
    ResponseStatus, TunnelEvent,
};

#[derive(Debug, Serialize, Deserialize)]
pub enum ControlCommand {
    NodeInfo,
    ListNodes,
    PeerSetup {
        uris: Vec<String>,
    },
    NewActor {
        spec: ActorSpec,
    },
    DestroyActor {
        actor_id: ActorId,
    },
    ListActors,
    ActorReport {
        actor_id: ActorId,
    },
    EnableActor {
        actor_id: ActorId,
    },
    DisableActor {
        actor_id: ActorId,
    },
    MigrateActor {
        actor_id: ActorId,
        dest_node_id: NodeId,
    },
    UpdateRequirements {
        actor_id: ActorId,
        requirements: Vec<Requirement>,
        keep: bool,
    },
    ConnectPorts {
        request: ConnectRequest,
    },
    DisconnectPorts {
        selector: PortSelector,
        mode: DisconnectMode,
    },
    SetPortProperty {
        selector: PortSelector,
        property: String,
        value: Value,
    },
    GetPortState {
        selector: PortSelector,
    },
    Deploy {
        request: DeployRequest,
    },
    DestroyApplication {
        app_id: AppId,
    },
    ListApplications,
    GetApplication {
        app_id: AppId,
    },
    Replicate {
        replication_id: ReplicationId,
        peer_node_id: Option<NodeId>,
        dereplicate: bool,
    },
    RegisterReplication {
        replication_id: ReplicationId,
        master: ActorId,
    },
    Storage {
        op: RegistryOp,
    },
    SubscribeTunnelEvents,
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    NodeInfo {
        info: NodeInfo,
    },
    Nodes {
        nodes: Vec<NodeId>,
    },
    Status {
        status: ResponseStatus,
    },
    ActorCreated {
        actor_id: ActorId,
    },
    Actors {
        actors: Vec<ActorId>,
    },
    Report {
        report: Value,
    },
    Connected {
        status: ResponseStatus,
        port_id: Option<PortId>,
    },
    PortState {
        state: Value,
    },
    Deployed {
        result: DeployResult,
    },
    Applications {
        apps: Vec<AppId>,
    },
    Application {
        name: String,
        actors: Vec<ActorId>,
    },
    Storage {
        status: ResponseStatus,
        reply: RegistryReply,
    },
    TunnelEvent {
        event: TunnelEvent,
    },
    ShuttingDown,
    Error {
        message: String,
    },
}

pub struct RillServer {
    node: Node,
    handle: NodeHandle,
    control_socket: TcpListener,
}

impl RillServer {
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let control_socket = TcpListener::bind(&config.control_addr).await?;
        let (node, handle) = Node::new(config);
        Ok(Self {
            node,
            handle,
            control_socket,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "Rill control server on {:?}",
            self.control_socket.local_addr()?
        );

        let mut shutdown = ShutdownController::new();
        let node_shutdown = shutdown.subscribe();
        let node = self.node;
        let mut runtime_handle = tokio::spawn(async move {
            if let Err(e) = node.run(node_shutdown).await {
                error!("Node runtime failed: {}", e);
            }
        });

        loop {
            tokio::select! {
                accepted = self.control_socket.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            info!("Control connection from {}", addr);
                            let handle = self.handle.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_control_connection(socket, handle).await {
                                    debug!("Control connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Control accept failed: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting node down");
                    shutdown.signal_shutdown().await;
                    runtime_handle.await?;
                    return Ok(());
                }
                result = &mut runtime_handle => {
                    if let Err(e) = result {
                        error!("Node task failed: {}", e);
                    }
                    info!("Node runtime stopped, control server exiting");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_control_connection(socket: TcpStream, handle: NodeHandle) -> Result<()> {
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());

    while let Some(msg) = framed.next().await {
        let msg = msg?;
        let command: ControlCommand = match serde_json::from_slice(&msg) {
            Ok(command) => command,
            Err(e) => {
                let response = ControlResponse::Error {
                    message: format!("undecodable command: {}", e),
                };
                framed
                    .send(Bytes::from(serde_json::to_vec(&response)?))
                    .await?;
                continue;
            }
        };
        debug!("Control command: {:?}", command);

        if matches!(command, ControlCommand::SubscribeTunnelEvents) {
            let mut events = handle.subscribe_tunnel_events().await?;
            while let Some(event) = events.recv().await {
                let response = ControlResponse::TunnelEvent { event };
                framed
                    .send(Bytes::from(serde_json::to_vec(&response)?))
                    .await?;
            }
            return Ok(());
        }

        let shutting_down = matches!(command, ControlCommand::Shutdown);
        let response = dispatch(&handle, command).await;
        framed
            .send(Bytes::from(serde_json::to_vec(&response)?))
            .await?;
        if shutting_down {
            return Ok(());
        }
    }
    Ok(())
}

fn error_response(e: impl std::fmt::Display) -> ControlResponse {
    ControlResponse::Error {
        message: e.to_string(),
    }
}

async fn dispatch(handle: &NodeHandle, command: ControlCommand) -> ControlResponse {
    match command {
        ControlCommand::NodeInfo => match handle.node_info().await {
            Ok(info) => ControlResponse::NodeInfo { info },
            Err(e) => error_response(e),
        },
        ControlCommand::ListNodes => match handle.list_nodes().await {
            Ok(nodes) => ControlResponse::Nodes { nodes },
            Err(e) => error_response(e),
        },
        ControlCommand::PeerSetup { uris } => match handle.peer_setup(uris).await {
            Ok(status) => ControlResponse::Status { status },
            Err(e) => error_response(e),
        },
        ControlCommand::NewActor { spec } => match handle.new_actor(spec).await {
            Ok(actor_id) => ControlResponse::ActorCreated { actor_id },
            Err(e) => error_response(e),
        },
        ControlCommand::DestroyActor { actor_id } => match handle.destroy_actor(actor_id).await {
            Ok(status) => ControlResponse::Status { status },
            Err(e) => error_response(e),
        },
        ControlCommand::ListActors => match handle.list_actors().await {
            Ok(actors) => ControlResponse::Actors { actors },
            Err(e) => error_response(e),
        },
        ControlCommand::ActorReport { actor_id } => match handle.actor_report(actor_id).await {
            Ok(report) => ControlResponse::Report { report },
            Err(e) => error_response(e),
        },
        ControlCommand::EnableActor { actor_id } => match handle.enable_actor(actor_id).await {
            Ok(()) => ControlResponse::Status {
                status: ResponseStatus::Ok,
            },
            Err(e) => error_response(e),
        },
        ControlCommand::DisableActor { actor_id } => match handle.disable_actor(actor_id).await {
            Ok(()) => ControlResponse::Status {
                status: ResponseStatus::Ok,
            },
            Err(e) => error_response(e),
        },
        ControlCommand::MigrateActor {
            actor_id,
            dest_node_id,
        } => match handle.migrate_actor(actor_id, dest_node_id).await {
            Ok(status) => ControlResponse::Status { status },
            Err(e) => error_response(e),
        },
        ControlCommand::UpdateRequirements {
            actor_id,
            requirements,
            keep,
        } => {
            let deployer = Deployer::new(handle.clone());
            match deployer
                .migrate_with_requirements(actor_id, requirements, keep)
                .await
            {
                Ok(status) => ControlResponse::Status { status },
                Err(e) => error_response(e),
            }
        }
        ControlCommand::ConnectPorts { request } => match handle.connect_ports(request).await {
            Ok((status, port_id)) => ControlResponse::Connected { status, port_id },
            Err(e) => error_response(e),
        },
        ControlCommand::DisconnectPorts { selector, mode } => {
            match handle.disconnect_ports(selector, mode).await {
                Ok(status) => ControlResponse::Status { status },
                Err(e) => error_response(e),
            }
        }
        ControlCommand::SetPortProperty {
            selector,
            property,
            value,
        } => match handle.set_port_property(selector, property, value).await {
            Ok(status) => ControlResponse::Status { status },
            Err(e) => error_response(e),
        },
        ControlCommand::GetPortState { selector } => match handle.get_port_state(selector).await {
            Ok(state) => ControlResponse::PortState { state },
            Err(e) => error_response(e),
        },
        ControlCommand::Deploy { request } => {
            let deployer = Deployer::new(handle.clone());
            match deployer.deploy(request).await {
                Ok(result) => ControlResponse::Deployed { result },
                Err(e) => error_response(e),
            }
        }
        ControlCommand::DestroyApplication { app_id } => {
            let deployer = Deployer::new(handle.clone());
            match deployer.destroy(app_id).await {
                Ok(status) => ControlResponse::Status { status },
                Err(e) => error_response(e),
            }
        }
        ControlCommand::ListApplications => match handle.list_applications().await {
            Ok(apps) => ControlResponse::Applications { apps },
            Err(e) => error_response(e),
        },
        ControlCommand::GetApplication { app_id } => match handle.get_application(app_id).await {
            Ok((name, actors)) => ControlResponse::Application { name, actors },
            Err(e) => error_response(e),
        },
        ControlCommand::Replicate {
            replication_id,
            peer_node_id,
            dereplicate,
        } => match handle
            .replicate(replication_id, peer_node_id, dereplicate)
            .await
        {
            Ok(status) => ControlResponse::Status { status },
            Err(e) => error_response(e),
        },
        ControlCommand::RegisterReplication {
            replication_id,
            master,
        } => match handle.register_replication(replication_id, master).await {
            Ok(()) => ControlResponse::Status {
                status: ResponseStatus::Ok,
            },
            Err(e) => error_response(e),
        },
        ControlCommand::Storage { op } => match handle.storage_op(op).await {
            Ok((status, reply)) => ControlResponse::Storage { status, reply },
            Err(e) => error_response(e),
        },
        ControlCommand::Shutdown => match handle.shutdown().await {
            Ok(()) => ControlResponse::ShuttingDown,
            Err(e) => error_response(e),
        },
        ControlCommand::SubscribeTunnelEvents => ControlResponse::Error {
            message: "subscription handled at connection level".to_string(),
        },
    }
}

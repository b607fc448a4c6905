//! The node runtime: one task owning all local state, driven by
//! [`NodeCommand`] messages.
//!
//! Multi-step cross-node protocols (migration, replication, connect
//! handshakes) never block the loop. Each step that waits on a peer is a
//! spawned driver task holding the reply receiver; the driver re-enters
//! the loop with an internal command carrying the outcome and the original
//! response sender.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::actor::{ActorManager, ActorSnapshot, ActorSpec};
use crate::app::AppManager;
use crate::config::NodeConfig;
use crate::errors::{ResponseStatus, RuntimeError};
use crate::id::{ActorId, AppId, NodeId, PortId, ReplicationId};
use crate::messages::{ConnectRequest, NodeCommand, PortSelector};
use crate::port::{
    ConnectionState, DisconnectMode, PeerRef, PortManager, PortSpec,
};
use crate::proto::{
    Frame, Payload, PortOrigin, PortTarget, ProtoReply, ProtoRequest, ReplyBody, TunnelType,
};
use crate::registry::{
    actor_key, app_key, attribute_index, node_index, node_key, reconcile_key, LocalStore,
    RegistryOp, RegistryReply, StorageMode,
};
use crate::replication::{AlwaysLeader, LeaderElector, ReplicationManager};
use crate::scheduler::Scheduler;
use crate::shutdown::ShutdownReceiver;
use crate::tunnel::{handshake_and_spawn, open_outbound, LinkHandle, TunnelEvent, TunnelManager};
use crate::Result;

/// How long a handle waits for the loop to answer before reporting a
/// timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on one remote step of a migration or replication.
const PROTOCOL_STEP_TIMEOUT: Duration = Duration::from_secs(30);

const COMMAND_CHANNEL_DEPTH: usize = 64;
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Identity and reachability of a node, as reported over the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub name: String,
    pub rt_uri: String,
    pub control_addr: String,
    pub attributes: BTreeMap<String, String>,
}

/// Cloneable sender side of the node loop. All methods round-trip through
/// the command channel with a bounded wait.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    pub fn new(commands: mpsc::Sender<NodeCommand>) -> Self {
        Self { commands }
    }

    async fn roundtrip<T>(&self, command: NodeCommand, rx: oneshot::Receiver<T>) -> Result<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RuntimeError::ChannelClosed("node command channel".to_string()))?;
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RuntimeError::Timeout),
        }
    }

    pub async fn node_info(&self) -> Result<NodeInfo> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(NodeCommand::NodeInfo { response_tx: tx }, rx).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeId>> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(NodeCommand::ListNodes { response_tx: tx }, rx)
            .await?
    }

    pub async fn peer_setup(&self, uris: Vec<String>) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::PeerSetup {
                uris,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn new_actor(&self, spec: ActorSpec) -> Result<ActorId> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::NewActor {
                spec,
                app_id: None,
                replication_id: None,
                response_tx: tx,
            },
            rx,
        )
        .await?
    }

    /// Create an actor on a specific node, local or remote.
    pub async fn new_actor_on(
        &self,
        node_id: NodeId,
        spec: ActorSpec,
        app_id: Option<AppId>,
        replication_id: Option<ReplicationId>,
    ) -> Result<ActorId> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::RemoteActorNew {
                node_id,
                spec,
                app_id,
                replication_id,
                response_tx: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn destroy_actor(&self, actor_id: ActorId) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::DestroyActor {
                actor_id,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn destroy_actor_on(
        &self,
        node_id: NodeId,
        actor_id: ActorId,
    ) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::RemoteActorDestroy {
                node_id,
                actor_id,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn list_actors(&self) -> Result<Vec<ActorId>> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(NodeCommand::ListActors { response_tx: tx }, rx).await
    }

    pub async fn actor_report(&self, actor_id: ActorId) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::ActorReport {
                actor_id,
                response_tx: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn enable_actor(&self, actor_id: ActorId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::EnableActor {
                actor_id,
                response_tx: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn disable_actor(&self, actor_id: ActorId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::DisableActor {
                actor_id,
                response_tx: tx,
            },
            rx,
        )
        .await?
    }

    /// Migration handles can outlive [`REQUEST_TIMEOUT`]; the transfer and
    /// rewiring steps have their own bound inside the loop.
    pub async fn migrate_actor(
        &self,
        actor_id: ActorId,
        dest_node_id: NodeId,
    ) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::MigrateActor {
                actor_id,
                dest_node_id,
                response_tx: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed("node command channel".to_string()))?;
        match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT * 2, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RuntimeError::Timeout),
        }
    }

    pub async fn connect_ports(
        &self,
        request: ConnectRequest,
    ) -> Result<(ResponseStatus, Option<PortId>)> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::ConnectPorts {
                request,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    /// Connect two ports on behalf of a deployer, issuing the handshake
    /// from the node that owns the originating port.
    pub async fn connect_ports_on(
        &self,
        owner: NodeId,
        request: ConnectRequest,
    ) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::ForwardConnect {
                owner,
                request,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn disconnect_ports(
        &self,
        selector: PortSelector,
        mode: DisconnectMode,
    ) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::DisconnectPorts {
                selector,
                mode,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn set_port_property(
        &self,
        selector: PortSelector,
        property: String,
        value: Value,
    ) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::SetPortProperty {
                selector,
                property,
                value,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn get_port_state(&self, selector: PortSelector) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::GetPortState {
                selector,
                response_tx: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn replicate(
        &self,
        replication_id: ReplicationId,
        peer_node_id: Option<NodeId>,
        dereplicate: bool,
    ) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::Replicate {
                replication_id,
                peer_node_id,
                dereplicate,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn register_replication(
        &self,
        replication_id: ReplicationId,
        master: ActorId,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::RegisterReplication {
                replication_id,
                master,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn storage_op(&self, op: RegistryOp) -> Result<(ResponseStatus, RegistryReply)> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(NodeCommand::StorageOp { op, response_tx: tx }, rx).await
    }

    pub async fn register_application(
        &self,
        app_id: AppId,
        name: String,
        actors: Vec<ActorId>,
    ) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::RegisterApplication {
                app_id,
                name,
                actors,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn list_applications(&self) -> Result<Vec<AppId>> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(NodeCommand::ListApplications { response_tx: tx }, rx)
            .await
    }

    pub async fn get_application(&self, app_id: AppId) -> Result<(String, Vec<ActorId>)> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::GetApplication {
                app_id,
                response_tx: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn remove_application(&self, app_id: AppId) -> Result<ResponseStatus> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            NodeCommand::RemoveApplication {
                app_id,
                response_tx: tx,
            },
            rx,
        )
        .await
    }

    pub async fn subscribe_tunnel_events(&self) -> Result<mpsc::UnboundedReceiver<TunnelEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(NodeCommand::SubscribeTunnelEvents { events_tx: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed("node command channel".to_string()))?;
        Ok(rx)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(NodeCommand::Shutdown { response_tx: tx }, rx).await
    }
}

/// Which store answers this node's registry operations.
enum StorageBackend {
    Local,
    Proxy { uri: String, peer: Option<NodeId> },
}

pub struct Node {
    node_id: NodeId,
    config: NodeConfig,
    attributes: BTreeMap<String, String>,
    commands_tx: mpsc::Sender<NodeCommand>,
    commands_rx: mpsc::Receiver<NodeCommand>,
    actors: ActorManager,
    ports: PortManager,
    tunnels: TunnelManager,
    replication: ReplicationManager,
    scheduler: Scheduler,
    apps: AppManager,
    store: LocalStore,
    storage: StorageBackend,
    announced: bool,
    event_subs: Vec<mpsc::UnboundedSender<TunnelEvent>>,
    /// Dial results awaited by PeerSetup, keyed by normalized address.
    dial_waiters: HashMap<String, Vec<oneshot::Sender<ResponseStatus>>>,
    /// Port states captured before a TEMPORARY disconnect, for rollback.
    migration_saved: HashMap<ActorId, Vec<(PortId, ConnectionState)>>,
}

fn normalize_uri(uri: &str) -> String {
    uri.strip_prefix("rill://").unwrap_or(uri).to_string()
}

impl Node {
    pub fn new(config: NodeConfig) -> (Self, NodeHandle) {
        Self::with_elector(config, Box::new(AlwaysLeader))
    }

    /// Build a node with an external leadership predicate for its
    /// replication groups. `new` defaults to [`AlwaysLeader`].
    pub fn with_elector(
        config: NodeConfig,
        elector: Box<dyn LeaderElector>,
    ) -> (Self, NodeHandle) {
        let node_id = NodeId::generate();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let handle = NodeHandle::new(commands_tx.clone());

        let mut attributes = config.attributes.clone();
        attributes.insert("node_name".to_string(), config.name.clone());

        let storage = match &config.storage {
            StorageMode::Local => StorageBackend::Local,
            StorageMode::Proxy { uri } => StorageBackend::Proxy {
                uri: normalize_uri(uri),
                peer: None,
            },
        };

        let node = Self {
            node_id,
            attributes,
            commands_tx,
            commands_rx,
            actors: ActorManager::new(),
            ports: PortManager::new(node_id),
            tunnels: TunnelManager::new(node_id),
            replication: ReplicationManager::new(elector),
            scheduler: Scheduler::new(),
            apps: AppManager::new(),
            store: LocalStore::new(),
            storage,
            announced: false,
            event_subs: Vec::new(),
            dial_waiters: HashMap::new(),
            migration_saved: HashMap::new(),
            config,
        };
        (node, handle)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn rt_uri(&self) -> String {
        self.config.rt_uri()
    }

    /// Run until a Shutdown command or the shutdown signal arrives.
    pub async fn run(mut self, mut shutdown: ShutdownReceiver) -> Result<()> {
        let listener = TcpListener::bind(&self.config.rt_addr).await?;
        info!(
            "Node {} ({}) listening on {}",
            self.node_id, self.config.name, self.config.rt_addr
        );

        if matches!(self.storage, StorageBackend::Local) {
            self.announce_node();
        }

        let mut startup_peers = self.config.peers.clone();
        if let StorageBackend::Proxy { uri, .. } = &self.storage {
            let uri = uri.clone();
            if !startup_peers.iter().any(|p| normalize_uri(p) == uri) {
                startup_peers.push(uri);
            }
        }
        for uri in startup_peers {
            self.spawn_dial(normalize_uri(&uri));
        }

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                Some(command) = self.commands_rx.recv() => {
                    debug!("Node command: {}", command.to_log());
                    if !self.handle_command(command) {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("Inbound connection from {}", addr);
                            let commands = self.commands_tx.clone();
                            let node_id = self.node_id;
                            let rt_uri = self.rt_uri();
                            tokio::spawn(async move {
                                if let Err(e) = handshake_and_spawn(
                                    stream, node_id, rt_uri, commands, false,
                                )
                                .await
                                {
                                    warn!("Inbound handshake failed: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Accept failed: {}", e),
                    }
                }
                _ = ticker.tick() => self.handle_tick(),
                signal = &mut shutdown.receiver => {
                    info!("Node {} received shutdown signal", self.node_id);
                    self.teardown();
                    if let Ok(signal) = signal {
                        if let Some(sender) = signal.sender {
                            let _ = sender.send(());
                        }
                    }
                    return Ok(());
                }
            }
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        self.retract_node();
        let events = self.tunnels.close_all();
        self.dispatch_events(events);
    }

    /// Returns false when the loop should stop.
    fn handle_command(&mut self, command: NodeCommand) -> bool {
        match command {
            NodeCommand::NodeInfo { response_tx } => {
                let _ = response_tx.send(NodeInfo {
                    node_id: self.node_id,
                    name: self.config.name.clone(),
                    rt_uri: self.rt_uri(),
                    control_addr: self.config.control_addr.clone(),
                    attributes: self.attributes.clone(),
                });
            }
            NodeCommand::ListNodes { response_tx } => {
                let rx = self.storage_request(RegistryOp::GetIndex {
                    index: node_index(),
                });
                tokio::spawn(async move {
                    let result = match rx.await {
                        Ok((status, reply)) if status.is_ok() => Ok(reply
                            .into_values()
                            .iter()
                            .filter_map(|v| NodeId::parse(v).ok())
                            .collect()),
                        Ok((status, _)) => Err(RuntimeError::Internal(format!(
                            "node index read failed: {}",
                            status
                        ))),
                        Err(e) => Err(e.into()),
                    };
                    let _ = response_tx.send(result);
                });
            }
            NodeCommand::PeerSetup { uris, response_tx } => {
                self.handle_peer_setup(uris, response_tx);
            }
            NodeCommand::NewActor {
                spec,
                app_id,
                replication_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.create_local(&spec, app_id, replication_id));
            }
            NodeCommand::RemoteActorNew {
                node_id,
                spec,
                app_id,
                replication_id,
                response_tx,
            } => {
                if node_id == self.node_id {
                    let _ = response_tx.send(self.create_local(&spec, app_id, replication_id));
                } else {
                    let rx = self.tunnels.request(
                        node_id,
                        TunnelType::Proto,
                        Payload::Proto(ProtoRequest::ActorNew {
                            spec,
                            app_id,
                            replication_id,
                        }),
                    );
                    tokio::spawn(async move {
                        let result = match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT, rx).await {
                            Ok(Ok((status, ReplyBody::Proto(ProtoReply::ActorCreated { actor_id }))))
                                if status.is_ok() =>
                            {
                                Ok(actor_id)
                            }
                            Ok(Ok((status, _))) => Err(RuntimeError::Internal(format!(
                                "remote actor creation failed: {}",
                                status
                            ))),
                            Ok(Err(e)) => Err(e.into()),
                            Err(_) => Err(RuntimeError::Timeout),
                        };
                        let _ = response_tx.send(result);
                    });
                }
            }
            NodeCommand::DestroyActor {
                actor_id,
                response_tx,
            } => {
                let status = match self.destroy_local(&actor_id) {
                    Ok(()) => ResponseStatus::Ok,
                    Err(e) => e.status(),
                };
                let _ = response_tx.send(status);
            }
            NodeCommand::RemoteActorDestroy {
                node_id,
                actor_id,
                response_tx,
            } => {
                if node_id == self.node_id {
                    let status = match self.destroy_local(&actor_id) {
                        Ok(()) => ResponseStatus::Ok,
                        Err(e) => e.status(),
                    };
                    let _ = response_tx.send(status);
                } else {
                    let rx = self.tunnels.request(
                        node_id,
                        TunnelType::Proto,
                        Payload::Proto(ProtoRequest::ActorDestroy { actor_id }),
                    );
                    tokio::spawn(async move {
                        let status = match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT, rx).await {
                            Ok(Ok((status, _))) => status,
                            _ => ResponseStatus::ServiceUnavailable,
                        };
                        let _ = response_tx.send(status);
                    });
                }
            }
            NodeCommand::ListActors { response_tx } => {
                let mut ids = self.actors.list();
                ids.sort();
                let _ = response_tx.send(ids);
            }
            NodeCommand::ActorReport {
                actor_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.actors.report(&actor_id, &self.ports));
            }
            NodeCommand::EnableActor {
                actor_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.actors.enable(&actor_id));
            }
            NodeCommand::DisableActor {
                actor_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.actors.disable(&actor_id));
            }
            NodeCommand::MigrateActor {
                actor_id,
                dest_node_id,
                response_tx,
            } => {
                if self.actors.contains(&actor_id) {
                    self.start_migration(actor_id, dest_node_id, response_tx);
                } else {
                    self.forward_migration(actor_id, dest_node_id, response_tx);
                }
            }
            NodeCommand::ForwardConnect {
                owner,
                request,
                response_tx,
            } => {
                let rx = self.tunnels.request(
                    owner,
                    TunnelType::Proto,
                    Payload::Proto(ProtoRequest::PortSetup { request }),
                );
                tokio::spawn(async move {
                    let status = match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT, rx).await {
                        Ok(Ok((status, _))) => status,
                        _ => ResponseStatus::ServiceUnavailable,
                    };
                    let _ = response_tx.send(status);
                });
            }
            NodeCommand::ForwardMigrate {
                owner,
                actor_id,
                dest_node_id,
                response_tx,
            } => {
                let rx = self.tunnels.request(
                    owner,
                    TunnelType::Proto,
                    Payload::Proto(ProtoRequest::ActorMigrateDirect {
                        actor_id,
                        dest_node_id,
                    }),
                );
                tokio::spawn(async move {
                    let status = match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT * 2, rx).await {
                        Ok(Ok((status, _))) => status,
                        _ => ResponseStatus::ServiceUnavailable,
                    };
                    let _ = response_tx.send(status);
                });
            }
            NodeCommand::FinishMigration {
                actor_id,
                dest_node_id,
                transfer_status,
                response_tx,
            } => {
                self.finish_migration(actor_id, dest_node_id, transfer_status, response_tx);
            }
            NodeCommand::CompleteMigration {
                actor_id,
                dest_node_id,
                failed_rewires,
                response_tx,
            } => {
                self.complete_migration(actor_id, dest_node_id, failed_rewires);
                let _ = response_tx.send(ResponseStatus::Ok);
            }
            NodeCommand::ConnectPorts {
                request,
                response_tx,
            } => {
                self.handle_connect(request, response_tx);
            }
            NodeCommand::FinishConnect {
                origin,
                status,
                peer,
                response_tx,
            } => {
                let port_id = origin.port_id;
                let result = match (status.is_ok(), peer) {
                    (true, Some(peer)) => {
                        let attach = (|| {
                            let peer_dir = self.ports.get(&port_id)?.direction.complement();
                            self.ports.validate_attach(&port_id, peer_dir, &peer)?;
                            self.ports.attach_peer(&port_id, peer)
                        })();
                        match attach {
                            Ok(()) => (ResponseStatus::Ok, Some(port_id)),
                            Err(e) => {
                                warn!("Connect confirmed remotely but local attach failed: {}", e);
                                self.undo_remote_attach(origin, peer);
                                (e.status(), None)
                            }
                        }
                    }
                    _ => (status, None),
                };
                let _ = response_tx.send(result);
            }
            NodeCommand::DisconnectPorts {
                selector,
                mode,
                response_tx,
            } => {
                let status = match self.disconnect_ports(&selector, mode) {
                    Ok(()) => ResponseStatus::Ok,
                    Err(e) => e.status(),
                };
                let _ = response_tx.send(status);
            }
            NodeCommand::SetPortProperty {
                selector,
                property,
                value,
                response_tx,
            } => {
                let result = self
                    .resolve_selector(&selector)
                    .and_then(|pid| self.ports.set_property(&pid, &property, &value));
                let status = match result {
                    Ok(()) => ResponseStatus::Ok,
                    Err(e) => e.status(),
                };
                let _ = response_tx.send(status);
            }
            NodeCommand::GetPortState {
                selector,
                response_tx,
            } => {
                let result = self
                    .resolve_selector(&selector)
                    .and_then(|pid| self.ports.port_state(&pid));
                let _ = response_tx.send(result);
            }
            NodeCommand::Replicate {
                replication_id,
                peer_node_id,
                dereplicate,
                response_tx,
            } => {
                self.handle_replicate(replication_id, peer_node_id, dereplicate, response_tx);
            }
            NodeCommand::RegisterReplication {
                replication_id,
                master,
                response_tx,
            } => {
                self.replication.register_group(replication_id, master);
                if let Ok(actor) = self.actors.get_mut(&master) {
                    actor.replication_id = Some(replication_id);
                }
                let _ = response_tx.send(());
            }
            NodeCommand::ReplicationDone {
                replication_id,
                status,
                new_replica,
                dropped_replica,
                response_tx,
            } => {
                self.replication.finish(&replication_id);
                if status.is_ok() {
                    if let Some((node, actor)) = new_replica {
                        debug!("Replica {} created on {}", actor, node);
                        self.replication.record_replica(&replication_id, actor);
                    }
                    if let Some(actor) = dropped_replica {
                        self.replication.drop_replica(&replication_id, &actor);
                    }
                }
                if let Some(tx) = response_tx {
                    let _ = tx.send(status);
                }
            }
            NodeCommand::StorageOp { op, response_tx } => {
                let rx = self.storage_request(op);
                tokio::spawn(async move {
                    let outcome = rx.await.unwrap_or((
                        ResponseStatus::InternalError,
                        RegistryReply::Done,
                    ));
                    let _ = response_tx.send(outcome);
                });
            }
            NodeCommand::RegisterApplication {
                app_id,
                name,
                actors,
                response_tx,
            } => {
                self.apps.register(app_id, name.clone(), actors.clone());
                self.storage_fire(RegistryOp::Set {
                    key: app_key(&app_id),
                    value: json!({ "name": name, "actors": actors }),
                });
                let _ = response_tx.send(ResponseStatus::Created);
            }
            NodeCommand::ListApplications { response_tx } => {
                let _ = response_tx.send(self.apps.list());
            }
            NodeCommand::GetApplication {
                app_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.apps.get(&app_id));
            }
            NodeCommand::RemoveApplication {
                app_id,
                response_tx,
            } => {
                let status = match self.apps.remove(&app_id) {
                    Ok(actors) => {
                        for actor_id in actors {
                            if let Err(e) = self.destroy_local(&actor_id) {
                                debug!("Actor {} already gone: {}", actor_id, e);
                            }
                        }
                        self.storage_fire(RegistryOp::Delete {
                            key: app_key(&app_id),
                        });
                        ResponseStatus::Ok
                    }
                    Err(e) => e.status(),
                };
                let _ = response_tx.send(status);
            }
            NodeCommand::SubscribeTunnelEvents { events_tx } => {
                self.event_subs.push(events_tx);
            }
            NodeCommand::Shutdown { response_tx } => {
                let _ = response_tx.send(());
                return false;
            }
            NodeCommand::LinkEstablished { link, initiated } => {
                self.handle_link_established(link, initiated);
            }
            NodeCommand::DialFailed { uri, error } => {
                warn!("Dial to {} failed: {}", uri, error);
                for waiter in self.dial_waiters.remove(&uri).unwrap_or_default() {
                    let _ = waiter.send(ResponseStatus::ServiceUnavailable);
                }
            }
            NodeCommand::LinkDown { peer } => {
                info!("Link to {} is down", peer);
                let events = self.tunnels.link_down(&peer, "link lost");
                if let StorageBackend::Proxy { peer: proxy, .. } = &mut self.storage {
                    if *proxy == Some(peer) {
                        *proxy = None;
                    }
                }
                self.dispatch_events(events);
            }
            NodeCommand::LinkFrame { peer, frame } => {
                self.handle_frame(peer, frame);
            }
            NodeCommand::TunnelReply {
                peer,
                msg_id,
                status,
                body,
            } => {
                self.tunnels.reply(&peer, msg_id, status, body);
            }
            NodeCommand::Tick => self.handle_tick(),
        }
        true
    }

    // -- links and tunnels -----------------------------------------------

    fn spawn_dial(&mut self, addr: String) {
        let commands = self.commands_tx.clone();
        let node_id = self.node_id;
        let rt_uri = self.rt_uri();
        tokio::spawn(async move {
            if let Err(e) = open_outbound(&addr, node_id, rt_uri, commands.clone()).await {
                let _ = commands
                    .send(NodeCommand::DialFailed {
                        uri: addr,
                        error: e.to_string(),
                    })
                    .await;
            }
        });
    }

    fn handle_peer_setup(
        &mut self,
        uris: Vec<String>,
        response_tx: oneshot::Sender<ResponseStatus>,
    ) {
        let mut waits = Vec::new();
        for uri in uris {
            let addr = normalize_uri(&uri);
            let (tx, rx) = oneshot::channel();
            waits.push(rx);
            let already_linked = self
                .tunnels
                .peers()
                .iter()
                .any(|p| self.tunnels.link(p).is_some_and(|l| normalize_uri(&l.rt_uri) == addr));
            if already_linked {
                let _ = tx.send(ResponseStatus::Ok);
                continue;
            }
            let dialing = self.dial_waiters.contains_key(&addr);
            self.dial_waiters.entry(addr.clone()).or_default().push(tx);
            if !dialing {
                self.spawn_dial(addr);
            }
        }
        tokio::spawn(async move {
            let mut status = ResponseStatus::Ok;
            for wait in waits {
                match wait.await {
                    Ok(s) if s.is_ok() => {}
                    _ => status = ResponseStatus::ServiceUnavailable,
                }
            }
            let _ = response_tx.send(status);
        });
    }

    fn handle_link_established(&mut self, link: LinkHandle, initiated: bool) {
        info!("Link established with {} at {}", link.peer, link.rt_uri);
        let peer = link.peer;
        let addr = normalize_uri(&link.rt_uri);
        let events = self.tunnels.link_up(link);
        self.dispatch_events(events);

        for waiter in self.dial_waiters.remove(&addr).unwrap_or_default() {
            let _ = waiter.send(ResponseStatus::Ok);
        }

        let mut is_proxy_peer = false;
        if let StorageBackend::Proxy { uri, peer: proxy } = &mut self.storage {
            if *uri == addr {
                *proxy = Some(peer);
                is_proxy_peer = true;
            }
        }

        if initiated {
            if let Err(e) = self.tunnels.open_tunnel(peer, TunnelType::Proto) {
                warn!("Failed to open proto tunnel to {}: {}", peer, e);
            }
            if is_proxy_peer {
                if let Err(e) = self.tunnels.open_tunnel(peer, TunnelType::Registry) {
                    warn!("Failed to open registry tunnel to {}: {}", peer, e);
                }
            }
        }
    }

    fn dispatch_events(&mut self, events: Vec<TunnelEvent>) {
        for event in &events {
            if let TunnelEvent::Up {
                peer,
                tunnel_type: TunnelType::Registry,
            } = event
            {
                let is_proxy = matches!(
                    &self.storage,
                    StorageBackend::Proxy { peer: Some(p), .. } if p == peer
                );
                if is_proxy && !self.announced {
                    self.announce_node();
                }
            }
        }
        if events.is_empty() {
            return;
        }
        self.event_subs
            .retain(|tx| events.iter().all(|e| tx.send(e.clone()).is_ok()));
    }

    fn handle_frame(&mut self, peer: NodeId, frame: Frame) {
        match frame {
            Frame::Hello { node_id, .. } => {
                debug!("Unexpected hello from {} after handshake", node_id);
            }
            Frame::TunnelOpen {
                tunnel_id,
                tunnel_type,
            } => {
                let events = self.tunnels.handle_open(peer, tunnel_id, tunnel_type);
                self.dispatch_events(events);
            }
            Frame::TunnelOpenReply {
                tunnel_type,
                ok,
                reason,
            } => {
                let events = self.tunnels.handle_open_reply(peer, tunnel_type, ok, reason);
                self.dispatch_events(events);
            }
            Frame::TunnelClose { tunnel_type } => {
                let events = self.tunnels.handle_close(peer, tunnel_type);
                self.dispatch_events(events);
            }
            Frame::Request {
                tunnel_type,
                msg_id,
                payload,
            } => match payload {
                Payload::Registry(op) => {
                    let reply = self.store.apply(op);
                    self.tunnels
                        .reply(&peer, msg_id, ResponseStatus::Ok, ReplyBody::Registry(reply));
                }
                Payload::Proto(request) => {
                    if tunnel_type != TunnelType::Proto {
                        self.tunnels.reply(
                            &peer,
                            msg_id,
                            ResponseStatus::BadRequest,
                            ReplyBody::None,
                        );
                    } else {
                        self.handle_proto_request(peer, msg_id, request);
                    }
                }
            },
            Frame::Reply {
                msg_id,
                status,
                body,
            } => {
                self.tunnels.handle_reply(peer, msg_id, status, body);
            }
        }
    }

    fn handle_proto_request(&mut self, peer: NodeId, msg_id: u64, request: ProtoRequest) {
        debug!("Proto request from {}: {}", peer, request.to_log());
        match request {
            ProtoRequest::ActorNew {
                spec,
                app_id,
                replication_id,
            } => {
                let (status, body) = match self.create_local(&spec, app_id, replication_id) {
                    Ok(actor_id) => (
                        ResponseStatus::Created,
                        ReplyBody::Proto(ProtoReply::ActorCreated { actor_id }),
                    ),
                    Err(e) => (e.status(), ReplyBody::None),
                };
                self.tunnels.reply(&peer, msg_id, status, body);
            }
            ProtoRequest::ActorDestroy { actor_id } => {
                let status = match self.destroy_local(&actor_id) {
                    Ok(()) => ResponseStatus::Ok,
                    Err(e) => e.status(),
                };
                self.tunnels.reply(&peer, msg_id, status, ReplyBody::None);
            }
            ProtoRequest::ActorMigrateDirect {
                actor_id,
                dest_node_id,
            } => {
                // Answer the requester with the migration's final status.
                let (tx, rx) = oneshot::channel();
                let commands = self.commands_tx.clone();
                tokio::spawn(async move {
                    let status = rx.await.unwrap_or(ResponseStatus::InternalError);
                    let _ = commands
                        .send(NodeCommand::TunnelReply {
                            peer,
                            msg_id,
                            status,
                            body: ReplyBody::None,
                        })
                        .await;
                });
                if self.actors.contains(&actor_id) {
                    self.start_migration(actor_id, dest_node_id, tx);
                } else {
                    let _ = tx.send(ResponseStatus::NotFound);
                }
            }
            ProtoRequest::ActorTransfer { snapshot } => {
                let actor_id = snapshot.actor_id;
                let status = match self.accept_transfer(snapshot) {
                    Ok(()) => {
                        info!("Actor {} transferred in from {}", actor_id, peer);
                        ResponseStatus::Ok
                    }
                    Err(e) => {
                        warn!("Transfer of {} rejected: {}", actor_id, e);
                        e.status()
                    }
                };
                self.tunnels.reply(&peer, msg_id, status, ReplyBody::None);
            }
            ProtoRequest::PortConnect { target, origin } => {
                let result = self.accept_connect(&target, &origin);
                let (status, body) = match result {
                    Ok(port_id) => (
                        ResponseStatus::Ok,
                        ReplyBody::Proto(ProtoReply::PortConnected { port_id }),
                    ),
                    Err(e) => (e.status(), ReplyBody::None),
                };
                self.tunnels.reply(&peer, msg_id, status, body);
            }
            ProtoRequest::PortSetup { request } => {
                // Run the handshake as the owning node and relay the final
                // status to the requester.
                let (tx, rx) = oneshot::channel();
                let commands = self.commands_tx.clone();
                tokio::spawn(async move {
                    let status = match rx.await {
                        Ok((status, _)) => status,
                        Err(_) => ResponseStatus::InternalError,
                    };
                    let _ = commands
                        .send(NodeCommand::TunnelReply {
                            peer,
                            msg_id,
                            status,
                            body: ReplyBody::None,
                        })
                        .await;
                });
                self.handle_connect(request, tx);
            }
            ProtoRequest::PortDisconnect { port_id, peer: gone, mode } => {
                debug!("Peer disconnect ({:?}) on port {}", mode, port_id);
                let status = match self.ports.detach_peer(&port_id, &gone) {
                    Ok(()) => ResponseStatus::Ok,
                    Err(e) => e.status(),
                };
                self.tunnels.reply(&peer, msg_id, status, ReplyBody::None);
            }
            ProtoRequest::PortReplacePeer {
                port_id,
                match_peer,
                new_peer,
            } => {
                let status = match self.ports.replace_peer(&port_id, &match_peer, new_peer) {
                    Ok(()) => ResponseStatus::Ok,
                    Err(e) => e.status(),
                };
                self.tunnels.reply(&peer, msg_id, status, ReplyBody::None);
            }
        }
    }

    // -- actors ----------------------------------------------------------

    fn create_local(
        &mut self,
        spec: &ActorSpec,
        app_id: Option<AppId>,
        replication_id: Option<ReplicationId>,
    ) -> Result<ActorId> {
        spec.state.validate()?;
        let actor_id = self.actors.create(spec, HashMap::new(), app_id, replication_id);
        let ports = match self.ports.create_ports(actor_id, &spec.ports) {
            Ok(ports) => ports,
            Err(e) => {
                let _ = self.actors.remove(&actor_id);
                return Err(e);
            }
        };
        self.actors.get_mut(&actor_id)?.ports = ports;
        self.announce_actor(&actor_id);
        Ok(actor_id)
    }

    fn destroy_local(&mut self, actor_id: &ActorId) -> Result<()> {
        self.actors.remove(actor_id)?;
        for port in self.ports.remove_actor_ports(actor_id) {
            let back_ref = PeerRef {
                node_id: self.node_id,
                actor_id: *actor_id,
                port_id: port.id,
            };
            self.notify_peers(&back_ref, port.peers, DisconnectMode::Terminate);
        }
        self.storage_fire(RegistryOp::Delete {
            key: actor_key(actor_id),
        });
        Ok(())
    }

    fn accept_transfer(&mut self, snapshot: ActorSnapshot) -> Result<()> {
        snapshot.validate()?;
        if self.actors.contains(&snapshot.actor_id) {
            return Err(RuntimeError::BadRequest(format!(
                "actor {} already resident",
                snapshot.actor_id
            )));
        }
        let names = self.ports.restore_ports(snapshot.actor_id, &snapshot.ports);
        self.actors.restore(&snapshot, names)?;
        // Ports that kept peer references resume service here.
        for port in &snapshot.ports {
            if !port.peers.is_empty() {
                self.ports.mark(&port.id, ConnectionState::Connected)?;
            }
        }
        self.announce_actor(&snapshot.actor_id);
        Ok(())
    }

    // -- ports -----------------------------------------------------------

    fn resolve_selector(&self, selector: &PortSelector) -> Result<PortId> {
        self.ports.resolve(
            selector.actor_id.as_ref(),
            selector.port_name.as_deref(),
            selector.port_id.as_ref(),
            None,
        )
    }

    fn handle_connect(
        &mut self,
        request: ConnectRequest,
        response_tx: oneshot::Sender<(ResponseStatus, Option<PortId>)>,
    ) {
        let peer_node = request.peer_node_id.unwrap_or(self.node_id);
        if peer_node == self.node_id {
            let result = self.connect_local(&request);
            let _ = response_tx.send(match result {
                Ok(port_id) => (ResponseStatus::Ok, Some(port_id)),
                Err(e) => (e.status(), None),
            });
            return;
        }

        let local = self.ports.resolve(
            Some(&request.actor_id),
            Some(&request.port_name),
            None,
            Some(request.port_dir),
        );
        let local_pid = match local {
            Ok(pid) => pid,
            Err(e) => {
                let _ = response_tx.send((e.status(), None));
                return;
            }
        };
        if !self.tunnels.is_usable(&peer_node, TunnelType::Proto) {
            let _ = response_tx.send((ResponseStatus::ServiceUnavailable, None));
            return;
        }
        let properties = match self.ports.get(&local_pid) {
            Ok(port) => {
                // Refuse before touching the peer when the local port is
                // already at its peer limit.
                if !port.accepts_peer() {
                    let _ = response_tx.send((ResponseStatus::Conflict, None));
                    return;
                }
                port.properties.clone()
            }
            Err(e) => {
                let _ = response_tx.send((e.status(), None));
                return;
            }
        };
        let origin = PortOrigin {
            peer: PeerRef {
                node_id: self.node_id,
                actor_id: request.actor_id,
                port_id: local_pid,
            },
            direction: request.port_dir,
            properties,
        };
        let local_ref = origin.peer;
        let rx = self.tunnels.request(
            peer_node,
            TunnelType::Proto,
            Payload::Proto(ProtoRequest::PortConnect {
                target: PortTarget {
                    actor_id: request.peer_actor_id,
                    port_name: Some(request.peer_port_name.clone()),
                    port_id: None,
                },
                origin,
            }),
        );
        let commands = self.commands_tx.clone();
        let peer_actor = request.peer_actor_id;
        tokio::spawn(async move {
            let (status, peer) = match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT, rx).await {
                Ok(Ok((status, ReplyBody::Proto(ProtoReply::PortConnected { port_id }))))
                    if status.is_ok() =>
                {
                    (
                        status,
                        Some(PeerRef {
                            node_id: peer_node,
                            actor_id: peer_actor,
                            port_id,
                        }),
                    )
                }
                Ok(Ok((status, _))) => (status, None),
                _ => (ResponseStatus::ServiceUnavailable, None),
            };
            let _ = commands
                .send(NodeCommand::FinishConnect {
                    origin: local_ref,
                    status,
                    peer,
                    response_tx,
                })
                .await;
        });
    }

    fn connect_local(&mut self, request: &ConnectRequest) -> Result<PortId> {
        let a = self.ports.resolve(
            Some(&request.actor_id),
            Some(&request.port_name),
            None,
            Some(request.port_dir),
        )?;
        let b = self.ports.resolve(
            Some(&request.peer_actor_id),
            Some(&request.peer_port_name),
            None,
            Some(request.port_dir.complement()),
        )?;
        self.ports.connect_local(&a, &b)?;
        Ok(a)
    }

    /// Side of a connect handshake that receives the request.
    fn accept_connect(&mut self, target: &PortTarget, origin: &PortOrigin) -> Result<PortId> {
        let pid = self.ports.resolve(
            Some(&target.actor_id),
            target.port_name.as_deref(),
            target.port_id.as_ref(),
            Some(origin.direction.complement()),
        )?;
        self.ports.validate_attach(&pid, origin.direction, &origin.peer)?;
        self.ports.attach_peer(&pid, origin.peer)?;
        Ok(pid)
    }

    /// Undo the remote half of a connect whose local attach failed: the
    /// peer drops the reference it just added, or a reconcile record is
    /// left when the peer cannot be reached.
    fn undo_remote_attach(&mut self, origin: PeerRef, peer: PeerRef) {
        if self.tunnels.is_usable(&peer.node_id, TunnelType::Proto) {
            self.notify_peers(&origin, vec![peer], DisconnectMode::Terminate);
        } else {
            self.storage_fire(RegistryOp::Set {
                key: reconcile_key(&origin.actor_id),
                value: json!({
                    "actor_id": origin.actor_id,
                    "phase": "connect",
                    "dangling": peer,
                }),
            });
        }
    }

    fn disconnect_ports(&mut self, selector: &PortSelector, mode: DisconnectMode) -> Result<()> {
        let pid = self.resolve_selector(selector)?;
        let actor_id = self.ports.get(&pid)?.actor_id;
        let notify = self.ports.disconnect(&pid, mode)?;
        let back_ref = PeerRef {
            node_id: self.node_id,
            actor_id,
            port_id: pid,
        };
        self.notify_peers(&back_ref, notify, mode);
        Ok(())
    }

    /// Tell each former peer to drop its reference back to `back_ref`.
    fn notify_peers(&mut self, back_ref: &PeerRef, peers: Vec<PeerRef>, mode: DisconnectMode) {
        for peer in peers {
            if peer.node_id == self.node_id {
                if let Err(e) = self.ports.detach_peer(&peer.port_id, back_ref) {
                    debug!("Peer port already gone: {}", e);
                }
            } else {
                let rx = self.tunnels.request(
                    peer.node_id,
                    TunnelType::Proto,
                    Payload::Proto(ProtoRequest::PortDisconnect {
                        port_id: peer.port_id,
                        peer: *back_ref,
                        mode,
                    }),
                );
                let peer_node = peer.node_id;
                tokio::spawn(async move {
                    match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT, rx).await {
                        Ok(Ok((status, _))) if status.is_ok() => {}
                        _ => warn!("Disconnect notification to {} not confirmed", peer_node),
                    }
                });
            }
        }
    }

    // -- migration -------------------------------------------------------

    fn start_migration(
        &mut self,
        actor_id: ActorId,
        dest_node_id: NodeId,
        response_tx: oneshot::Sender<ResponseStatus>,
    ) {
        if dest_node_id == self.node_id {
            let _ = response_tx.send(ResponseStatus::Ok);
            return;
        }
        if !self.tunnels.is_usable(&dest_node_id, TunnelType::Proto) {
            let _ = response_tx.send(ResponseStatus::ServiceUnavailable);
            return;
        }
        if let Err(e) = self.actors.begin_migration(&actor_id) {
            let _ = response_tx.send(e.status());
            return;
        }

        // TEMPORARY-disconnect every port; peers keep their references so
        // the destination can resume them after rewiring.
        let mut saved = Vec::new();
        for pid in self.ports.ports_of(&actor_id) {
            if let Ok(port) = self.ports.get(&pid) {
                saved.push((pid, port.state));
            }
            if let Err(e) = self.ports.disconnect(&pid, DisconnectMode::Temporary) {
                debug!("Port {} disconnect during migration: {}", pid, e);
            }
        }
        self.migration_saved.insert(actor_id, saved);

        let snapshot = match self.actors.snapshot(&actor_id, &self.ports) {
            Ok(s) => s,
            Err(e) => {
                self.rollback_migration(&actor_id);
                let _ = response_tx.send(e.status());
                return;
            }
        };
        info!("Migrating actor {} to {}", actor_id, dest_node_id);
        let rx = self.tunnels.request(
            dest_node_id,
            TunnelType::Proto,
            Payload::Proto(ProtoRequest::ActorTransfer { snapshot }),
        );
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let transfer_status = match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT, rx).await {
                Ok(Ok((status, _))) => status,
                _ => ResponseStatus::ServiceUnavailable,
            };
            let _ = commands
                .send(NodeCommand::FinishMigration {
                    actor_id,
                    dest_node_id,
                    transfer_status,
                    response_tx,
                })
                .await;
        });
    }

    fn rollback_migration(&mut self, actor_id: &ActorId) {
        for (pid, state) in self.migration_saved.remove(actor_id).unwrap_or_default() {
            if let Err(e) = self.ports.mark(&pid, state) {
                debug!("Port {} state rollback: {}", pid, e);
            }
        }
        self.actors.abort_migration(actor_id);
    }

    fn finish_migration(
        &mut self,
        actor_id: ActorId,
        dest_node_id: NodeId,
        transfer_status: ResponseStatus,
        response_tx: oneshot::Sender<ResponseStatus>,
    ) {
        if !transfer_status.is_ok() {
            warn!(
                "Transfer of {} to {} failed ({}), rolling back",
                actor_id, dest_node_id, transfer_status
            );
            self.rollback_migration(&actor_id);
            if transfer_status == ResponseStatus::ServiceUnavailable {
                // The transfer may have landed; leave a marker for repair.
                self.storage_fire(RegistryOp::Set {
                    key: reconcile_key(&actor_id),
                    value: json!({
                        "actor_id": actor_id,
                        "phase": "transfer",
                        "destination": dest_node_id,
                    }),
                });
            }
            let _ = response_tx.send(transfer_status);
            return;
        }

        // Rewire every peer from (this node, port) to (destination, port).
        let mut failed: Vec<PeerRef> = Vec::new();
        let mut remote: Vec<(PeerRef, crate::tunnel::RequestReceiver)> = Vec::new();
        for pid in self.ports.ports_of(&actor_id) {
            let peers = match self.ports.get(&pid) {
                Ok(port) => port.peers.clone(),
                Err(_) => continue,
            };
            let old_ref = PeerRef {
                node_id: self.node_id,
                actor_id,
                port_id: pid,
            };
            let new_ref = PeerRef {
                node_id: dest_node_id,
                actor_id,
                port_id: pid,
            };
            for peer in peers {
                if peer.node_id == self.node_id {
                    if let Err(e) = self.ports.replace_peer(&peer.port_id, &old_ref, new_ref) {
                        warn!("Local rewire of port {} failed: {}", peer.port_id, e);
                        failed.push(peer);
                    }
                } else if self.tunnels.is_usable(&peer.node_id, TunnelType::Proto) {
                    let rx = self.tunnels.request(
                        peer.node_id,
                        TunnelType::Proto,
                        Payload::Proto(ProtoRequest::PortReplacePeer {
                            port_id: peer.port_id,
                            match_peer: old_ref,
                            new_peer: new_ref,
                        }),
                    );
                    remote.push((peer, rx));
                } else {
                    failed.push(peer);
                }
            }
        }

        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            for (peer, rx) in remote {
                match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT, rx).await {
                    Ok(Ok((status, _))) if status.is_ok() => {}
                    _ => failed.push(peer),
                }
            }
            let _ = commands
                .send(NodeCommand::CompleteMigration {
                    actor_id,
                    dest_node_id,
                    failed_rewires: failed,
                    response_tx,
                })
                .await;
        });
    }

    fn complete_migration(
        &mut self,
        actor_id: ActorId,
        dest_node_id: NodeId,
        failed_rewires: Vec<PeerRef>,
    ) {
        self.migration_saved.remove(&actor_id);
        self.actors.complete_migration(&actor_id);
        self.ports.remove_actor_ports(&actor_id);
        if failed_rewires.is_empty() {
            info!("Migration of {} to {} complete", actor_id, dest_node_id);
        } else {
            // The move itself is confirmed; unrewired peers are recorded
            // for out-of-band repair instead of failing the migration.
            warn!(
                "Migration of {} complete with {} unrewired peers",
                actor_id,
                failed_rewires.len()
            );
            self.storage_fire(RegistryOp::Set {
                key: reconcile_key(&actor_id),
                value: json!({
                    "actor_id": actor_id,
                    "phase": "rewire",
                    "destination": dest_node_id,
                    "unrewired": failed_rewires,
                }),
            });
        }
    }

    fn forward_migration(
        &mut self,
        actor_id: ActorId,
        dest_node_id: NodeId,
        response_tx: oneshot::Sender<ResponseStatus>,
    ) {
        let rx = self.storage_request(RegistryOp::Get {
            key: actor_key(&actor_id),
        });
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let owner = match rx.await {
                Ok((status, reply)) if status.is_ok() => reply
                    .into_value()
                    .and_then(|v| v.get("node_id").cloned())
                    .and_then(|v| serde_json::from_value::<NodeId>(v).ok()),
                _ => None,
            };
            match owner {
                Some(owner) => {
                    let _ = commands
                        .send(NodeCommand::ForwardMigrate {
                            owner,
                            actor_id,
                            dest_node_id,
                            response_tx,
                        })
                        .await;
                }
                None => {
                    let _ = response_tx.send(ResponseStatus::NotFound);
                }
            }
        });
    }

    // -- replication -----------------------------------------------------

    fn handle_replicate(
        &mut self,
        replication_id: ReplicationId,
        peer_node_id: Option<NodeId>,
        dereplicate: bool,
        response_tx: oneshot::Sender<ResponseStatus>,
    ) {
        let gate = self
            .replication
            .request_replicate(&replication_id, peer_node_id, !dereplicate);
        if !gate.is_ok() {
            let _ = response_tx.send(gate);
            return;
        }
        if dereplicate {
            self.scale_in(replication_id, response_tx);
        } else {
            self.scale_out(replication_id, peer_node_id, response_tx);
        }
    }

    fn replication_failed(
        &mut self,
        replication_id: ReplicationId,
        status: ResponseStatus,
        response_tx: oneshot::Sender<ResponseStatus>,
    ) {
        self.replication.finish(&replication_id);
        let _ = response_tx.send(status);
    }

    fn scale_out(
        &mut self,
        replication_id: ReplicationId,
        peer_node_id: Option<NodeId>,
        response_tx: oneshot::Sender<ResponseStatus>,
    ) {
        let master = match self.replication.get(&replication_id) {
            Ok(group) => group.master,
            Err(e) => return self.replication_failed(replication_id, e.status(), response_tx),
        };
        let spec = match self.replica_spec(&master, &replication_id) {
            Ok(spec) => spec,
            Err(e) => return self.replication_failed(replication_id, e.status(), response_tx),
        };
        let app_id = self.actors.get(&master).ok().and_then(|a| a.app_id);

        // Prefer the requested node, otherwise any peer with a live proto
        // tunnel, otherwise replicate in place.
        let target = peer_node_id
            .or_else(|| {
                self.tunnels
                    .peers()
                    .into_iter()
                    .find(|p| self.tunnels.is_usable(p, TunnelType::Proto))
            })
            .unwrap_or(self.node_id);

        if target == self.node_id {
            let done = match self.create_local(&spec, app_id, Some(replication_id)) {
                Ok(actor_id) => (ResponseStatus::Ok, Some((self.node_id, actor_id))),
                Err(e) => (e.status(), None),
            };
            self.replication.finish(&replication_id);
            if let Some((_, actor)) = done.1 {
                self.replication.record_replica(&replication_id, actor);
            }
            let _ = response_tx.send(done.0);
            return;
        }

        if !self.tunnels.is_usable(&target, TunnelType::Proto) {
            return self.replication_failed(
                replication_id,
                ResponseStatus::ServiceUnavailable,
                response_tx,
            );
        }
        let rx = self.tunnels.request(
            target,
            TunnelType::Proto,
            Payload::Proto(ProtoRequest::ActorNew {
                spec,
                app_id,
                replication_id: Some(replication_id),
            }),
        );
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let (status, new_replica) = match tokio::time::timeout(PROTOCOL_STEP_TIMEOUT, rx).await
            {
                Ok(Ok((status, ReplyBody::Proto(ProtoReply::ActorCreated { actor_id }))))
                    if status.is_ok() =>
                {
                    (ResponseStatus::Ok, Some((target, actor_id)))
                }
                Ok(Ok((status, _))) => (status, None),
                _ => (ResponseStatus::ServiceUnavailable, None),
            };
            let _ = commands
                .send(NodeCommand::ReplicationDone {
                    replication_id,
                    status,
                    new_replica,
                    dropped_replica: None,
                    response_tx: Some(response_tx),
                })
                .await;
        });
    }

    fn scale_in(
        &mut self,
        replication_id: ReplicationId,
        response_tx: oneshot::Sender<ResponseStatus>,
    ) {
        let Some(replica) = self.replication.newest_replica(&replication_id) else {
            return self.replication_failed(replication_id, ResponseStatus::NotFound, response_tx);
        };
        if self.actors.contains(&replica) {
            let status = match self.destroy_local(&replica) {
                Ok(()) => ResponseStatus::Ok,
                Err(e) => e.status(),
            };
            self.replication.finish(&replication_id);
            if status.is_ok() {
                self.replication.drop_replica(&replication_id, &replica);
            }
            let _ = response_tx.send(status);
            return;
        }
        // Remote replica: resolve its residence through the registry, then
        // destroy it there.
        let rx = self.storage_request(RegistryOp::Get {
            key: actor_key(&replica),
        });
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let owner = match rx.await {
                Ok((status, reply)) if status.is_ok() => reply
                    .into_value()
                    .and_then(|v| v.get("node_id").cloned())
                    .and_then(|v| serde_json::from_value::<NodeId>(v).ok()),
                _ => None,
            };
            let status = match owner {
                Some(owner) => {
                    let (tx, rx) = oneshot::channel();
                    let sent = commands
                        .send(NodeCommand::RemoteActorDestroy {
                            node_id: owner,
                            actor_id: replica,
                            response_tx: tx,
                        })
                        .await;
                    if sent.is_ok() {
                        rx.await.unwrap_or(ResponseStatus::InternalError)
                    } else {
                        ResponseStatus::InternalError
                    }
                }
                None => ResponseStatus::NotFound,
            };
            let _ = commands
                .send(NodeCommand::ReplicationDone {
                    replication_id,
                    status,
                    new_replica: None,
                    dropped_replica: status.is_ok().then_some(replica),
                    response_tx: Some(response_tx),
                })
                .await;
        });
    }

    /// Spec for a new replica, seeded from the master's current state.
    fn replica_spec(&self, master: &ActorId, replication_id: &ReplicationId) -> Result<ActorSpec> {
        let actor = self.actors.get(master)?;
        let ports: Vec<PortSpec> = self
            .ports
            .ports_of(master)
            .iter()
            .filter_map(|pid| self.ports.get(pid).ok())
            .map(|port| PortSpec {
                name: port.name.clone(),
                direction: port.direction,
                properties: port.properties.clone(),
            })
            .collect();
        let group = self.replication.get(replication_id)?;
        Ok(ActorSpec {
            actor_type: actor.actor_type.clone(),
            name: format!("{}-replica-{}", actor.name, group.replicas.len() + 1),
            state: actor.state.clone(),
            ports,
        })
    }

    // -- storage ---------------------------------------------------------

    /// Uniform registry access: local operations resolve immediately,
    /// proxied ones when the reply comes back. The receiver always
    /// resolves.
    fn storage_request(
        &mut self,
        op: RegistryOp,
    ) -> oneshot::Receiver<(ResponseStatus, RegistryReply)> {
        let (tx, rx) = oneshot::channel();
        match &self.storage {
            StorageBackend::Local => {
                let reply = self.store.apply(op);
                let _ = tx.send((ResponseStatus::Ok, reply));
            }
            StorageBackend::Proxy { peer: Some(peer), .. } => {
                let inner =
                    self.tunnels
                        .request(*peer, TunnelType::Registry, Payload::Registry(op));
                tokio::spawn(async move {
                    let outcome = match inner.await {
                        Ok((status, ReplyBody::Registry(reply))) => (status, reply),
                        Ok((status, _)) => (status, RegistryReply::Done),
                        Err(_) => (ResponseStatus::ServiceUnavailable, RegistryReply::Done),
                    };
                    let _ = tx.send(outcome);
                });
            }
            StorageBackend::Proxy { peer: None, .. } => {
                let _ = tx.send((ResponseStatus::ServiceUnavailable, RegistryReply::Done));
            }
        }
        rx
    }

    /// Fire a registry write without waiting for the outcome.
    fn storage_fire(&mut self, op: RegistryOp) {
        let description = op.to_log();
        let rx = self.storage_request(op);
        tokio::spawn(async move {
            match rx.await {
                Ok((status, _)) if status.is_ok() => {}
                Ok((status, _)) => debug!("Registry write '{}' answered {}", description, status),
                Err(_) => debug!("Registry write '{}' got no answer", description),
            }
        });
    }

    fn announce_node(&mut self) {
        let record = json!({
            "uri": self.rt_uri(),
            "control_uri": self.config.control_addr,
            "attributes": self.attributes,
        });
        self.storage_fire(RegistryOp::Set {
            key: node_key(&self.node_id),
            value: record,
        });
        self.storage_fire(RegistryOp::AddIndex {
            index: node_index(),
            value: self.node_id.to_string(),
        });
        for (name, value) in self.attributes.clone() {
            self.storage_fire(RegistryOp::AddIndex {
                index: attribute_index(&name, &value),
                value: self.node_id.to_string(),
            });
        }
        self.announced = true;
        info!("Node {} announced to registry", self.node_id);
    }

    fn retract_node(&mut self) {
        if !self.announced {
            return;
        }
        self.storage_fire(RegistryOp::Delete {
            key: node_key(&self.node_id),
        });
        self.storage_fire(RegistryOp::RemoveIndex {
            index: node_index(),
            value: self.node_id.to_string(),
        });
        for (name, value) in self.attributes.clone() {
            self.storage_fire(RegistryOp::RemoveIndex {
                index: attribute_index(&name, &value),
                value: self.node_id.to_string(),
            });
        }
        self.announced = false;
    }

    fn announce_actor(&mut self, actor_id: &ActorId) {
        let Ok(actor) = self.actors.get(actor_id) else {
            return;
        };
        let record = json!({
            "node_id": self.node_id,
            "type": actor.actor_type,
            "name": actor.name,
        });
        self.storage_fire(RegistryOp::Set {
            key: actor_key(actor_id),
            value: record,
        });
    }

    // -- scheduling ------------------------------------------------------

    fn handle_tick(&mut self) {
        // Execution turns are a rotation only; the turn body belongs to
        // the execution engine.
        let enabled = self.actors.enabled();
        if let Some(actor_id) = self.scheduler.next_turn(&enabled) {
            tracing::trace!("Execution turn for {}", actor_id);
        }
        for pid in self.ports.exhaust_ready() {
            let actor_id = match self.ports.get(&pid) {
                Ok(port) => port.actor_id,
                Err(_) => continue,
            };
            match self.ports.drain_complete(&pid) {
                Ok(notify) => {
                    let back_ref = PeerRef {
                        node_id: self.node_id,
                        actor_id,
                        port_id: pid,
                    };
                    self.notify_peers(&back_ref, notify, DisconnectMode::Terminate);
                }
                Err(e) => debug!("Exhaust finalization of {}: {}", pid, e),
            }
        }
    }
}

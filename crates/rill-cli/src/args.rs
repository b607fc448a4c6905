use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use rill::{ActorId, AppId, NodeId, ReplicationId};

/// Rill CLI - manage a distributed dataflow actor runtime
#[derive(Debug, Parser)]
#[command(name = "rill")]
#[command(author, version, about)]
pub struct Cli {
    /// Address of the control server for client commands
    #[arg(short, long, global = true, default_value = "127.0.0.1:9280")]
    pub address: SocketAddr,

    /// Logging level (e.g. 'info', 'debug')
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a node and serve its control protocol
    Serve(ServeArgs),

    /// Show the node's identity and attributes
    NodeInfo,

    /// List peer nodes with a live runtime link
    ListNodes,

    /// Connect to peer nodes by runtime URI (rill://host:port)
    PeerSetup {
        uris: Vec<String>,
    },

    /// Create an actor from a spec file (JSON or TOML)
    NewActor {
        spec: PathBuf,
    },

    /// Destroy an actor and disconnect its ports
    DestroyActor {
        actor_id: ActorId,
    },

    /// List actors on the node
    ListActors,

    /// Show an actor's full report: lifecycle, state, ports
    Report {
        actor_id: ActorId,
    },

    /// Enable an actor for scheduling
    Enable {
        actor_id: ActorId,
    },

    /// Disable an actor, pausing its scheduling
    Disable {
        actor_id: ActorId,
    },

    /// Migrate an actor to another node
    Migrate {
        actor_id: ActorId,
        dest_node_id: NodeId,
    },

    /// Connect two actor ports
    Connect(ConnectArgs),

    /// Disconnect ports matching a selector
    Disconnect(DisconnectArgs),

    /// Show the connection state of a port
    PortState {
        actor_id: ActorId,
        port_name: String,
    },

    /// Set a queue property on a port (value is JSON)
    SetPort {
        actor_id: ActorId,
        port_name: String,
        property: String,
        value: String,
    },

    /// Deploy an application from a descriptor file (JSON or TOML)
    Deploy {
        file: PathBuf,
    },

    /// Destroy a deployed application and all its actors
    DestroyApp {
        app_id: AppId,
    },

    /// List deployed applications
    ListApps,

    /// Show a deployed application's actors
    GetApp {
        app_id: AppId,
    },

    /// Register an actor as master of a replication group
    RegisterReplication {
        replication_id: ReplicationId,
        master: ActorId,
    },

    /// Add or remove a replica of a replication group
    Replicate {
        replication_id: ReplicationId,

        /// Preferred node for the new replica
        #[arg(long)]
        peer: Option<NodeId>,

        /// Remove the newest replica instead of adding one
        #[arg(long)]
        dereplicate: bool,
    },

    /// Run a registry operation against the node's storage
    #[command(subcommand)]
    Storage(StorageCommands),

    /// Stream tunnel up/down events until interrupted
    Events,

    /// Shut the node down
    Shutdown,
}

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Path to a node configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct ConnectArgs {
    /// Actor owning the initiating port
    pub actor_id: ActorId,

    /// Name of the initiating port
    pub port_name: String,

    /// Direction of the initiating port: in or out
    #[arg(long, default_value = "in")]
    pub dir: String,

    /// Peer actor to connect to
    pub peer_actor_id: ActorId,

    /// Name of the peer port
    pub peer_port_name: String,

    /// Node hosting the peer actor, if not local
    #[arg(long)]
    pub peer_node: Option<NodeId>,
}

#[derive(Debug, Parser)]
pub struct DisconnectArgs {
    /// Actor whose ports to disconnect
    #[arg(long)]
    pub actor: Option<ActorId>,

    /// Restrict to a single named port
    #[arg(long)]
    pub port: Option<String>,

    /// Disconnect mode: temporary, terminate, or exhaust
    #[arg(long, default_value = "terminate")]
    pub mode: String,
}

#[derive(Debug, Subcommand)]
pub enum StorageCommands {
    /// Read a key
    Get { key: String },
    /// Write a key (value is JSON)
    Set { key: String, value: String },
    /// Delete a key
    Delete { key: String },
    /// List the members of an index
    Index { levels: Vec<String> },
}

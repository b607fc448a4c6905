//! # Rill Dataflow Runtime
//!
//! Rill is a runtime for distributed dataflow applications: actors with
//! typed ports, connected across a mesh of peer nodes, with live migration
//! and leader-gated replication.
//!
//! ## Core Features
//!
//! * **Actor Management**: Create, enable, disable, and destroy actors
//! * **Port Graph**: Directional ports wired locally or across nodes, with
//!   TEMPORARY / TERMINATE / EXHAUST disconnect semantics
//! * **Registry**: Key-value records and indexed sets, held locally or
//!   proxied through a peer node
//! * **Migration**: Snapshot-based actor transfer with peer rewiring and
//!   rollback
//! * **Replication**: Single-flight scale-out / scale-in of actor groups
//!
//! ## Architecture
//!
//! One task per node owns all mutable state and consumes [`messages::NodeCommand`]
//! messages. Cross-node protocols run as spawned driver tasks that hold
//! reply continuations and re-enter the loop with their outcomes.
//!
//! * [`node::Node`]: the runtime loop
//! * [`node::NodeHandle`]: cloneable async interface to the loop
//! * [`tunnel::TunnelManager`]: peer links and typed request tunnels
//! * [`app::Deployer`]: requirement-based application deployment

pub mod actor;
pub mod app;
pub mod config;
pub mod errors;
pub mod id;
pub mod logging;
pub mod messages;
pub mod node;
pub mod port;
pub mod proto;
pub mod registry;
pub mod replication;
pub mod scheduler;
pub mod shutdown;
pub mod tunnel;

pub use actor::{ActorManager, ActorSnapshot, ActorSpec, ManagedState};
pub use app::{DeployRequest, DeployResult, Deployer};
pub use config::NodeConfig;
pub use errors::{ResponseStatus, RuntimeError};
pub use id::{ActorId, AppId, NodeId, PortId, ReplicationId};
pub use node::{Node, NodeHandle, NodeInfo};
pub use port::{DisconnectMode, PortDirection, PortSpec};
pub use registry::StorageMode;
pub use tunnel::TunnelEvent;

pub type Result<T> = std::result::Result<T, errors::RuntimeError>;

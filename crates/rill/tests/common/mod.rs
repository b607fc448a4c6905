#![allow(dead_code)]

use std::collections::BTreeMap;

use tokio::task::JoinHandle;

use rill::actor::ActorSpec;
use rill::node::{Node, NodeHandle};
use rill::port::{PortDirection, PortProperties, PortSpec};
use rill::replication::LeaderElector;
use rill::shutdown::ShutdownController;
use rill::{ActorId, ManagedState, NodeConfig, NodeId, StorageMode};

/// A node running inside the test process, reachable through its handle.
pub struct TestNode {
    pub handle: NodeHandle,
    pub node_id: NodeId,
    pub rt_uri: String,
    shutdown: ShutdownController,
    runner: JoinHandle<()>,
}

impl TestNode {
    pub async fn spawn(name: &str, rt_port: u16) -> Self {
        Self::spawn_with(name, rt_port, StorageMode::Local, BTreeMap::new()).await
    }

    pub async fn spawn_with(
        name: &str,
        rt_port: u16,
        storage: StorageMode,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        let config = node_config(name, rt_port, storage, attributes);
        let rt_uri = config.rt_uri();
        let (node, handle) = Node::new(config);
        Self::launch(node, handle, rt_uri).await
    }

    /// Spawn with a leadership predicate other than the always-leader
    /// default.
    pub async fn spawn_with_elector(
        name: &str,
        rt_port: u16,
        elector: Box<dyn LeaderElector>,
    ) -> Self {
        let config = node_config(name, rt_port, StorageMode::Local, BTreeMap::new());
        let rt_uri = config.rt_uri();
        let (node, handle) = Node::with_elector(config, elector);
        Self::launch(node, handle, rt_uri).await
    }

    async fn launch(node: Node, handle: NodeHandle, rt_uri: String) -> Self {
        let mut shutdown = ShutdownController::new();
        let receiver = shutdown.subscribe();
        let runner = tokio::spawn(async move {
            node.run(receiver).await.expect("node terminated with error");
        });

        // The runtime listener binds inside run(); wait until the loop
        // answers before handing the node to the test.
        let node_id = handle.node_info().await.expect("node_info").node_id;

        Self {
            handle,
            node_id,
            rt_uri,
            shutdown,
            runner,
        }
    }

    /// Dial `other` and wait for the link to come up.
    pub async fn link_to(&self, other: &TestNode) {
        let status = self
            .handle
            .peer_setup(vec![other.rt_uri.clone()])
            .await
            .expect("peer_setup");
        assert!(status.is_ok(), "peer_setup answered {}", status);
    }

    pub async fn stop(self) {
        self.shutdown.signal_shutdown().await;
        let _ = self.runner.await;
    }
}

fn node_config(
    name: &str,
    rt_port: u16,
    storage: StorageMode,
    attributes: BTreeMap<String, String>,
) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        control_addr: format!("127.0.0.1:{}", rt_port + 1000),
        rt_addr: format!("127.0.0.1:{}", rt_port),
        peers: Vec::new(),
        attributes,
        storage,
    }
}

pub fn port(name: &str, direction: PortDirection) -> PortSpec {
    PortSpec {
        name: name.into(),
        direction,
        properties: PortProperties::default(),
    }
}

pub fn actor_spec(name: &str, ports: Vec<PortSpec>) -> ActorSpec {
    ActorSpec {
        actor_type: "std.Test".to_string(),
        name: name.to_string(),
        state: ManagedState::new(),
        ports,
    }
}

/// Registry writes are fire-and-forget; tests observing them poll with
/// this macro until the condition holds or two seconds pass.
#[macro_export]
macro_rules! eventually {
    ($check:expr, $what:expr) => {{
        let mut held = false;
        for _ in 0..40 {
            if $check {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(held, "timed out waiting for: {}", $what);
    }};
}

/// Convenience for asserting an actor list on some node.
pub async fn actors_of(node: &TestNode) -> Vec<ActorId> {
    node.handle.list_actors().await.expect("list_actors")
}

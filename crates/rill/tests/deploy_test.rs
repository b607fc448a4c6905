//! End-to-end application deployment: requirement-based placement,
//! cross-node wiring, and teardown.

mod common;

use common::{actors_of, port, TestNode};

use std::collections::BTreeMap;

use serde_json::json;

use rill::app::{
    ConnectionSpec, DeployActorSpec, DeployRequest, Requirement, RequirementArgs, RequirementRule,
    REQ_OP_NODE_ATTR_MATCH,
};
use rill::port::PortDirection;
use rill::{Deployer, StorageMode};

fn attr_requirement(attribute: &str, value: &str, rule: RequirementRule) -> Requirement {
    Requirement {
        op: REQ_OP_NODE_ATTR_MATCH.to_string(),
        kwargs: RequirementArgs {
            attribute: attribute.to_string(),
            value: value.to_string(),
        },
        rule,
    }
}

fn zone_attrs(zone: &str) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    attrs.insert("zone".to_string(), zone.to_string());
    attrs
}

/// Spawn a registry holder in zone `core` and a proxy node in zone `edge`,
/// waiting until both appear in the registry.
async fn spawn_pair(base_port: u16) -> (TestNode, TestNode) {
    let a = TestNode::spawn_with(
        "core-node",
        base_port,
        StorageMode::Local,
        zone_attrs("core"),
    )
    .await;
    let b = TestNode::spawn_with(
        "edge-node",
        base_port + 1,
        StorageMode::Proxy {
            uri: a.rt_uri.clone(),
        },
        zone_attrs("edge"),
    )
    .await;
    eventually!(
        a.handle.list_nodes().await.expect("list_nodes").len() == 2,
        "both nodes in the registry"
    );
    (a, b)
}

fn pipeline_request(src_zone: &str, snk_zone: &str) -> DeployRequest {
    let mut actors = BTreeMap::new();
    actors.insert(
        "src".to_string(),
        DeployActorSpec {
            actor_type: "std.Source".to_string(),
            args: json!({"rate": 5}),
            ports: vec![port("out", PortDirection::Out)],
        },
    );
    actors.insert(
        "snk".to_string(),
        DeployActorSpec {
            actor_type: "std.Sink".to_string(),
            args: json!(null),
            ports: vec![port("in", PortDirection::In)],
        },
    );
    let mut requirements = BTreeMap::new();
    requirements.insert(
        "src".to_string(),
        vec![attr_requirement("zone", src_zone, RequirementRule::Intersect)],
    );
    requirements.insert(
        "snk".to_string(),
        vec![attr_requirement("zone", snk_zone, RequirementRule::Intersect)],
    );
    DeployRequest {
        name: "pipeline".to_string(),
        actors,
        connections: vec![ConnectionSpec {
            src: "src.out".to_string(),
            dst: "snk.in".to_string(),
        }],
        requirements,
    }
}

#[test_log::test(tokio::test)]
async fn deploy_places_actors_by_attribute_and_wires_them() {
    let (a, b) = spawn_pair(18510).await;
    let deployer = Deployer::new(a.handle.clone());

    let result = deployer
        .deploy(pipeline_request("core", "edge"))
        .await
        .expect("deploy");

    assert!(result.requirements_fulfilled);
    assert_eq!(result.placement["src"], a.node_id);
    assert_eq!(result.placement["snk"], b.node_id);

    let src = result.actor_map["src"];
    let snk = result.actor_map["snk"];
    assert_eq!(actors_of(&a).await, vec![src]);
    assert_eq!(actors_of(&b).await, vec![snk]);

    // The connection crosses nodes: src's out port references snk on b.
    let report = a.handle.actor_report(src).await.expect("report");
    assert_eq!(report["state"]["rate"], json!(5));
    let out_port = &report["ports"][0];
    assert_eq!(out_port["state"], "Connected");
    assert_eq!(out_port["peers"][0]["node_id"], json!(b.node_id));
    assert_eq!(out_port["peers"][0]["actor_id"], json!(snk));

    let apps = a.handle.list_applications().await.expect("list_applications");
    assert_eq!(apps, vec![result.app_id]);

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn deploy_wires_connections_whose_source_is_remote() {
    let (a, b) = spawn_pair(18520).await;
    let deployer = Deployer::new(a.handle.clone());

    // Both ends land on the peer; the wiring handshake must be issued by
    // the node that owns the source port.
    let result = deployer
        .deploy(pipeline_request("edge", "edge"))
        .await
        .expect("deploy");

    assert_eq!(result.placement["src"], b.node_id);
    assert_eq!(result.placement["snk"], b.node_id);

    let report = b
        .handle
        .actor_report(result.actor_map["src"])
        .await
        .expect("report");
    assert_eq!(report["ports"][0]["state"], "Connected");

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn deploy_falls_back_when_no_node_matches() {
    let (a, b) = spawn_pair(18530).await;
    let deployer = Deployer::new(a.handle.clone());

    let result = deployer
        .deploy(pipeline_request("core", "moon"))
        .await
        .expect("deploy");

    // Nothing matches zone=moon; placement falls back to the full node
    // set and the result says so.
    assert!(!result.requirements_fulfilled);
    assert_eq!(result.actor_map.len(), 2);

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn destroy_application_removes_actors_everywhere() {
    let (a, b) = spawn_pair(18540).await;
    let deployer = Deployer::new(a.handle.clone());

    let result = deployer
        .deploy(pipeline_request("core", "edge"))
        .await
        .expect("deploy");

    let status = deployer.destroy(result.app_id).await.expect("destroy");
    assert!(status.is_ok());

    assert!(actors_of(&a).await.is_empty());
    assert!(actors_of(&b).await.is_empty());
    assert!(a
        .handle
        .list_applications()
        .await
        .expect("list_applications")
        .is_empty());

    a.stop().await;
    b.stop().await;
}

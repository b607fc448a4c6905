//! Actor migration between two live nodes: state and port identity are
//! preserved and peers are rewired to the destination.

mod common;

use common::{actor_spec, actors_of, port, TestNode};

use serde_json::json;

use rill::actor::ActorSpec;
use rill::messages::ConnectRequest;
use rill::port::PortDirection;
use rill::{ManagedState, ResponseStatus};

fn counter_spec(name: &str) -> ActorSpec {
    let mut spec = actor_spec(
        name,
        vec![port("in", PortDirection::In), port("out", PortDirection::Out)],
    );
    spec.state = ManagedState::from_args(&json!({"count": 3, "label": "keep"}))
        .expect("state from args");
    spec
}

#[test_log::test(tokio::test)]
async fn migration_preserves_state_and_port_identity() {
    let a = TestNode::spawn("a", 18210).await;
    let b = TestNode::spawn("b", 18211).await;
    a.link_to(&b).await;

    let actor = a
        .handle
        .new_actor(counter_spec("counter"))
        .await
        .expect("new_actor");

    let before = a.handle.actor_report(actor).await.expect("report");

    let status = a
        .handle
        .migrate_actor(actor, b.node_id)
        .await
        .expect("migrate_actor");
    assert!(status.is_ok(), "migration answered {}", status);

    assert!(actors_of(&a).await.is_empty());
    assert_eq!(actors_of(&b).await, vec![actor]);

    let after = b.handle.actor_report(actor).await.expect("report");
    assert_eq!(after["state"], before["state"]);
    assert_eq!(after["name"], before["name"]);

    // Port identity survives the move; peers can keep their references.
    let ids = |report: &serde_json::Value| -> Vec<serde_json::Value> {
        report["ports"]
            .as_array()
            .expect("ports")
            .iter()
            .map(|p| p["id"].clone())
            .collect()
    };
    assert_eq!(ids(&after), ids(&before));

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn migration_rewires_connected_peer() {
    let a = TestNode::spawn("a", 18220).await;
    let b = TestNode::spawn("b", 18221).await;
    a.link_to(&b).await;

    let src = a
        .handle
        .new_actor(actor_spec("src", vec![port("out", PortDirection::Out)]))
        .await
        .expect("new_actor src");
    let dst = a
        .handle
        .new_actor(actor_spec("dst", vec![port("in", PortDirection::In)]))
        .await
        .expect("new_actor dst");

    let (status, _) = a
        .handle
        .connect_ports(ConnectRequest {
            actor_id: src,
            port_name: "out".to_string(),
            port_dir: PortDirection::Out,
            peer_node_id: None,
            peer_actor_id: dst,
            peer_port_name: "in".to_string(),
        })
        .await
        .expect("connect_ports");
    assert!(status.is_ok());

    let status = a
        .handle
        .migrate_actor(dst, b.node_id)
        .await
        .expect("migrate_actor");
    assert!(status.is_ok(), "migration answered {}", status);

    // The stayer's port now references the destination node.
    let report = a.handle.actor_report(src).await.expect("report src");
    let peer = &report["ports"][0]["peers"][0];
    assert_eq!(peer["node_id"], json!(b.node_id));
    assert_eq!(peer["actor_id"], json!(dst));

    // The mover resumed its connection on the destination.
    let report = b.handle.actor_report(dst).await.expect("report dst");
    let in_port = &report["ports"][0];
    assert_eq!(in_port["state"], "Connected");
    assert_eq!(in_port["peers"][0]["node_id"], json!(a.node_id));
    assert_eq!(in_port["peers"][0]["actor_id"], json!(src));

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn migration_to_unlinked_node_is_unavailable() {
    let a = TestNode::spawn("a", 18230).await;
    let b = TestNode::spawn("b", 18231).await;
    // No link between a and b.

    let actor = a
        .handle
        .new_actor(counter_spec("stuck"))
        .await
        .expect("new_actor");

    let status = a
        .handle
        .migrate_actor(actor, b.node_id)
        .await
        .expect("migrate_actor");
    assert_eq!(status, ResponseStatus::ServiceUnavailable);

    // The actor is untouched and still schedulable on the origin.
    assert_eq!(actors_of(&a).await, vec![actor]);
    let report = a.handle.actor_report(actor).await.expect("report");
    assert_eq!(report["lifecycle"], "Enabled");

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn self_migration_is_a_no_op() {
    let a = TestNode::spawn("a", 18240).await;

    let actor = a
        .handle
        .new_actor(counter_spec("solo"))
        .await
        .expect("new_actor");

    // Self-migration is a no-op answered OK.
    let status = a
        .handle
        .migrate_actor(actor, a.node_id)
        .await
        .expect("migrate_actor");
    assert!(status.is_ok());
    assert_eq!(actors_of(&a).await, vec![actor]);

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn migration_round_trip_returns_the_same_actor() {
    let a = TestNode::spawn("a", 18250).await;
    let b = TestNode::spawn("b", 18251).await;
    a.link_to(&b).await;

    let actor = a
        .handle
        .new_actor(counter_spec("boomerang"))
        .await
        .expect("new_actor");
    let before = a.handle.actor_report(actor).await.expect("report");

    let status = a
        .handle
        .migrate_actor(actor, b.node_id)
        .await
        .expect("migrate out");
    assert!(status.is_ok(), "outbound migration answered {}", status);
    let status = b
        .handle
        .migrate_actor(actor, a.node_id)
        .await
        .expect("migrate back");
    assert!(status.is_ok(), "return migration answered {}", status);

    assert_eq!(actors_of(&a).await, vec![actor]);
    assert!(actors_of(&b).await.is_empty());

    // A full round trip is idempotent: state, name, and port identity all
    // come back unchanged.
    let after = a.handle.actor_report(actor).await.expect("report");
    assert_eq!(after["state"], before["state"]);
    assert_eq!(after["name"], before["name"]);
    let ids = |report: &serde_json::Value| -> Vec<serde_json::Value> {
        report["ports"]
            .as_array()
            .expect("ports")
            .iter()
            .map(|p| p["id"].clone())
            .collect()
    };
    assert_eq!(ids(&after), ids(&before));

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn concurrent_migrations_of_one_actor_are_single_flight() {
    let a = TestNode::spawn("a", 18260).await;
    let b = TestNode::spawn("b", 18261).await;
    a.link_to(&b).await;

    let actor = a
        .handle
        .new_actor(counter_spec("contended"))
        .await
        .expect("new_actor");

    let (first, second) = tokio::join!(
        a.handle.migrate_actor(actor, b.node_id),
        a.handle.migrate_actor(actor, b.node_id),
    );
    let mut statuses = [
        first.expect("migrate_actor"),
        second.expect("migrate_actor"),
    ];
    statuses.sort_by_key(|s| s.code());
    assert!(statuses[0].is_ok(), "one migration proceeds, got {}", statuses[0]);
    assert_eq!(statuses[1], ResponseStatus::ServiceUnavailable);

    // The winner moved the actor; the loser changed nothing.
    assert_eq!(actors_of(&b).await, vec![actor]);
    assert!(actors_of(&a).await.is_empty());

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn migration_preserves_disabled_lifecycle() {
    let a = TestNode::spawn("a", 18270).await;
    let b = TestNode::spawn("b", 18271).await;
    a.link_to(&b).await;

    let actor = a
        .handle
        .new_actor(counter_spec("dormant"))
        .await
        .expect("new_actor");
    a.handle.disable_actor(actor).await.expect("disable_actor");

    let status = a
        .handle
        .migrate_actor(actor, b.node_id)
        .await
        .expect("migrate_actor");
    assert!(status.is_ok(), "migration answered {}", status);

    let report = b.handle.actor_report(actor).await.expect("report");
    assert_eq!(report["lifecycle"], "Disabled");

    a.stop().await;
    b.stop().await;
}

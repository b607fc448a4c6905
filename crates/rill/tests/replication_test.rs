//! Replication groups: scale out to a peer node, scale back in, and the
//! single-operation gate.

mod common;

use common::{actor_spec, actors_of, port, TestNode};

use serde_json::json;

use rill::port::PortDirection;
use rill::replication::LeaderElector;
use rill::{ManagedState, ReplicationId, ResponseStatus, StorageMode};

#[test_log::test(tokio::test)]
async fn replicate_to_peer_and_back() {
    let a = TestNode::spawn("a", 18310).await;
    let b = TestNode::spawn_with(
        "b",
        18311,
        StorageMode::Proxy {
            uri: a.rt_uri.clone(),
        },
        Default::default(),
    )
    .await;

    // b dials the registry holder at startup and announces itself once
    // its registry tunnel is up.
    eventually!(
        a.handle.list_nodes().await.expect("list_nodes").len() == 2,
        "both nodes in the registry"
    );

    let mut spec = actor_spec("source", vec![port("out", PortDirection::Out)]);
    spec.state = ManagedState::from_args(&json!({"seq": 7})).expect("state");
    let master = a.handle.new_actor(spec).await.expect("new_actor");

    let rid = ReplicationId::generate();
    a.handle
        .register_replication(rid, master)
        .await
        .expect("register_replication");

    let status = a
        .handle
        .replicate(rid, Some(b.node_id), false)
        .await
        .expect("replicate");
    assert!(status.is_ok(), "scale out answered {}", status);

    let replicas = actors_of(&b).await;
    assert_eq!(replicas.len(), 1);
    let report = b.handle.actor_report(replicas[0]).await.expect("report");
    assert_eq!(report["name"], "source-replica-1");
    assert_eq!(report["replication_id"], json!(rid));
    // The replica is seeded from the master's managed state and ports.
    assert_eq!(report["state"]["seq"], json!(7));
    assert_eq!(report["ports"][0]["name"], "out");

    let status = a
        .handle
        .replicate(rid, None, true)
        .await
        .expect("dereplicate");
    assert!(status.is_ok(), "scale in answered {}", status);
    assert!(actors_of(&b).await.is_empty());
    assert_eq!(actors_of(&a).await, vec![master]);

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn replicate_in_place_without_peers() {
    let a = TestNode::spawn("a", 18320).await;

    let master = a
        .handle
        .new_actor(actor_spec("solo", vec![]))
        .await
        .expect("new_actor");
    let rid = ReplicationId::generate();
    a.handle
        .register_replication(rid, master)
        .await
        .expect("register_replication");

    let status = a.handle.replicate(rid, None, false).await.expect("replicate");
    assert!(status.is_ok());

    let actors = actors_of(&a).await;
    assert_eq!(actors.len(), 2);

    // Scale back in removes the replica, never the master.
    let status = a.handle.replicate(rid, None, true).await.expect("dereplicate");
    assert!(status.is_ok());
    assert_eq!(actors_of(&a).await, vec![master]);

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn dereplicate_without_replicas_is_not_found() {
    let a = TestNode::spawn("a", 18330).await;

    let master = a
        .handle
        .new_actor(actor_spec("bare", vec![]))
        .await
        .expect("new_actor");
    let rid = ReplicationId::generate();
    a.handle
        .register_replication(rid, master)
        .await
        .expect("register_replication");

    let status = a.handle.replicate(rid, None, true).await.expect("dereplicate");
    assert_eq!(status, ResponseStatus::NotFound);

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn replicate_unknown_group_is_not_found() {
    let a = TestNode::spawn("a", 18340).await;

    let status = a
        .handle
        .replicate(ReplicationId::generate(), None, false)
        .await
        .expect("replicate");
    assert_eq!(status, ResponseStatus::NotFound);

    a.stop().await;
}

/// Elector that never grants leadership, as a follower node would see.
struct Follower;

impl LeaderElector for Follower {
    fn is_leader(&self, _id: &ReplicationId) -> bool {
        false
    }
}

#[test_log::test(tokio::test)]
async fn non_leader_refuses_replication_orders() {
    let a = TestNode::spawn_with_elector("follower", 18350, Box::new(Follower)).await;

    let master = a
        .handle
        .new_actor(actor_spec("source", vec![]))
        .await
        .expect("new_actor");
    let rid = ReplicationId::generate();
    a.handle
        .register_replication(rid, master)
        .await
        .expect("register_replication");

    // Scale orders are only accepted on the leader for the group.
    let status = a.handle.replicate(rid, None, false).await.expect("replicate");
    assert_eq!(status, ResponseStatus::NotFound);
    assert_eq!(actors_of(&a).await, vec![master]);

    a.stop().await;
}

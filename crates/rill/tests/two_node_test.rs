//! Two-node link and remote actor lifecycle tests over real TCP.

mod common;

use common::{actor_spec, actors_of, port, TestNode};

use rill::messages::ConnectRequest;
use rill::port::PortDirection;
use rill::proto::TunnelType;
use rill::tunnel::TunnelEvent;
use rill::{ActorId, ResponseStatus};

#[test_log::test(tokio::test)]
async fn peer_setup_brings_link_and_tunnel_up() {
    let a = TestNode::spawn("a", 18110).await;
    let b = TestNode::spawn("b", 18111).await;

    let mut events = a
        .handle
        .subscribe_tunnel_events()
        .await
        .expect("subscribe");

    a.link_to(&b).await;

    match events.recv().await {
        Some(TunnelEvent::Up { peer, tunnel_type }) => {
            assert_eq!(peer, b.node_id);
            assert_eq!(tunnel_type, TunnelType::Proto);
        }
        other => panic!("expected Up event, got {:?}", other),
    }

    let b_node_id = b.node_id;
    b.stop().await;

    match events.recv().await {
        Some(TunnelEvent::Down { peer, .. }) => assert_eq!(peer, b_node_id),
        other => panic!("expected Down event, got {:?}", other),
    }

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn peer_setup_reports_unreachable_peer() {
    let a = TestNode::spawn("a", 18115).await;

    let status = a
        .handle
        .peer_setup(vec!["rill://127.0.0.1:1".to_string()])
        .await
        .expect("peer_setup");
    assert_eq!(status, ResponseStatus::ServiceUnavailable);

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn remote_actor_create_and_destroy() {
    let a = TestNode::spawn("a", 18120).await;
    let b = TestNode::spawn("b", 18121).await;
    a.link_to(&b).await;

    let actor_id = a
        .handle
        .new_actor_on(b.node_id, actor_spec("echo", vec![]), None, None)
        .await
        .expect("new_actor_on");

    assert_eq!(actors_of(&b).await, vec![actor_id]);
    assert!(actors_of(&a).await.is_empty());

    let status = a
        .handle
        .destroy_actor_on(b.node_id, actor_id)
        .await
        .expect("destroy_actor_on");
    assert!(status.is_ok());
    assert!(actors_of(&b).await.is_empty());

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn remote_connect_to_missing_port_is_not_found() {
    let a = TestNode::spawn("a", 18130).await;
    let b = TestNode::spawn("b", 18131).await;
    a.link_to(&b).await;

    let src = a
        .handle
        .new_actor(actor_spec("src", vec![port("out", PortDirection::Out)]))
        .await
        .expect("new_actor");

    let (status, port_id) = a
        .handle
        .connect_ports(ConnectRequest {
            actor_id: src,
            port_name: "out".to_string(),
            port_dir: PortDirection::Out,
            peer_node_id: Some(b.node_id),
            peer_actor_id: ActorId::generate(),
            peer_port_name: "in".to_string(),
        })
        .await
        .expect("connect_ports");

    assert_eq!(status, ResponseStatus::NotFound);
    assert_eq!(port_id, None);

    // The failed handshake must not leave the local port half-wired.
    let report = a.handle.actor_report(src).await.expect("report");
    let ports = report["ports"].as_array().expect("ports array");
    assert_eq!(ports[0]["state"], "Disconnected");
    assert_eq!(ports[0]["peers"].as_array().map(|p| p.len()), Some(0));

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn remote_connect_wires_both_sides() {
    let a = TestNode::spawn("a", 18140).await;
    let b = TestNode::spawn("b", 18141).await;
    a.link_to(&b).await;

    let src = a
        .handle
        .new_actor(actor_spec("src", vec![port("out", PortDirection::Out)]))
        .await
        .expect("new_actor");
    let dst = b
        .handle
        .new_actor(actor_spec("dst", vec![port("in", PortDirection::In)]))
        .await
        .expect("new_actor");

    let (status, port_id) = a
        .handle
        .connect_ports(ConnectRequest {
            actor_id: src,
            port_name: "out".to_string(),
            port_dir: PortDirection::Out,
            peer_node_id: Some(b.node_id),
            peer_actor_id: dst,
            peer_port_name: "in".to_string(),
        })
        .await
        .expect("connect_ports");
    assert!(status.is_ok(), "connect answered {}", status);
    assert!(port_id.is_some());

    let report = a.handle.actor_report(src).await.expect("report");
    let out_port = &report["ports"][0];
    assert_eq!(out_port["state"], "Connected");
    assert_eq!(
        out_port["peers"][0]["node_id"],
        serde_json::json!(b.node_id)
    );

    let report = b.handle.actor_report(dst).await.expect("report");
    let in_port = &report["ports"][0];
    assert_eq!(in_port["state"], "Connected");
    assert_eq!(in_port["peers"][0]["node_id"], serde_json::json!(a.node_id));

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn losing_connect_detaches_the_remote_reference() {
    let a = TestNode::spawn("a", 18150).await;
    let b = TestNode::spawn("b", 18151).await;
    a.link_to(&b).await;

    // Ports default to a single peer, so only one of two racing connects
    // from the same out port may win.
    let src = a
        .handle
        .new_actor(actor_spec("src", vec![port("out", PortDirection::Out)]))
        .await
        .expect("new_actor src");
    let one = b
        .handle
        .new_actor(actor_spec("one", vec![port("in", PortDirection::In)]))
        .await
        .expect("new_actor one");
    let two = b
        .handle
        .new_actor(actor_spec("two", vec![port("in", PortDirection::In)]))
        .await
        .expect("new_actor two");

    let request = |peer_actor_id| ConnectRequest {
        actor_id: src,
        port_name: "out".to_string(),
        port_dir: PortDirection::Out,
        peer_node_id: Some(b.node_id),
        peer_actor_id,
        peer_port_name: "in".to_string(),
    };
    let (first, second) = tokio::join!(
        a.handle.connect_ports(request(one)),
        a.handle.connect_ports(request(two)),
    );
    let mut statuses = [
        first.expect("connect_ports").0,
        second.expect("connect_ports").0,
    ];
    statuses.sort_by_key(|s| s.code());
    assert!(statuses[0].is_ok(), "one connect wins, got {}", statuses[0]);
    assert_eq!(statuses[1], ResponseStatus::Conflict);

    // The winner holds the only reference on the source side.
    let report = a.handle.actor_report(src).await.expect("report src");
    assert_eq!(report["ports"][0]["peers"].as_array().map(|p| p.len()), Some(1));

    // The loser's attach is undone on b; exactly one reciprocal reference
    // survives across both in-ports.
    let peer_count = |report: &serde_json::Value| {
        report["ports"][0]["peers"]
            .as_array()
            .map(|p| p.len())
            .unwrap_or(0)
    };
    eventually!(
        {
            let one_report = b.handle.actor_report(one).await.expect("report one");
            let two_report = b.handle.actor_report(two).await.expect("report two");
            peer_count(&one_report) + peer_count(&two_report) == 1
        },
        "remote side settles on a single peer reference"
    );

    a.stop().await;
    b.stop().await;
}

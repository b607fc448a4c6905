//! Control protocol round-trips against a live server, driven through the
//! client crate.

use serde_json::json;

use rill::actor::ActorSpec;
use rill::port::{PortDirection, PortProperties, PortSpec};
use rill::registry::RegistryOp;
use rill::{ManagedState, NodeConfig, StorageMode};
use rill_client::{ControlCommand, ControlResponse, RillConnection};
use rill_server::RillServer;

async fn start_server(control_port: u16, rt_port: u16) -> tokio::task::JoinHandle<()> {
    let config = NodeConfig {
        name: "control-test".to_string(),
        control_addr: format!("127.0.0.1:{}", control_port),
        rt_addr: format!("127.0.0.1:{}", rt_port),
        peers: Vec::new(),
        attributes: Default::default(),
        storage: StorageMode::Local,
    };
    let server = RillServer::new(config).await.expect("server bind");
    tokio::spawn(async move {
        server.run().await.expect("server run");
    })
}

fn connection(control_port: u16) -> RillConnection {
    RillConnection::new(
        format!("127.0.0.1:{}", control_port)
            .parse()
            .expect("socket addr"),
    )
}

#[test_log::test(tokio::test)]
async fn actor_lifecycle_over_control_protocol() {
    let server = start_server(18610, 18611).await;
    let mut conn = connection(18610);

    let info = match conn.request(ControlCommand::NodeInfo).await.expect("node info") {
        ControlResponse::NodeInfo { info } => info,
        other => panic!("unexpected response: {:?}", other),
    };
    assert_eq!(info.name, "control-test");

    let spec = ActorSpec {
        actor_type: "std.Counter".to_string(),
        name: "counter".to_string(),
        state: ManagedState::from_args(&json!({"count": 0})).expect("state"),
        ports: vec![PortSpec {
            name: "out".to_string(),
            direction: PortDirection::Out,
            properties: PortProperties::default(),
        }],
    };
    let actor_id = match conn
        .request(ControlCommand::NewActor { spec })
        .await
        .expect("new actor")
    {
        ControlResponse::ActorCreated { actor_id } => actor_id,
        other => panic!("unexpected response: {:?}", other),
    };

    match conn.request(ControlCommand::ListActors).await.expect("list") {
        ControlResponse::Actors { actors } => assert_eq!(actors, vec![actor_id]),
        other => panic!("unexpected response: {:?}", other),
    }

    match conn
        .request(ControlCommand::ActorReport { actor_id })
        .await
        .expect("report")
    {
        ControlResponse::Report { report } => {
            assert_eq!(report["name"], "counter");
            assert_eq!(report["state"]["count"], json!(0));
        }
        other => panic!("unexpected response: {:?}", other),
    }

    match conn
        .request(ControlCommand::DestroyActor { actor_id })
        .await
        .expect("destroy")
    {
        ControlResponse::Status { status } => assert!(status.is_ok()),
        other => panic!("unexpected response: {:?}", other),
    }

    match conn.request(ControlCommand::Shutdown).await.expect("shutdown") {
        ControlResponse::ShuttingDown => {}
        other => panic!("unexpected response: {:?}", other),
    }
    server.await.expect("server exit");
}

#[test_log::test(tokio::test)]
async fn storage_and_errors_over_control_protocol() {
    let server = start_server(18620, 18621).await;
    let mut conn = connection(18620);

    match conn
        .request(ControlCommand::Storage {
            op: RegistryOp::Set {
                key: "k".to_string(),
                value: json!("v"),
            },
        })
        .await
        .expect("storage set")
    {
        ControlResponse::Storage { status, .. } => assert!(status.is_ok()),
        other => panic!("unexpected response: {:?}", other),
    }

    match conn
        .request(ControlCommand::Storage {
            op: RegistryOp::Get {
                key: "k".to_string(),
            },
        })
        .await
        .expect("storage get")
    {
        ControlResponse::Storage { status, reply } => {
            assert!(status.is_ok());
            assert_eq!(
                serde_json::to_value(&reply).expect("reply json"),
                json!({"Value": "v"})
            );
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // Operations against unknown ids answer with an error frame instead
    // of tearing the connection down.
    match conn
        .request(ControlCommand::ActorReport {
            actor_id: rill::ActorId::generate(),
        })
        .await
        .expect("report unknown")
    {
        ControlResponse::Error { message } => assert!(!message.is_empty()),
        other => panic!("unexpected response: {:?}", other),
    }

    // The connection stays usable afterwards.
    match conn.request(ControlCommand::ListActors).await.expect("list") {
        ControlResponse::Actors { actors } => assert!(actors.is_empty()),
        other => panic!("unexpected response: {:?}", other),
    }

    conn.send(ControlCommand::Shutdown).await.expect("shutdown");
    server.await.expect("server exit");
}

//! Registry access through a storage proxy: one node holds the store,
//! the other reaches it over a registry tunnel.

mod common;

use common::TestNode;

use serde_json::json;

use rill::registry::{RegistryOp, RegistryReply};
use rill::{ResponseStatus, StorageMode};

#[test_log::test(tokio::test)]
async fn proxy_storage_round_trips_through_peer() {
    let a = TestNode::spawn("a", 18410).await;
    let b = TestNode::spawn_with(
        "b",
        18411,
        StorageMode::Proxy {
            uri: a.rt_uri.clone(),
        },
        Default::default(),
    )
    .await;

    eventually!(
        a.handle.list_nodes().await.expect("list_nodes").len() == 2,
        "both nodes in the registry"
    );

    // A write issued on the proxy side lands in the holder's store.
    let (status, _) = b
        .handle
        .storage_op(RegistryOp::Set {
            key: "app-setting".to_string(),
            value: json!({"limit": 10}),
        })
        .await
        .expect("storage set");
    assert!(status.is_ok());

    let (status, reply) = a
        .handle
        .storage_op(RegistryOp::Get {
            key: "app-setting".to_string(),
        })
        .await
        .expect("storage get");
    assert!(status.is_ok());
    match reply {
        RegistryReply::Value(Some(value)) => assert_eq!(value, json!({"limit": 10})),
        other => panic!("expected a value, got {:?}", other),
    }

    // And a read issued on the proxy side sees the holder's data.
    let (status, reply) = b
        .handle
        .storage_op(RegistryOp::Get {
            key: "app-setting".to_string(),
        })
        .await
        .expect("storage get via proxy");
    assert!(status.is_ok());
    assert!(matches!(reply, RegistryReply::Value(Some(_))));

    a.stop().await;
    b.stop().await;
}

#[test_log::test(tokio::test)]
async fn missing_key_answers_empty_value() {
    let a = TestNode::spawn("a", 18420).await;

    // A miss is an empty value, not an error; callers poll for keys that
    // are not there yet.
    let (status, reply) = a
        .handle
        .storage_op(RegistryOp::Get {
            key: "never-written".to_string(),
        })
        .await
        .expect("storage get");
    assert_eq!(status, ResponseStatus::Ok);
    assert!(matches!(reply, RegistryReply::Value(None)));

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn node_attributes_are_indexed() {
    let mut attrs = std::collections::BTreeMap::new();
    attrs.insert("zone".to_string(), "edge".to_string());
    let a = TestNode::spawn_with("a", 18430, StorageMode::Local, attrs).await;

    let (status, reply) = a
        .handle
        .storage_op(RegistryOp::GetIndex {
            index: rill::registry::attribute_index("zone", "edge"),
        })
        .await
        .expect("storage index");
    assert!(status.is_ok());
    match reply {
        RegistryReply::Values(values) => {
            assert_eq!(values, vec![a.node_id.to_string()]);
        }
        other => panic!("expected index values, got {:?}", other),
    }

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn stopping_node_retracts_its_registration() {
    let a = TestNode::spawn("a", 18440).await;
    let b = TestNode::spawn_with(
        "b",
        18441,
        StorageMode::Proxy {
            uri: a.rt_uri.clone(),
        },
        Default::default(),
    )
    .await;

    eventually!(
        a.handle.list_nodes().await.expect("list_nodes").len() == 2,
        "both nodes in the registry"
    );

    b.stop().await;

    eventually!(
        a.handle.list_nodes().await.expect("list_nodes") == vec![a.node_id],
        "departed node removed from the registry"
    );

    a.stop().await;
}

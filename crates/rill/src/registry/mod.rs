//! Distributed key-value + indexed-set registry.
//!
//! The registry is the sole cross-node shared resource. Each node writes
//! only its own id-prefixed keys; index add/remove are idempotent and
//! commutative so concurrent updates from different nodes need no
//! coordination. Reads are eventually consistent: a `get` may miss a very
//! recently written key and callers tolerate a NotFound answer.
//!
//! A node without direct storage access forwards every operation through a
//! designated proxy peer over a `Registry` tunnel (one extra hop, same
//! consistency contract).

mod local;

pub use local::LocalStore;

use crate::id::{ActorId, AppId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Composite tuple key for the indexed-set side of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<String>);

impl IndexKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// How this node reaches storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StorageMode {
    /// The node holds the store itself and serves proxy clients.
    Local,
    /// Every operation is forwarded to the peer at `uri`.
    Proxy { uri: String },
}

impl Default for StorageMode {
    fn default() -> Self {
        Self::Local
    }
}

/// A single registry operation, also the proxy wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryOp {
    Get { key: String },
    Set { key: String, value: Value },
    Delete { key: String },
    AddIndex { index: IndexKey, value: String },
    RemoveIndex { index: IndexKey, value: String },
    GetIndex { index: IndexKey },
}

impl RegistryOp {
    pub fn to_log(&self) -> String {
        match self {
            Self::Get { key } => format!("Get: {}", key),
            Self::Set { key, .. } => format!("Set: {}", key),
            Self::Delete { key } => format!("Delete: {}", key),
            Self::AddIndex { index, value } => format!("AddIndex: {} += {}", index, value),
            Self::RemoveIndex { index, value } => format!("RemoveIndex: {} -= {}", index, value),
            Self::GetIndex { index } => format!("GetIndex: {}", index),
        }
    }
}

/// Result of a registry operation. `Value(None)` is the NotFound answer
/// for a `get`; callers treat it as "not there yet", not as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryReply {
    Value(Option<Value>),
    Values(Vec<String>),
    Done,
}

impl RegistryReply {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(v) => v,
            _ => None,
        }
    }

    pub fn into_values(self) -> Vec<String> {
        match self {
            Self::Values(v) => v,
            _ => Vec::new(),
        }
    }
}

/// Key under which a node publishes its record.
pub fn node_key(id: &NodeId) -> String {
    format!("node-{}", id)
}

/// Key under which an actor's current residence is claimed.
pub fn actor_key(id: &ActorId) -> String {
    format!("actor-{}", id)
}

/// Key under which an application record is stored.
pub fn app_key(id: &AppId) -> String {
    format!("application-{}", id)
}

/// Key recording unreconciled migration leftovers for operator attention.
pub fn reconcile_key(id: &ActorId) -> String {
    format!("reconcile-{}", id)
}

/// Index of all known node ids.
pub fn node_index() -> IndexKey {
    IndexKey::new(["node"])
}

/// Index of nodes carrying an attribute name/value pair.
pub fn attribute_index(name: &str, value: &str) -> IndexKey {
    IndexKey::new(["node", "attribute", name, value])
}

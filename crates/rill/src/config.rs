use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::errors::RuntimeError;
use crate::registry::StorageMode;
use crate::Result;

/// Node configuration, usually loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name, also published as the `node_name`
    /// attribute.
    pub name: String,
    /// Address the control server listens on.
    pub control_addr: String,
    /// Address the runtime-to-runtime listener binds to.
    pub rt_addr: String,
    /// Peer runtime URIs to dial at startup.
    pub peers: Vec<String>,
    /// Indexed attributes announced to the registry.
    pub attributes: BTreeMap<String, String>,
    /// Local store or proxy through another node.
    pub storage: StorageMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "rill-node".to_string(),
            control_addr: "127.0.0.1:9280".to_string(),
            rt_addr: "127.0.0.1:9180".to_string(),
            peers: Vec::new(),
            attributes: BTreeMap::new(),
            storage: StorageMode::Local,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading node config from {:?}", path);
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| RuntimeError::BadRequest(format!("invalid config {:?}: {}", path, e)))
    }

    /// URI peers use to reach this node's runtime listener.
    pub fn rt_uri(&self) -> String {
        format!("rill://{}", self.rt_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let raw = r#"
            name = "edge-1"
            control_addr = "127.0.0.1:9281"
            rt_addr = "127.0.0.1:9181"
            peers = ["rill://127.0.0.1:9180"]

            [attributes]
            zone = "eu-1"

            [storage]
            mode = "local"
        "#;
        let config: NodeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.name, "edge-1");
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.attributes["zone"], "eu-1");
        assert_eq!(config.rt_uri(), "rill://127.0.0.1:9181");
    }

    #[test]
    fn test_config_defaults() {
        let config: NodeConfig = toml::from_str("name = \"n\"").unwrap();
        assert!(config.peers.is_empty());
        assert!(matches!(config.storage, StorageMode::Local));
    }
}

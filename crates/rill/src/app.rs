//! Application deployment: placement by attribute requirements, actor
//! instantiation across nodes, and port wiring.
//!
//! The deployer is a client of the node loop; every step goes through a
//! [`NodeHandle`], so deployment works the same whether the target actor
//! lands locally or on a peer.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::actor::{ActorSpec, ManagedState};
use crate::errors::{ResponseStatus, RuntimeError};
use crate::id::{ActorId, AppId, NodeId};
use crate::messages::ConnectRequest;
use crate::node::NodeHandle;
use crate::port::{PortDirection, PortSpec};
use crate::registry::{actor_key, attribute_index, node_index, RegistryOp};
use crate::Result;

/// Whether a requirement narrows the candidate set or removes from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementRule {
    #[serde(rename = "+")]
    Intersect,
    #[serde(rename = "-")]
    Subtract,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementArgs {
    pub attribute: String,
    pub value: String,
}

/// One placement rule for an actor. The only operation understood is
/// `node_attr_match` against the registry's attribute indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub op: String,
    pub kwargs: RequirementArgs,
    #[serde(rename = "type")]
    pub rule: RequirementRule,
}

pub const REQ_OP_NODE_ATTR_MATCH: &str = "node_attr_match";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployActorSpec {
    pub actor_type: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// A connection between two deployed actors, both ends written as
/// `"actor.port"`. Data flows from `src` (an out port) to `dst`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub name: String,
    pub actors: BTreeMap<String, DeployActorSpec>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    /// Placement requirements keyed by actor name.
    #[serde(default)]
    pub requirements: BTreeMap<String, Vec<Requirement>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
    pub app_id: AppId,
    pub actor_map: BTreeMap<String, ActorId>,
    pub placement: BTreeMap<String, NodeId>,
    pub requirements_fulfilled: bool,
}

#[derive(Debug, Clone)]
pub struct Application {
    pub name: String,
    pub actors: Vec<ActorId>,
}

/// Application records on one node. Pure bookkeeping; the deployer drives
/// the cross-node work.
#[derive(Debug, Default)]
pub struct AppManager {
    apps: HashMap<AppId, Application>,
}

impl AppManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, app_id: AppId, name: String, actors: Vec<ActorId>) {
        self.apps.insert(app_id, Application { name, actors });
    }

    pub fn list(&self) -> Vec<AppId> {
        let mut ids: Vec<AppId> = self.apps.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, app_id: &AppId) -> Result<(String, Vec<ActorId>)> {
        self.apps
            .get(app_id)
            .map(|app| (app.name.clone(), app.actors.clone()))
            .ok_or(RuntimeError::AppNotFound(*app_id))
    }

    pub fn remove(&mut self, app_id: &AppId) -> Result<Vec<ActorId>> {
        self.apps
            .remove(app_id)
            .map(|app| app.actors)
            .ok_or(RuntimeError::AppNotFound(*app_id))
    }
}

fn parse_endpoint(endpoint: &str) -> Result<(String, String)> {
    match endpoint.split_once('.') {
        Some((actor, port)) if !actor.is_empty() && !port.is_empty() => {
            Ok((actor.to_string(), port.to_string()))
        }
        _ => Err(RuntimeError::BadRequest(format!(
            "endpoint must be actor.port: {}",
            endpoint
        ))),
    }
}

/// Drives deployment and requirement-based placement through a node.
pub struct Deployer {
    handle: NodeHandle,
}

impl Deployer {
    pub fn new(handle: NodeHandle) -> Self {
        Self { handle }
    }

    /// Nodes matching a requirement list. Falls back to every known node
    /// (reported as unfulfilled) when the rules select nothing.
    async fn resolve_requirements(
        &self,
        requirements: &[Requirement],
    ) -> Result<(Vec<NodeId>, bool)> {
        let (status, reply) = self
            .handle
            .storage_op(RegistryOp::GetIndex {
                index: node_index(),
            })
            .await?;
        if !status.is_ok() {
            return Err(RuntimeError::Internal(format!(
                "node index read failed: {}",
                status
            )));
        }
        let all: BTreeSet<String> = reply.into_values().into_iter().collect();
        let mut candidates = all.clone();

        for req in requirements {
            if req.op != REQ_OP_NODE_ATTR_MATCH {
                return Err(RuntimeError::BadRequest(format!(
                    "unknown requirement op: {}",
                    req.op
                )));
            }
            let (status, reply) = self
                .handle
                .storage_op(RegistryOp::GetIndex {
                    index: attribute_index(&req.kwargs.attribute, &req.kwargs.value),
                })
                .await?;
            if !status.is_ok() {
                return Err(RuntimeError::Internal(format!(
                    "attribute index read failed: {}",
                    status
                )));
            }
            let matched: BTreeSet<String> = reply.into_values().into_iter().collect();
            match req.rule {
                RequirementRule::Intersect => candidates.retain(|n| matched.contains(n)),
                RequirementRule::Subtract => candidates.retain(|n| !matched.contains(n)),
            }
        }

        let fulfilled = !candidates.is_empty();
        let chosen = if fulfilled { candidates } else { all };
        let nodes = chosen
            .iter()
            .filter_map(|v| NodeId::parse(v).ok())
            .collect();
        Ok((nodes, fulfilled))
    }

    /// Deploy an application: place every actor, create it on its node,
    /// wire the connections, then register the application record.
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployResult> {
        let app_id = AppId::generate();
        info!("Deploying application {} as {}", request.name, app_id);

        let local = self.handle.node_info().await?.node_id;
        let empty: Vec<Requirement> = Vec::new();
        let mut actor_map = BTreeMap::new();
        let mut placement = BTreeMap::new();
        let mut fulfilled = true;
        let mut cursor = 0usize;

        for (name, spec) in &request.actors {
            let reqs = request.requirements.get(name).unwrap_or(&empty);
            let (candidates, ok) = self.resolve_requirements(reqs).await?;
            fulfilled &= ok;
            let target = if candidates.is_empty() {
                local
            } else {
                let pick = candidates[cursor % candidates.len()];
                cursor += 1;
                pick
            };
            let state = if spec.args.is_null() {
                ManagedState::new()
            } else {
                ManagedState::from_args(&spec.args)?
            };
            let actor_spec = ActorSpec {
                actor_type: spec.actor_type.clone(),
                name: name.clone(),
                state,
                ports: spec.ports.clone(),
            };
            let actor_id = self
                .handle
                .new_actor_on(target, actor_spec, Some(app_id), None)
                .await?;
            debug!("Actor {} ({}) placed on {}", name, actor_id, target);
            actor_map.insert(name.clone(), actor_id);
            placement.insert(name.clone(), target);
        }

        for conn in &request.connections {
            self.wire(&actor_map, &placement, local, conn).await?;
        }

        self.handle
            .register_application(app_id, request.name.clone(), actor_map.values().copied().collect())
            .await?;

        Ok(DeployResult {
            app_id,
            actor_map,
            placement,
            requirements_fulfilled: fulfilled,
        })
    }

    async fn wire(
        &self,
        actor_map: &BTreeMap<String, ActorId>,
        placement: &BTreeMap<String, NodeId>,
        local: NodeId,
        conn: &ConnectionSpec,
    ) -> Result<()> {
        let (src_actor, src_port) = parse_endpoint(&conn.src)?;
        let (dst_actor, dst_port) = parse_endpoint(&conn.dst)?;
        let missing = |name: &str| {
            RuntimeError::BadRequest(format!("connection names unknown actor: {}", name))
        };
        let src_id = *actor_map.get(&src_actor).ok_or_else(|| missing(&src_actor))?;
        let dst_id = *actor_map.get(&dst_actor).ok_or_else(|| missing(&dst_actor))?;
        let src_node = *placement.get(&src_actor).ok_or_else(|| missing(&src_actor))?;
        let dst_node = *placement.get(&dst_actor).ok_or_else(|| missing(&dst_actor))?;

        let connect = ConnectRequest {
            actor_id: src_id,
            port_name: src_port,
            port_dir: PortDirection::Out,
            peer_node_id: Some(dst_node),
            peer_actor_id: dst_id,
            peer_port_name: dst_port,
        };
        let status = if src_node == local {
            self.handle.connect_ports(connect).await?.0
        } else {
            self.handle.connect_ports_on(src_node, connect).await?
        };
        if !status.is_ok() {
            return Err(RuntimeError::Internal(format!(
                "wiring {} -> {} failed: {}",
                conn.src, conn.dst, status
            )));
        }
        Ok(())
    }

    /// Tear an application down, destroying its actors everywhere.
    pub async fn destroy(&self, app_id: AppId) -> Result<ResponseStatus> {
        let (_, actors) = self.handle.get_application(app_id).await?;
        let local = self.handle.node_info().await?.node_id;
        for actor_id in actors {
            let (status, reply) = self
                .handle
                .storage_op(RegistryOp::Get {
                    key: actor_key(&actor_id),
                })
                .await?;
            let owner = if status.is_ok() {
                reply
                    .into_value()
                    .and_then(|v| v.get("node_id").cloned())
                    .and_then(|v| serde_json::from_value::<NodeId>(v).ok())
            } else {
                None
            };
            let result = self
                .handle
                .destroy_actor_on(owner.unwrap_or(local), actor_id)
                .await?;
            if !result.is_ok() {
                warn!("Actor {} not removed during app teardown: {}", actor_id, result);
            }
        }
        self.handle.remove_application(app_id).await
    }

    /// Re-place an actor according to attribute requirements. With `keep`
    /// the current node stays eligible; without it the actor must move.
    pub async fn migrate_with_requirements(
        &self,
        actor_id: ActorId,
        requirements: Vec<Requirement>,
        keep: bool,
    ) -> Result<ResponseStatus> {
        let (status, reply) = self
            .handle
            .storage_op(RegistryOp::Get {
                key: actor_key(&actor_id),
            })
            .await?;
        if !status.is_ok() {
            return Ok(ResponseStatus::NotFound);
        }
        let current = reply
            .into_value()
            .and_then(|v| v.get("node_id").cloned())
            .and_then(|v| serde_json::from_value::<NodeId>(v).ok())
            .ok_or(RuntimeError::ActorNotFound(actor_id))?;

        let (candidates, fulfilled) = self.resolve_requirements(&requirements).await?;
        if !fulfilled {
            return Ok(ResponseStatus::ServiceUnavailable);
        }
        if keep && candidates.contains(&current) {
            debug!("Actor {} already satisfies requirements on {}", actor_id, current);
            return Ok(ResponseStatus::Ok);
        }
        let Some(target) = candidates.into_iter().find(|n| *n != current) else {
            return Ok(ResponseStatus::ServiceUnavailable);
        };
        self.handle.migrate_actor(actor_id, target).await
    }
}

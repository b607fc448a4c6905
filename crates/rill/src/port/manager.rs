use super::{
    ConnectionState, DisconnectMode, PeerRef, Port, PortDirection, PortSnapshot, PortSpec,
    RoutingPolicy,
};
use crate::errors::RuntimeError;
use crate::id::{ActorId, NodeId, PortId};
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Owns the node-local side of the port-connection graph. All mutations
/// are synchronous; the node loop orchestrates the cross-node handshakes
/// and feeds the results back in.
#[derive(Debug)]
pub struct PortManager {
    node_id: NodeId,
    ports: HashMap<PortId, Port>,
    by_actor: HashMap<ActorId, HashMap<String, PortId>>,
}

impl PortManager {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ports: HashMap::new(),
            by_actor: HashMap::new(),
        }
    }

    /// Instantiate an actor's ports from specs. Names must be unique per
    /// actor.
    pub fn create_ports(
        &mut self,
        actor_id: ActorId,
        specs: &[PortSpec],
    ) -> Result<HashMap<String, PortId>> {
        let mut names = HashMap::new();
        for spec in specs {
            if names.contains_key(&spec.name) {
                return Err(RuntimeError::BadRequest(format!(
                    "duplicate port name: {}",
                    spec.name
                )));
            }
            let port = Port::new(actor_id, spec);
            names.insert(spec.name.clone(), port.id);
            self.ports.insert(port.id, port);
        }
        self.by_actor.insert(actor_id, names.clone());
        Ok(names)
    }

    /// Re-create an actor's ports from a snapshot, preserving port ids so
    /// existing peer references stay valid.
    pub fn restore_ports(
        &mut self,
        actor_id: ActorId,
        snapshots: &[PortSnapshot],
    ) -> HashMap<String, PortId> {
        let mut names = HashMap::new();
        for snap in snapshots {
            let state = if snap.peers.is_empty() {
                ConnectionState::Disconnected
            } else {
                snap.state
            };
            let port = Port {
                id: snap.id,
                name: snap.name.clone(),
                direction: snap.direction,
                actor_id,
                properties: snap.properties.clone(),
                state,
                peers: snap.peers.clone(),
                queue: snap.queue.iter().cloned().collect(),
                next_peer: 0,
            };
            names.insert(snap.name.clone(), port.id);
            self.ports.insert(snap.id, port);
        }
        self.by_actor.insert(actor_id, names.clone());
        names
    }

    /// Remove every port of an actor, returning them so the caller can
    /// notify remaining peers.
    pub fn remove_actor_ports(&mut self, actor_id: &ActorId) -> Vec<Port> {
        let Some(names) = self.by_actor.remove(actor_id) else {
            return Vec::new();
        };
        names
            .values()
            .filter_map(|id| self.ports.remove(id))
            .collect()
    }

    pub fn get(&self, port_id: &PortId) -> Result<&Port> {
        self.ports
            .get(port_id)
            .ok_or_else(|| RuntimeError::PortNotFound(port_id.to_string()))
    }

    fn get_mut(&mut self, port_id: &PortId) -> Result<&mut Port> {
        self.ports
            .get_mut(port_id)
            .ok_or_else(|| RuntimeError::PortNotFound(port_id.to_string()))
    }

    /// Resolve a port by id, or by (actor, name), optionally checking the
    /// direction.
    pub fn resolve(
        &self,
        actor_id: Option<&ActorId>,
        port_name: Option<&str>,
        port_id: Option<&PortId>,
        direction: Option<PortDirection>,
    ) -> Result<PortId> {
        let id = if let Some(id) = port_id {
            *id
        } else {
            let actor_id = actor_id
                .ok_or_else(|| RuntimeError::BadRequest("missing actor id".into()))?;
            let name = port_name
                .ok_or_else(|| RuntimeError::BadRequest("missing port name".into()))?;
            *self
                .by_actor
                .get(actor_id)
                .and_then(|names| names.get(name))
                .ok_or_else(|| RuntimeError::PortNotFound(name.to_string()))?
        };
        let port = self.get(&id)?;
        if let Some(dir) = direction {
            if port.direction != dir {
                return Err(RuntimeError::DirectionMismatch(format!(
                    "port {} is {}, expected {}",
                    port.name, port.direction, dir
                )));
            }
        }
        Ok(id)
    }

    pub fn ports_of(&self, actor_id: &ActorId) -> Vec<PortId> {
        self.by_actor
            .get(actor_id)
            .map(|names| names.values().copied().collect())
            .unwrap_or_default()
    }

    /// Check that a peer with the given direction may attach to this port.
    /// No state is mutated on failure.
    pub fn validate_attach(
        &self,
        port_id: &PortId,
        peer_direction: PortDirection,
        peer: &PeerRef,
    ) -> Result<()> {
        let port = self.get(port_id)?;
        if peer_direction != port.direction.complement() {
            return Err(RuntimeError::DirectionMismatch(format!(
                "{} port cannot attach to {} port",
                peer_direction, port.direction
            )));
        }
        if port.has_peer(peer) {
            // Re-connect of an existing pair is idempotent
            return Ok(());
        }
        if !port.accepts_peer() {
            return Err(RuntimeError::PeerLimit(*port_id));
        }
        Ok(())
    }

    /// Add a peer reference and mark the port connected. Callers validate
    /// first.
    pub fn attach_peer(&mut self, port_id: &PortId, peer: PeerRef) -> Result<()> {
        let port = self.get_mut(port_id)?;
        if !port.has_peer(&peer) {
            port.peers.push(peer);
        }
        port.state = ConnectionState::Connected;
        debug!("Port {} connected to peer port {}", port_id, peer.port_id);
        Ok(())
    }

    /// Wire two resident ports. Validates both sides before touching
    /// either.
    pub fn connect_local(&mut self, a: &PortId, b: &PortId) -> Result<()> {
        if a == b {
            return Err(RuntimeError::BadRequest(
                "cannot connect a port to itself".into(),
            ));
        }
        let peer_of = |pm: &Self, id: &PortId| -> Result<PeerRef> {
            let port = pm.get(id)?;
            Ok(PeerRef {
                node_id: pm.node_id,
                actor_id: port.actor_id,
                port_id: port.id,
            })
        };
        let a_ref = peer_of(self, a)?;
        let b_ref = peer_of(self, b)?;
        let a_dir = self.get(a)?.direction;
        let b_dir = self.get(b)?.direction;
        self.validate_attach(a, b_dir, &b_ref)?;
        self.validate_attach(b, a_dir, &a_ref)?;
        self.attach_peer(a, b_ref)?;
        self.attach_peer(b, a_ref)?;
        Ok(())
    }

    pub fn mark(&mut self, port_id: &PortId, state: ConnectionState) -> Result<()> {
        self.get_mut(port_id)?.state = state;
        Ok(())
    }

    /// Disconnect one port. Returns the peer references the caller must
    /// notify (empty for TEMPORARY, and for EXHAUST while data remains
    /// queued).
    pub fn disconnect(&mut self, port_id: &PortId, mode: DisconnectMode) -> Result<Vec<PeerRef>> {
        let port = self.get_mut(port_id)?;
        match mode {
            DisconnectMode::Temporary => {
                port.state = ConnectionState::Disconnected;
                Ok(Vec::new())
            }
            DisconnectMode::Terminate => {
                port.state = ConnectionState::Disconnected;
                port.queue.clear();
                Ok(std::mem::take(&mut port.peers))
            }
            DisconnectMode::Exhaust => {
                if port.queue.is_empty() {
                    port.state = ConnectionState::Disconnected;
                    Ok(std::mem::take(&mut port.peers))
                } else {
                    port.state = ConnectionState::Exhausting;
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Exhausting ports whose queue has drained; the scheduler finalizes
    /// these each tick.
    pub fn exhaust_ready(&self) -> Vec<PortId> {
        self.ports
            .values()
            .filter(|p| p.state == ConnectionState::Exhausting && p.queue.is_empty())
            .map(|p| p.id)
            .collect()
    }

    /// Finalize an EXHAUST disconnect once the engine reports the queue
    /// drained.
    pub fn drain_complete(&mut self, port_id: &PortId) -> Result<Vec<PeerRef>> {
        let port = self.get_mut(port_id)?;
        if port.state != ConnectionState::Exhausting {
            return Ok(Vec::new());
        }
        port.state = ConnectionState::Disconnected;
        port.queue.clear();
        Ok(std::mem::take(&mut port.peers))
    }

    /// Drop one peer reference, as requested by the remote side of a
    /// TERMINATE.
    pub fn detach_peer(&mut self, port_id: &PortId, peer: &PeerRef) -> Result<()> {
        let port = self.get_mut(port_id)?;
        port.peers.retain(|p| p != peer);
        if port.peers.is_empty() {
            port.state = ConnectionState::Disconnected;
        }
        Ok(())
    }

    /// Migration rewiring: repoint the matching peer reference at a new
    /// residence.
    pub fn replace_peer(
        &mut self,
        port_id: &PortId,
        match_peer: &PeerRef,
        new_peer: PeerRef,
    ) -> Result<()> {
        let port = self.get_mut(port_id)?;
        let slot = port
            .peers
            .iter_mut()
            .find(|p| **p == *match_peer || p.port_id == match_peer.port_id)
            .ok_or_else(|| {
                RuntimeError::PortNotFound(format!("no peer {} on port", match_peer.port_id))
            })?;
        *slot = new_peer;
        port.state = ConnectionState::Connected;
        debug!(
            "Port {} peer rewired to node {}",
            port_id, new_peer.node_id
        );
        Ok(())
    }

    pub fn snapshot_actor(&self, actor_id: &ActorId) -> Vec<PortSnapshot> {
        self.ports_of(actor_id)
            .iter()
            .filter_map(|id| self.ports.get(id))
            .map(|port| PortSnapshot {
                id: port.id,
                name: port.name.clone(),
                direction: port.direction,
                properties: port.properties.clone(),
                state: port.state,
                peers: port.peers.clone(),
                queue: port.queue.iter().cloned().collect(),
            })
            .collect()
    }

    pub fn set_property(&mut self, port_id: &PortId, property: &str, value: &Value) -> Result<()> {
        let port = self.get_mut(port_id)?;
        match property {
            "routing" => {
                let routing: RoutingPolicy = serde_json::from_value(value.clone())
                    .map_err(|e| RuntimeError::BadRequest(format!("bad routing policy: {}", e)))?;
                port.properties.routing = routing;
            }
            "nbr_peers" => {
                let n = value.as_u64().ok_or_else(|| {
                    RuntimeError::BadRequest("nbr_peers must be an integer".into())
                })?;
                if (n as usize) < port.peers.len() {
                    warn!(
                        "Port {} has {} peers, refusing nbr_peers={}",
                        port_id,
                        port.peers.len(),
                        n
                    );
                    return Err(RuntimeError::BadRequest(
                        "nbr_peers below current peer count".into(),
                    ));
                }
                port.properties.nbr_peers = n as u32;
            }
            other => {
                return Err(RuntimeError::BadRequest(format!(
                    "unknown port property: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    pub fn port_state(&self, port_id: &PortId) -> Result<Value> {
        Ok(self.get(port_id)?.report())
    }
}

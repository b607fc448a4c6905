//! Leader-coordinated replication groups.
//!
//! Each group is a per-id state machine guarded by a single-flight check:
//! `operation != NoOperation` implies `status != Ready`, so a second
//! scale request while one is processing is answered SERVICE_UNAVAILABLE.
//! Leadership is an external predicate; this module never elects anyone.

use crate::errors::{ResponseStatus, RuntimeError};
use crate::id::{ActorId, NodeId, ReplicationId};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationOp {
    NoOperation,
    ScaleOut,
    ScaleIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationStatus {
    Ready,
    Busy,
}

/// External consensus collaborator. The core only consumes the boolean.
pub trait LeaderElector: Send {
    fn is_leader(&self, id: &ReplicationId) -> bool;
}

/// Elector for single-node deployments and tests: this node leads every
/// group.
#[derive(Debug, Default)]
pub struct AlwaysLeader;

impl LeaderElector for AlwaysLeader {
    fn is_leader(&self, _id: &ReplicationId) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct ReplicationGroup {
    pub id: ReplicationId,
    /// The actor whose snapshot seeds new replicas.
    pub master: ActorId,
    pub operation: ReplicationOp,
    pub status: ReplicationStatus,
    pub selected_node: Option<NodeId>,
    /// Replica actor ids in creation order; scale-in removes the newest.
    pub replicas: Vec<ActorId>,
}

pub struct ReplicationManager {
    groups: HashMap<ReplicationId, ReplicationGroup>,
    elector: Box<dyn LeaderElector>,
}

impl ReplicationManager {
    pub fn new(elector: Box<dyn LeaderElector>) -> Self {
        Self {
            groups: HashMap::new(),
            elector,
        }
    }

    pub fn register_group(&mut self, id: ReplicationId, master: ActorId) {
        self.groups.entry(id).or_insert(ReplicationGroup {
            id,
            master,
            operation: ReplicationOp::NoOperation,
            status: ReplicationStatus::Ready,
            selected_node: None,
            replicas: Vec::new(),
        });
    }

    pub fn get(&self, id: &ReplicationId) -> Result<&ReplicationGroup> {
        self.groups
            .get(id)
            .ok_or_else(|| RuntimeError::BadRequest(format!("unknown replication group {}", id)))
    }

    pub fn is_leader(&self, id: &ReplicationId) -> bool {
        self.elector.is_leader(id)
    }

    /// The single-flight gate plus leadership check. On success the group
    /// is marked Busy with the requested operation; the caller must drive
    /// the operation and call [`finish`](Self::finish).
    pub fn request_replicate(
        &mut self,
        id: &ReplicationId,
        selected_node: Option<NodeId>,
        scale_out: bool,
    ) -> ResponseStatus {
        // Only the node elected leader for this id may order operations.
        if !self.elector.is_leader(id) {
            return ResponseStatus::NotFound;
        }
        let Some(group) = self.groups.get_mut(id) else {
            return ResponseStatus::NotFound;
        };
        if group.operation != ReplicationOp::NoOperation
            || group.status != ReplicationStatus::Ready
        {
            // Can't order another operation while processing the previous
            return ResponseStatus::ServiceUnavailable;
        }
        group.operation = if scale_out {
            ReplicationOp::ScaleOut
        } else {
            ReplicationOp::ScaleIn
        };
        group.status = ReplicationStatus::Busy;
        group.selected_node = selected_node;
        debug!("Replication {} begins {:?}", id, group.operation);
        ResponseStatus::Ok
    }

    /// Reset the group after the scheduler completed (or failed) the
    /// operation.
    pub fn finish(&mut self, id: &ReplicationId) {
        if let Some(group) = self.groups.get_mut(id) {
            debug!("Replication {} finished {:?}", id, group.operation);
            group.operation = ReplicationOp::NoOperation;
            group.status = ReplicationStatus::Ready;
            group.selected_node = None;
        }
    }

    pub fn record_replica(&mut self, id: &ReplicationId, actor: ActorId) {
        if let Some(group) = self.groups.get_mut(id) {
            group.replicas.push(actor);
        }
    }

    /// The replica scale-in removes: the most recently created one.
    pub fn newest_replica(&self, id: &ReplicationId) -> Option<ActorId> {
        self.groups.get(id).and_then(|g| g.replicas.last().copied())
    }

    pub fn drop_replica(&mut self, id: &ReplicationId, actor: &ActorId) {
        if let Some(group) = self.groups.get_mut(id) {
            group.replicas.retain(|a| a != actor);
        }
    }

    pub fn list(&self) -> Vec<ReplicationId> {
        self.groups.keys().copied().collect()
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("groups", &self.groups)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverLeader;
    impl LeaderElector for NeverLeader {
        fn is_leader(&self, _id: &ReplicationId) -> bool {
            false
        }
    }

    #[test]
    fn test_single_flight_gate() {
        let mut rm = ReplicationManager::new(Box::new(AlwaysLeader));
        let id = ReplicationId::generate();
        rm.register_group(id, ActorId::generate());

        assert_eq!(rm.request_replicate(&id, None, true), ResponseStatus::Ok);
        // second request while busy is rejected
        assert_eq!(
            rm.request_replicate(&id, None, true),
            ResponseStatus::ServiceUnavailable
        );
        rm.finish(&id);
        // gate reopens after completion
        assert_eq!(rm.request_replicate(&id, None, false), ResponseStatus::Ok);
    }

    #[test]
    fn test_invariant_busy_implies_operation() {
        let mut rm = ReplicationManager::new(Box::new(AlwaysLeader));
        let id = ReplicationId::generate();
        rm.register_group(id, ActorId::generate());
        rm.request_replicate(&id, None, true);
        let group = rm.get(&id).unwrap();
        assert_eq!(group.operation, ReplicationOp::ScaleOut);
        assert_eq!(group.status, ReplicationStatus::Busy);
    }

    #[test]
    fn test_non_leader_not_found() {
        let mut rm = ReplicationManager::new(Box::new(NeverLeader));
        let id = ReplicationId::generate();
        rm.register_group(id, ActorId::generate());
        assert_eq!(
            rm.request_replicate(&id, None, true),
            ResponseStatus::NotFound
        );
    }

    #[test]
    fn test_scale_in_picks_newest() {
        let mut rm = ReplicationManager::new(Box::new(AlwaysLeader));
        let id = ReplicationId::generate();
        rm.register_group(id, ActorId::generate());
        let r1 = ActorId::generate();
        let r2 = ActorId::generate();
        rm.record_replica(&id, r1);
        rm.record_replica(&id, r2);
        assert_eq!(rm.newest_replica(&id), Some(r2));
        rm.drop_replica(&id, &r2);
        assert_eq!(rm.newest_replica(&id), Some(r1));
    }
}

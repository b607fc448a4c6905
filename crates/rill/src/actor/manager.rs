use super::{Actor, ActorLifecycle, ActorSnapshot, ActorSpec};
use crate::errors::RuntimeError;
use crate::id::{ActorId, AppId, ReplicationId};
use crate::port::PortManager;
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

/// Owns the actors resident on this node and the per-actor migration
/// lock. Cross-node steps of the migration protocol are orchestrated by
/// the node loop; this manager guards the local state transitions.
#[derive(Debug)]
pub struct ActorManager {
    actors: HashMap<ActorId, Actor>,
    /// Per-actor migration lock: at most one MIGRATING transition in
    /// flight per actor. The value is the lifecycle to return to on
    /// rollback, and the one the snapshot carries.
    migrating: HashMap<ActorId, ActorLifecycle>,
}

impl ActorManager {
    pub fn new() -> Self {
        Self {
            actors: HashMap::new(),
            migrating: HashMap::new(),
        }
    }

    /// Instantiate a fresh actor. The caller has already created its ports
    /// through the port manager.
    pub fn create(
        &mut self,
        spec: &ActorSpec,
        ports: HashMap<String, crate::id::PortId>,
        app_id: Option<AppId>,
        replication_id: Option<ReplicationId>,
    ) -> ActorId {
        let actor = Actor {
            id: ActorId::generate(),
            actor_type: spec.actor_type.clone(),
            name: spec.name.clone(),
            lifecycle: ActorLifecycle::Enabled,
            state: spec.state.clone(),
            ports,
            app_id,
            replication_id,
        };
        let id = actor.id;
        info!("Actor {} created ({})", id, actor.actor_type);
        self.actors.insert(id, actor);
        id
    }

    /// Reconstruct a migrated actor from its validated snapshot.
    pub fn restore(
        &mut self,
        snapshot: &ActorSnapshot,
        ports: HashMap<String, crate::id::PortId>,
    ) -> Result<ActorId> {
        if self.actors.contains_key(&snapshot.actor_id) {
            return Err(RuntimeError::BadRequest(format!(
                "actor {} already resident",
                snapshot.actor_id
            )));
        }
        let actor = Actor {
            id: snapshot.actor_id,
            actor_type: snapshot.actor_type.clone(),
            name: snapshot.name.clone(),
            lifecycle: snapshot.lifecycle,
            state: snapshot.state.clone(),
            ports,
            app_id: snapshot.app_id,
            replication_id: snapshot.replication_id,
        };
        info!("Actor {} reconstructed from snapshot", actor.id);
        self.actors.insert(actor.id, actor);
        Ok(snapshot.actor_id)
    }

    pub fn get(&self, actor_id: &ActorId) -> Result<&Actor> {
        self.actors
            .get(actor_id)
            .ok_or(RuntimeError::ActorNotFound(*actor_id))
    }

    pub fn get_mut(&mut self, actor_id: &ActorId) -> Result<&mut Actor> {
        self.actors
            .get_mut(actor_id)
            .ok_or(RuntimeError::ActorNotFound(*actor_id))
    }

    pub fn contains(&self, actor_id: &ActorId) -> bool {
        self.actors.contains_key(actor_id)
    }

    pub fn list(&self) -> Vec<ActorId> {
        self.actors.keys().copied().collect()
    }

    /// Enabled actors eligible for execution turns.
    pub fn enabled(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self
            .actors
            .values()
            .filter(|a| a.is_enabled())
            .map(|a| a.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn enable(&mut self, actor_id: &ActorId) -> Result<()> {
        let actor = self.get_mut(actor_id)?;
        if actor.lifecycle == ActorLifecycle::Migrating {
            return Err(RuntimeError::MigrationInFlight(*actor_id));
        }
        actor.lifecycle = ActorLifecycle::Enabled;
        Ok(())
    }

    pub fn disable(&mut self, actor_id: &ActorId) -> Result<()> {
        let actor = self.get_mut(actor_id)?;
        if actor.lifecycle == ActorLifecycle::Migrating {
            return Err(RuntimeError::MigrationInFlight(*actor_id));
        }
        actor.lifecycle = ActorLifecycle::Disabled;
        Ok(())
    }

    /// Take the migration lock and enter MIGRATING. A second concurrent
    /// request fails here and is reported SERVICE_UNAVAILABLE.
    pub fn begin_migration(&mut self, actor_id: &ActorId) -> Result<()> {
        if self.migrating.contains_key(actor_id) {
            return Err(RuntimeError::MigrationInFlight(*actor_id));
        }
        let actor = self.get_mut(actor_id)?;
        if actor.lifecycle == ActorLifecycle::Migrating {
            return Err(RuntimeError::MigrationInFlight(*actor_id));
        }
        let prior = actor.lifecycle;
        actor.lifecycle = ActorLifecycle::Migrating;
        self.migrating.insert(*actor_id, prior);
        debug!("Actor {} entering MIGRATING", actor_id);
        Ok(())
    }

    /// Roll back a failed migration: the actor returns to its prior
    /// lifecycle with unchanged state.
    pub fn abort_migration(&mut self, actor_id: &ActorId) {
        let prior = self
            .migrating
            .remove(actor_id)
            .unwrap_or(ActorLifecycle::Enabled);
        if let Some(actor) = self.actors.get_mut(actor_id) {
            actor.lifecycle = prior;
            debug!("Actor {} migration aborted, back to {:?}", actor_id, prior);
        }
    }

    /// Finish a successful migration: the local copy is destroyed.
    pub fn complete_migration(&mut self, actor_id: &ActorId) -> Option<Actor> {
        self.migrating.remove(actor_id);
        let removed = self.actors.remove(actor_id);
        if removed.is_some() {
            info!("Actor {} migrated away, local copy destroyed", actor_id);
        }
        removed
    }

    pub fn is_migrating(&self, actor_id: &ActorId) -> bool {
        self.migrating.contains_key(actor_id)
    }

    pub fn remove(&mut self, actor_id: &ActorId) -> Result<Actor> {
        if self.migrating.contains_key(actor_id) {
            return Err(RuntimeError::MigrationInFlight(*actor_id));
        }
        self.actors
            .remove(actor_id)
            .ok_or(RuntimeError::ActorNotFound(*actor_id))
    }

    /// Capture the actor's managed state and port-connection graph for
    /// transfer.
    pub fn snapshot(&self, actor_id: &ActorId, pm: &PortManager) -> Result<ActorSnapshot> {
        let actor = self.get(actor_id)?;
        // A migrating actor carries its pre-migration lifecycle, so the
        // destination resumes ENABLED or DISABLED as the actor was.
        let lifecycle = self
            .migrating
            .get(actor_id)
            .copied()
            .unwrap_or(actor.lifecycle);
        let snapshot = ActorSnapshot {
            actor_id: actor.id,
            actor_type: actor.actor_type.clone(),
            name: actor.name.clone(),
            lifecycle,
            app_id: actor.app_id,
            replication_id: actor.replication_id,
            state: actor.state.clone(),
            ports: pm.snapshot_actor(actor_id),
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Control-API report: identity, lifecycle, state, and port states.
    pub fn report(&self, actor_id: &ActorId, pm: &PortManager) -> Result<Value> {
        let actor = self.get(actor_id)?;
        let ports: Vec<Value> = pm
            .ports_of(actor_id)
            .iter()
            .filter_map(|id| pm.port_state(id).ok())
            .collect();
        Ok(serde_json::json!({
            "id": actor.id,
            "type": actor.actor_type,
            "name": actor.name,
            "lifecycle": actor.lifecycle,
            "state": actor.state.to_json(),
            "app_id": actor.app_id,
            "replication_id": actor.replication_id,
            "ports": ports,
        }))
    }
}

impl Default for ActorManager {
    fn default() -> Self {
        Self::new()
    }
}

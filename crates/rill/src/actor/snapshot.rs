use super::ActorLifecycle;
use crate::errors::RuntimeError;
use crate::id::{ActorId, AppId, ReplicationId};
use crate::port::PortSnapshot;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// An actor's managed state: an explicit, ordered list of named fields.
/// Ordering is part of the contract and is validated when an actor is
/// reconstructed on another node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagedState {
    fields: Vec<StateField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateField {
    pub name: String,
    pub value: Value,
}

impl ManagedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object, ordering fields by name so the result is
    /// deterministic regardless of how the object was assembled.
    pub fn from_args(args: &Value) -> Result<Self> {
        let obj = args
            .as_object()
            .ok_or_else(|| RuntimeError::BadRequest("actor args must be an object".into()))?;
        let mut names: Vec<&String> = obj.keys().collect();
        names.sort();
        let fields = names
            .into_iter()
            .map(|name| StateField {
                name: name.clone(),
                value: obj[name].clone(),
            })
            .collect();
        Ok(Self { fields })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Replace an existing field in place, or append a new one.
    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(field) = self.fields.iter_mut().find(|f| f.name == name) {
            field.value = value;
        } else {
            self.fields.push(StateField {
                name: name.to_string(),
                value,
            });
        }
    }

    pub fn fields(&self) -> &[StateField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names must be unique and non-empty for the snapshot to be
    /// reconstructible.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(RuntimeError::InvalidSnapshot(
                    "empty state field name".into(),
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(RuntimeError::InvalidSnapshot(format!(
                    "duplicate state field: {}",
                    field.name
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for field in &self.fields {
            obj.insert(field.name.clone(), field.value.clone());
        }
        Value::Object(obj)
    }
}

/// Everything needed to reconstruct an actor on another node. Port ids are
/// preserved so peer references remain valid after the move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorSnapshot {
    pub actor_id: ActorId,
    pub actor_type: String,
    pub name: String,
    /// Lifecycle the actor resumes with; never `Migrating`.
    pub lifecycle: ActorLifecycle,
    pub app_id: Option<AppId>,
    pub replication_id: Option<ReplicationId>,
    pub state: ManagedState,
    pub ports: Vec<PortSnapshot>,
}

impl ActorSnapshot {
    /// Validate before reconstruction; a bad snapshot must fail the
    /// transfer rather than instantiate a broken actor.
    pub fn validate(&self) -> Result<()> {
        if self.lifecycle == ActorLifecycle::Migrating {
            return Err(RuntimeError::InvalidSnapshot(
                "transient MIGRATING lifecycle in snapshot".into(),
            ));
        }
        self.state.validate()?;
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for port in &self.ports {
            if !names.insert(port.name.as_str()) {
                return Err(RuntimeError::InvalidSnapshot(format!(
                    "duplicate port name: {}",
                    port.name
                )));
            }
            if !ids.insert(port.id) {
                return Err(RuntimeError::InvalidSnapshot(format!(
                    "duplicate port id: {}",
                    port.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_from_args_is_ordered() {
        let a = ManagedState::from_args(&json!({"b": 2, "a": 1})).unwrap();
        let b = ManagedState::from_args(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fields()[0].name, "a");
        assert_eq!(a.fields()[1].name, "b");
    }

    #[test]
    fn test_set_preserves_order() {
        let mut state = ManagedState::from_args(&json!({"a": 1, "b": 2})).unwrap();
        state.set("a", json!(10));
        assert_eq!(state.fields()[0].name, "a");
        assert_eq!(state.get("a"), Some(&json!(10)));
        state.set("c", json!(3));
        assert_eq!(state.fields()[2].name, "c");
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let state = ManagedState {
            fields: vec![
                StateField {
                    name: "x".into(),
                    value: json!(1),
                },
                StateField {
                    name: "x".into(),
                    value: json!(2),
                },
            ],
        };
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let state = ManagedState::from_args(&json!({"count": 7})).unwrap();
        let snapshot = ActorSnapshot {
            actor_id: ActorId::generate(),
            actor_type: "std.Counter".into(),
            name: "counter".into(),
            lifecycle: ActorLifecycle::Disabled,
            app_id: None,
            replication_id: None,
            state,
            ports: Vec::new(),
        };
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let back: ActorSnapshot = serde_json::from_slice(&bytes).unwrap();
        back.validate().unwrap();
        assert_eq!(back.state, snapshot.state);
        assert_eq!(back.lifecycle, ActorLifecycle::Disabled);
    }

    #[test]
    fn test_validate_rejects_migrating_lifecycle() {
        let snapshot = ActorSnapshot {
            actor_id: ActorId::generate(),
            actor_type: "std.Counter".into(),
            name: "counter".into(),
            lifecycle: ActorLifecycle::Migrating,
            app_id: None,
            replication_id: None,
            state: ManagedState::new(),
            ports: Vec::new(),
        };
        assert!(snapshot.validate().is_err());
    }
}

use super::{IndexKey, RegistryOp, RegistryReply};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// In-memory storage backend: per-key last-writer-wins values plus
/// commutative indexed sets.
#[derive(Debug, Default)]
pub struct LocalStore {
    values: HashMap<String, Value>,
    index: HashMap<IndexKey, BTreeSet<String>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    pub fn set(&mut self, key: String, value: Value) {
        self.values.insert(key, value);
    }

    pub fn delete(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Idempotent: adding a value twice leaves one entry.
    pub fn add_index(&mut self, index: IndexKey, value: String) {
        self.index.entry(index).or_default().insert(value);
    }

    /// Idempotent: removing an absent value is a no-op.
    pub fn remove_index(&mut self, index: &IndexKey, value: &str) {
        if let Some(set) = self.index.get_mut(index) {
            set.remove(value);
            if set.is_empty() {
                self.index.remove(index);
            }
        }
    }

    pub fn get_index(&self, index: &IndexKey) -> Vec<String> {
        self.index
            .get(index)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply one operation, local or forwarded from a proxy client.
    pub fn apply(&mut self, op: RegistryOp) -> RegistryReply {
        debug!("Registry op: {}", op.to_log());
        match op {
            RegistryOp::Get { key } => RegistryReply::Value(self.get(&key)),
            RegistryOp::Set { key, value } => {
                self.set(key, value);
                RegistryReply::Done
            }
            RegistryOp::Delete { key } => {
                self.delete(&key);
                RegistryReply::Done
            }
            RegistryOp::AddIndex { index, value } => {
                self.add_index(index, value);
                RegistryReply::Done
            }
            RegistryOp::RemoveIndex { index, value } => {
                self.remove_index(&index, &value);
                RegistryReply::Done
            }
            RegistryOp::GetIndex { index } => RegistryReply::Values(self.get_index(&index)),
        }
    }
}

//! The (alias → public key) store.

use keygrid_types::Operation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("key already exists for alias {0}")]
    AliasExists(String),
    #[error("no key exists for alias {0}")]
    UnknownAlias(String),
    #[error("snapshot codec failure: {0}")]
    Snapshot(String),
    #[error("lookups are not applied")]
    NotAMutation,
}

/// Alias → key bindings.
///
/// A `BTreeMap` keeps snapshots byte-identical across replicas holding the
/// same bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keystore {
    bindings: BTreeMap<String, String>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with initial bindings.
    pub fn with_bindings(bindings: BTreeMap<String, String>) -> Self {
        Self { bindings }
    }

    /// Bind a new alias; fails if it already exists.
    pub fn create(&mut self, alias: &str, key: &str) -> Result<(), StoreError> {
        if self.bindings.contains_key(alias) {
            return Err(StoreError::AliasExists(alias.to_string()));
        }
        self.bindings.insert(alias.to_string(), key.to_string());
        Ok(())
    }

    /// Replace an existing binding; fails if absent.
    pub fn update(&mut self, alias: &str, key: &str) -> Result<(), StoreError> {
        match self.bindings.get_mut(alias) {
            Some(existing) => {
                *existing = key.to_string();
                Ok(())
            }
            None => Err(StoreError::UnknownAlias(alias.to_string())),
        }
    }

    /// Read a binding.
    pub fn lookup(&self, alias: &str) -> Option<&str> {
        self.bindings.get(alias).map(String::as_str)
    }

    /// Apply a committed mutation.
    pub fn apply(&mut self, operation: &Operation) -> Result<(), StoreError> {
        match operation {
            Operation::Create { alias, key } => self.create(alias, key),
            Operation::Update { alias, key } => self.update(alias, key),
            Operation::Lookup { .. } => Err(StoreError::NotAMutation),
        }
    }

    /// Serialize the full store for state transfer.
    pub fn snapshot(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Snapshot(e.to_string()))
    }

    /// Replace the store contents with a transferred snapshot.
    pub fn install_snapshot(&mut self, snapshot: &str) -> Result<(), StoreError> {
        let restored: Keystore =
            serde_json::from_str(snapshot).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        *self = restored;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_lookup() {
        let mut store = Keystore::new();
        store.create("alice", "keyA").unwrap();
        assert_eq!(store.lookup("alice"), Some("keyA"));
        assert_eq!(store.lookup("bob"), None);
    }

    #[test]
    fn create_rejects_existing_alias() {
        let mut store = Keystore::new();
        store.create("alice", "keyA").unwrap();
        assert_eq!(
            store.create("alice", "keyB"),
            Err(StoreError::AliasExists("alice".into()))
        );
        assert_eq!(store.lookup("alice"), Some("keyA"));
    }

    #[test]
    fn update_requires_existing_alias() {
        let mut store = Keystore::new();
        assert_eq!(
            store.update("alice", "keyA"),
            Err(StoreError::UnknownAlias("alice".into()))
        );
        store.create("alice", "keyA").unwrap();
        store.update("alice", "keyA2").unwrap();
        assert_eq!(store.lookup("alice"), Some("keyA2"));
    }

    #[test]
    fn apply_routes_mutations() {
        let mut store = Keystore::new();
        store
            .apply(&Operation::Create {
                alias: "alice".into(),
                key: "keyA".into(),
            })
            .unwrap();
        store
            .apply(&Operation::Update {
                alias: "alice".into(),
                key: "keyA2".into(),
            })
            .unwrap();
        assert_eq!(store.lookup("alice"), Some("keyA2"));
        assert_eq!(
            store.apply(&Operation::Lookup {
                alias: "alice".into()
            }),
            Err(StoreError::NotAMutation)
        );
    }

    #[test]
    fn snapshot_round_trip() {
        let mut store = Keystore::new();
        store.create("alice", "keyA").unwrap();
        store.create("bob", "keyB").unwrap();
        let snapshot = store.snapshot().unwrap();

        let mut restored = Keystore::new();
        restored.create("stale", "key").unwrap();
        restored.install_snapshot(&snapshot).unwrap();
        assert_eq!(restored.lookup("alice"), Some("keyA"));
        assert_eq!(restored.lookup("bob"), Some("keyB"));
        assert_eq!(restored.lookup("stale"), None);
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn snapshots_are_deterministic() {
        let mut a = Keystore::new();
        a.create("bob", "keyB").unwrap();
        a.create("alice", "keyA").unwrap();

        let mut b = Keystore::new();
        b.create("alice", "keyA").unwrap();
        b.create("bob", "keyB").unwrap();

        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }
}

//! Persistence boundary.
//!
//! The relational store is an external collaborator; this trait is its full
//! contract. Records cross the boundary as JSON documents keyed by the
//! store-assigned id, mirroring a generic table/row access layer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::types::{EntityId, EntityKind};

/// Errors from the persistence boundary.
///
/// Any error here means the enclosing operation must abort: the in-memory
/// registry is only updated after the store write succeeded.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with this id in the given table.
    #[error("{kind} record {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    /// Backend failure (connection, constraint, serialization on the far side).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Contract of the persistent store.
///
/// Implementations assign ids on `insert` and must materialise the assigned
/// id into the stored record's `id` field so that `load` round-trips.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch every record of a kind, keyed by id. Called once at startup.
    async fn load(&self, kind: EntityKind) -> Result<Vec<(EntityId, Value)>, StoreError>;

    /// Insert a record and return the assigned id.
    async fn insert(&self, kind: EntityKind, record: Value) -> Result<EntityId, StoreError>;

    /// Replace the record with the given id.
    async fn update(&self, kind: EntityKind, id: EntityId, record: Value)
    -> Result<(), StoreError>;

    /// Delete the record with the given id.
    async fn remove(&self, kind: EntityKind, id: EntityId) -> Result<(), StoreError>;
}

/// In-process store with monotonically assigned ids.
///
/// Default backing for the binary and for tests; a relational implementation
/// lives outside this crate behind the same trait.
#[derive(Debug, Default)]
pub struct MemStore {
    tables: Mutex<HashMap<EntityKind, BTreeMap<EntityId, Value>>>,
    next_id: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn with_tables<R>(
        &self,
        f: impl FnOnce(&mut HashMap<EntityKind, BTreeMap<EntityId, Value>>) -> R,
    ) -> Result<R, StoreError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;
        Ok(f(&mut tables))
    }
}

#[async_trait]
impl Store for MemStore {
    async fn load(&self, kind: EntityKind) -> Result<Vec<(EntityId, Value)>, StoreError> {
        self.with_tables(|tables| {
            tables
                .get(&kind)
                .map(|rows| rows.iter().map(|(id, v)| (*id, v.clone())).collect())
                .unwrap_or_default()
        })
    }

    async fn insert(&self, kind: EntityKind, mut record: Value) -> Result<EntityId, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(object) = record.as_object_mut() {
            object.insert("id".to_string(), Value::from(id));
        }
        self.with_tables(|tables| {
            tables.entry(kind).or_default().insert(id, record);
        })?;
        Ok(id)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: EntityId,
        record: Value,
    ) -> Result<(), StoreError> {
        self.with_tables(|tables| {
            let rows = tables.entry(kind).or_default();
            if let std::collections::btree_map::Entry::Occupied(mut entry) = rows.entry(id) {
                entry.insert(record);
                Ok(())
            } else {
                Err(StoreError::NotFound { kind, id })
            }
        })?
    }

    async fn remove(&self, kind: EntityKind, id: EntityId) -> Result<(), StoreError> {
        self.with_tables(|tables| {
            tables
                .entry(kind)
                .or_default()
                .remove(&id)
                .map(|_| ())
                .ok_or(StoreError::NotFound { kind, id })
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_and_materialises_id() {
        let store = MemStore::new();
        let id = store
            .insert(EntityKind::Credential, json!({"name": "a"}))
            .await
            .unwrap();
        assert_eq!(id, 1);

        let rows = store.load(EntityKind::Credential).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1["id"], json!(1));
    }

    #[tokio::test]
    async fn test_ids_monotonic_across_kinds() {
        let store = MemStore::new();
        let a = store.insert(EntityKind::Device, json!({})).await.unwrap();
        let b = store.insert(EntityKind::Metric, json!({})).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemStore::new();
        let err = store
            .update(EntityKind::Discovery, 42, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotFound {
                kind: EntityKind::Discovery,
                id: 42
            }
        ));
    }

    #[tokio::test]
    async fn test_remove_roundtrip() {
        let store = MemStore::new();
        let id = store.insert(EntityKind::Device, json!({})).await.unwrap();
        store.remove(EntityKind::Device, id).await.unwrap();
        assert!(store.load(EntityKind::Device).await.unwrap().is_empty());
        assert!(store.remove(EntityKind::Device, id).await.is_err());
    }
}

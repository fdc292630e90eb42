//! Row storage behind the coordinator: the store trait, the in-memory and
//! durable implementations, and the coordinator that routes entities to
//! mounted stores.

pub mod coordinator;
pub mod durable;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    EntitySchema, ObjectData, ObjectId, ObjectKey, SchemaFingerprint, StoreError, Value,
};

pub use coordinator::{CoordinatorStats, MountOptions, StoreCoordinator};
pub use durable::DurableStore;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage flavor of one mounted configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKind {
    Memory,
    Durable,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Durable => write!(f, "durable"),
        }
    }
}

/// Bookkeeping persisted alongside the rows. The fingerprint identifies the
/// schema generation the store was written with; the key counter survives
/// restarts so permanent identities are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub fingerprint: SchemaFingerprint,
    pub next_key: u64,
}

pub const STORE_FORMAT_VERSION: u32 = 1;

impl StoreMetadata {
    pub fn new(fingerprint: SchemaFingerprint) -> Self {
        Self {
            version: STORE_FORMAT_VERSION,
            created_at: Utc::now(),
            fingerprint,
            next_key: 1,
        }
    }
}

/// One committed transaction's worth of row changes, keyed by object
/// identity. Produced by a context graph, rewritten to permanent identities
/// by the coordinator, then applied to the owning stores.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub inserts: Vec<(ObjectId, ObjectData)>,
    pub updates: Vec<(ObjectId, ObjectData)>,
    pub deletes: Vec<ObjectId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Identities that still need a permanent key before this set can reach
    /// a store.
    pub fn temporary_ids(&self) -> Vec<ObjectId> {
        self.inserts
            .iter()
            .map(|(id, _)| id)
            .chain(self.updates.iter().map(|(id, _)| id))
            .filter(|id| id.is_temporary())
            .cloned()
            .collect()
    }

    /// Rewrite temporary identities to their permanent replacements, both as
    /// row keys and inside `Reference` values.
    pub fn remap(&mut self, mapping: &HashMap<ObjectId, ObjectId>) {
        if mapping.is_empty() {
            return;
        }
        let remap_id = |id: &mut ObjectId| {
            if let Some(permanent) = mapping.get(id) {
                *id = permanent.clone();
            }
        };
        let remap_data = |data: &mut ObjectData| {
            for value in data.values_mut() {
                if let Value::Reference(target) = value
                    && let Some(permanent) = mapping.get(target)
                {
                    *target = permanent.clone();
                }
            }
        };
        for (id, data) in &mut self.inserts {
            remap_id(id);
            remap_data(data);
        }
        for (id, data) in &mut self.updates {
            remap_id(id);
            remap_data(data);
        }
        for id in &mut self.deletes {
            remap_id(id);
        }
    }
}

/// Row store behind one mounted configuration. Implementations are plain
/// synchronous containers; the coordinator owns locking and routing.
pub trait ObjectStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    fn metadata(&self) -> &StoreMetadata;

    /// Hand out `count` fresh permanent keys and return the first.
    fn reserve_keys(&mut self, count: u64) -> StoreResult<u64>;

    /// All rows of one concrete entity, in key order.
    fn rows(&self, entity: &str) -> Vec<(u64, ObjectData)>;

    fn get(&self, entity: &str, key: u64) -> Option<ObjectData>;

    /// Apply a change set whose identities are all permanent. Inserts and
    /// updates are upserts; deleting an absent row is a no-op, so re-applying
    /// a set is harmless.
    fn apply(&mut self, changes: &ChangeSet) -> StoreResult<()>;

    /// Replace one row wholesale, bypassing the change-set path. Used by
    /// store-level batch mutations.
    fn put(&mut self, entity: &str, key: u64, data: ObjectData);

    fn remove(&mut self, entity: &str, key: u64) -> bool;

    /// Make the current contents durable. No-op for memory stores.
    fn flush(&mut self) -> StoreResult<()>;

    /// Drop all rows and any backing file.
    fn destroy(&mut self) -> StoreResult<()>;

    fn row_count(&self) -> usize;
}

/// Combined fingerprint over every schema mounted into one configuration.
pub(crate) fn schema_fingerprint(
    schemas: &HashMap<String, Arc<EntitySchema>>,
) -> SchemaFingerprint {
    let refs: Vec<&EntitySchema> = schemas.values().map(Arc::as_ref).collect();
    SchemaFingerprint::of(&refs)
}

pub(crate) fn permanent_key(id: &ObjectId) -> StoreResult<u64> {
    match id.key() {
        ObjectKey::Permanent(key) => Ok(key),
        ObjectKey::Temporary(_) => Err(StoreError::Corrupt(format!(
            "temporary identity {} reached a store",
            id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changeset_remap_rewrites_keys_and_references() {
        let temp_a = ObjectId::temporary("Item");
        let temp_b = ObjectId::temporary("Item");
        let mut data = ObjectData::new();
        data.insert("peer".into(), Value::Reference(temp_b.clone()));

        let mut changes = ChangeSet {
            inserts: vec![(temp_a.clone(), data), (temp_b.clone(), ObjectData::new())],
            updates: Vec::new(),
            deletes: Vec::new(),
        };
        assert_eq!(changes.temporary_ids().len(), 2);

        let mut mapping = HashMap::new();
        mapping.insert(temp_a.clone(), ObjectId::permanent("Item", 1));
        mapping.insert(temp_b.clone(), ObjectId::permanent("Item", 2));
        changes.remap(&mapping);

        assert_eq!(changes.inserts[0].0, ObjectId::permanent("Item", 1));
        assert_eq!(
            changes.inserts[0].1.get("peer"),
            Some(&Value::Reference(ObjectId::permanent("Item", 2)))
        );
        assert!(changes.temporary_ids().is_empty());
    }

    #[test]
    fn test_permanent_key_rejects_temporary() {
        assert!(permanent_key(&ObjectId::temporary("Item")).is_err());
        assert_eq!(permanent_key(&ObjectId::permanent("Item", 7)).unwrap(), 7);
    }
}

use std::collections::{BTreeMap, HashMap};

use crate::core::{ObjectData, SchemaFingerprint};
use crate::storage::{
    ChangeSet, ObjectStore, StoreKind, StoreMetadata, StoreResult, permanent_key,
};

/// Volatile store: rows live in nested maps and vanish with the process.
/// The inner `BTreeMap` keeps rows in key order so scans are deterministic.
#[derive(Debug)]
pub struct MemoryStore {
    metadata: StoreMetadata,
    rows: HashMap<String, BTreeMap<u64, ObjectData>>,
}

impl MemoryStore {
    pub fn new(fingerprint: SchemaFingerprint) -> Self {
        Self {
            metadata: StoreMetadata::new(fingerprint),
            rows: HashMap::new(),
        }
    }

    pub(crate) fn from_parts(
        metadata: StoreMetadata,
        rows: HashMap<String, BTreeMap<u64, ObjectData>>,
    ) -> Self {
        Self { metadata, rows }
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut StoreMetadata {
        &mut self.metadata
    }

    pub(crate) fn all_rows(&self) -> &HashMap<String, BTreeMap<u64, ObjectData>> {
        &self.rows
    }
}

impl ObjectStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    fn reserve_keys(&mut self, count: u64) -> StoreResult<u64> {
        let first = self.metadata.next_key;
        self.metadata.next_key += count;
        Ok(first)
    }

    fn rows(&self, entity: &str) -> Vec<(u64, ObjectData)> {
        match self.rows.get(entity) {
            Some(rows) => rows.iter().map(|(k, v)| (*k, v.clone())).collect(),
            None => Vec::new(),
        }
    }

    fn get(&self, entity: &str, key: u64) -> Option<ObjectData> {
        self.rows.get(entity)?.get(&key).cloned()
    }

    fn apply(&mut self, changes: &ChangeSet) -> StoreResult<()> {
        for (id, data) in changes.inserts.iter().chain(changes.updates.iter()) {
            let key = permanent_key(id)?;
            self.rows
                .entry(id.entity().to_string())
                .or_default()
                .insert(key, data.clone());
        }
        for id in &changes.deletes {
            let key = permanent_key(id)?;
            if let Some(rows) = self.rows.get_mut(id.entity()) {
                rows.remove(&key);
            }
        }
        Ok(())
    }

    fn put(&mut self, entity: &str, key: u64, data: ObjectData) {
        self.rows.entry(entity.to_string()).or_default().insert(key, data);
    }

    fn remove(&mut self, entity: &str, key: u64) -> bool {
        self.rows
            .get_mut(entity)
            .map(|rows| rows.remove(&key).is_some())
            .unwrap_or(false)
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn destroy(&mut self) -> StoreResult<()> {
        self.rows.clear();
        Ok(())
    }

    fn row_count(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{ObjectData, ObjectId, Result, StackError, Value};
use crate::storage::ChangeSet;

/// Shared handle to one context's graph. Sections are short and never held
/// across awaits; a poisoned lock recovers to the inner value.
#[derive(Clone, Default)]
pub struct SharedGraph(Arc<Mutex<Graph>>);

impl SharedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Graph> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One context's view of the object graph: materialized rows plus the
/// pending changes recorded against them since the last save.
///
/// Writes go through the owning context's lane; the graph itself is a plain
/// container guarded by a short `std::sync::Mutex` section at the call site
/// so the save cascade can touch a parent graph from a child's lane.
#[derive(Default)]
pub struct Graph {
    rows: HashMap<ObjectId, ObjectData>,
    inserted: HashSet<ObjectId>,
    dirty: HashSet<ObjectId>,
    deleted: HashSet<ObjectId>,
    /// Temporary identity -> permanent identity, kept after saves so handles
    /// created before the save keep resolving.
    aliases: HashMap<ObjectId, ObjectId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical identity: follows the temporary-to-permanent alias if one
    /// was recorded by an earlier save.
    pub fn resolve(&self, id: &ObjectId) -> ObjectId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    pub fn create(&mut self, entity: &str) -> ObjectId {
        let id = ObjectId::temporary(entity);
        self.rows.insert(id.clone(), ObjectData::new());
        self.inserted.insert(id.clone());
        id
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        let id = self.resolve(id);
        self.rows.contains_key(&id) && !self.deleted.contains(&id)
    }

    pub fn is_deleted(&self, id: &ObjectId) -> bool {
        self.deleted.contains(&self.resolve(id))
    }

    pub fn data(&self, id: &ObjectId) -> Option<ObjectData> {
        let id = self.resolve(id);
        if self.deleted.contains(&id) {
            return None;
        }
        self.rows.get(&id).cloned()
    }

    pub fn value(&self, id: &ObjectId, key: &str) -> Option<Value> {
        let id = self.resolve(id);
        if self.deleted.contains(&id) {
            return None;
        }
        self.rows.get(&id)?.get(key).cloned()
    }

    /// Record a pending attribute write. No validation happens here; bad
    /// values surface at save time as store validation errors.
    pub fn set_value(&mut self, id: &ObjectId, key: &str, value: Value) -> Result<()> {
        let id = self.resolve(id);
        if self.deleted.contains(&id) {
            return Err(StackError::NotFound(format!(
                "{} was deleted in this context",
                id
            )));
        }
        let Some(row) = self.rows.get_mut(&id) else {
            return Err(StackError::NotFound(format!(
                "{} is not materialized in this context",
                id
            )));
        };
        row.insert(key.to_string(), value);
        if !self.inserted.contains(&id) {
            self.dirty.insert(id);
        }
        Ok(())
    }

    /// Mark an object for deletion. An object inserted in this context and
    /// never saved just vanishes; anything else becomes a pending delete,
    /// materialized or not.
    pub fn delete(&mut self, id: &ObjectId) {
        let id = self.resolve(id);
        if self.inserted.remove(&id) {
            self.rows.remove(&id);
            return;
        }
        self.rows.remove(&id);
        self.dirty.remove(&id);
        self.deleted.insert(id);
    }

    /// Register a committed row fetched from below. A row with pending local
    /// changes keeps its local version.
    pub fn materialize(&mut self, id: &ObjectId, data: ObjectData) {
        let id = self.resolve(id);
        if self.inserted.contains(&id) || self.dirty.contains(&id) || self.deleted.contains(&id) {
            return;
        }
        self.rows.insert(id, data);
    }

    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.dirty.is_empty() || !self.deleted.is_empty()
    }

    /// Snapshot of the pending changes. Non-draining: the caller clears via
    /// `clear_pending` once the changes have safely landed one level down.
    pub fn pending_changes(&self) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for id in &self.inserted {
            if let Some(data) = self.rows.get(id) {
                changes.inserts.push((id.clone(), data.clone()));
            }
        }
        for id in &self.dirty {
            if let Some(data) = self.rows.get(id) {
                changes.updates.push((id.clone(), data.clone()));
            }
        }
        changes.deletes = self.deleted.iter().cloned().collect();
        changes
    }

    pub fn clear_pending(&mut self) {
        self.inserted.clear();
        self.dirty.clear();
        self.deleted.clear();
    }

    /// Rollback primitive: unsaved inserts vanish, while modified and
    /// deleted rows snap back to the committed data in `restored`. Rows
    /// with no committed counterpart are dropped.
    pub fn discard_pending(&mut self, restored: &HashMap<ObjectId, ObjectData>) {
        for id in std::mem::take(&mut self.inserted) {
            self.rows.remove(&id);
        }
        for id in std::mem::take(&mut self.dirty) {
            match restored.get(&id) {
                Some(data) => {
                    self.rows.insert(id, data.clone());
                }
                None => {
                    self.rows.remove(&id);
                }
            }
        }
        for id in std::mem::take(&mut self.deleted) {
            if let Some(data) = restored.get(&id) {
                self.rows.insert(id, data.clone());
            }
        }
    }

    /// Rewrite temporary identities to store-assigned permanent ones, in row
    /// keys, pending sets, and `Reference` values alike. Old identities stay
    /// resolvable through the alias table.
    pub fn apply_id_mapping(&mut self, mapping: &HashMap<ObjectId, ObjectId>) {
        if mapping.is_empty() {
            return;
        }
        for (temporary, permanent) in mapping {
            if let Some(data) = self.rows.remove(temporary) {
                self.rows.insert(permanent.clone(), data);
            }
            if self.inserted.remove(temporary) {
                self.inserted.insert(permanent.clone());
            }
            if self.dirty.remove(temporary) {
                self.dirty.insert(permanent.clone());
            }
            if self.deleted.remove(temporary) {
                self.deleted.insert(permanent.clone());
            }
            self.aliases.insert(temporary.clone(), permanent.clone());
        }
        for data in self.rows.values_mut() {
            for value in data.values_mut() {
                if let Value::Reference(target) = value
                    && let Some(permanent) = mapping.get(target)
                {
                    *target = permanent.clone();
                }
            }
        }
    }

    /// Take a child context's committed change set on board as this
    /// context's own pending changes, ready for the next hop of the cascade.
    pub fn merge_pending(&mut self, changes: &ChangeSet) {
        for (id, data) in &changes.inserts {
            let was_deleted = self.deleted.remove(id);
            let existed = self.rows.insert(id.clone(), data.clone()).is_some();
            if was_deleted || existed {
                self.dirty.insert(id.clone());
            } else {
                self.inserted.insert(id.clone());
            }
        }
        for (id, data) in &changes.updates {
            self.deleted.remove(id);
            self.rows.insert(id.clone(), data.clone());
            if !self.inserted.contains(id) {
                self.dirty.insert(id.clone());
            }
        }
        for id in &changes.deletes {
            if self.inserted.remove(id) {
                self.rows.remove(id);
                continue;
            }
            self.rows.remove(id);
            self.dirty.remove(id);
            self.deleted.insert(id.clone());
        }
    }

    /// Fold committed changes from elsewhere into this context's view as
    /// already-saved state. Upserts are idempotent, so overlapping
    /// propagation paths converge on the same rows.
    pub fn merge_committed(&mut self, changes: &ChangeSet) {
        for (id, data) in changes.inserts.iter().chain(changes.updates.iter()) {
            self.rows.insert(id.clone(), data.clone());
        }
        for id in &changes.deletes {
            self.rows.remove(id);
            self.inserted.remove(id);
            self.dirty.remove(id);
            self.deleted.remove(id);
        }
    }

    /// Drop materialized rows of the given entities unless they carry
    /// pending changes. Used after store-level batch mutations, which bypass
    /// contexts and leave cached rows stale.
    pub fn invalidate_entities(&mut self, entities: &HashSet<String>) {
        let inserted = &self.inserted;
        let dirty = &self.dirty;
        self.rows.retain(|id, _| {
            !entities.contains(id.entity()) || inserted.contains(id) || dirty.contains(id)
        });
    }

    /// All live rows whose entity is in the given set, pending state
    /// included.
    pub fn rows_of(&self, entities: &HashSet<String>) -> Vec<(ObjectId, ObjectData)> {
        self.rows
            .iter()
            .filter(|(id, _)| entities.contains(id.entity()) && !self.deleted.contains(*id))
            .map(|(id, data)| (id.clone(), data.clone()))
            .collect()
    }

    /// Identities deleted in this context but not yet saved, restricted to
    /// the given entity set.
    pub fn deleted_ids(&self, entities: &HashSet<String>) -> Vec<ObjectId> {
        self.deleted
            .iter()
            .filter(|id| entities.contains(id.entity()))
            .cloned()
            .collect()
    }

    /// Identities created in this context that have not reached a store yet.
    pub fn pending_insert_ids(&self, entities: &HashSet<String>) -> HashSet<ObjectId> {
        self.inserted
            .iter()
            .filter(|id| entities.contains(id.entity()))
            .cloned()
            .collect()
    }

    pub fn reset(&mut self) {
        self.rows.clear();
        self.clear_pending();
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

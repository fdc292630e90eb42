use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{EntitySchema, ObjectData, StoreError, effective_schema};
use crate::storage::{
    ChangeSet, MemoryStore, ObjectStore, STORE_FORMAT_VERSION, StoreKind, StoreMetadata,
    StoreResult, schema_fingerprint,
};

/// On-disk image of a durable store: metadata plus every row, serialized
/// with MessagePack.
#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    metadata: StoreMetadata,
    rows: HashMap<String, BTreeMap<u64, ObjectData>>,
}

/// File-backed store. Rows live in memory; `flush` rewrites the whole
/// snapshot through a temp file and an atomic rename, so the file on disk is
/// always a complete image of some committed state.
#[derive(Debug)]
pub struct DurableStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl DurableStore {
    /// Open or create the store file for the given schema set.
    ///
    /// A file written under a different schema generation is rejected with
    /// `SchemaMismatch` unless `auto_migrate` is set, in which case a
    /// lightweight migration runs: rows of removed entities and values of
    /// removed attributes are dropped, new optional attributes simply read
    /// as NULL. A new required attribute or a changed attribute type cannot
    /// be migrated and fails with `SchemaMismatch` as well.
    pub fn open(
        path: impl AsRef<Path>,
        schemas: &HashMap<String, Arc<EntitySchema>>,
        auto_migrate: bool,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let fingerprint = schema_fingerprint(schemas);

        if !path.exists() {
            debug!(path = %path.display(), %fingerprint, "creating durable store");
            let mut store = Self {
                path,
                inner: MemoryStore::new(fingerprint),
            };
            store.flush()?;
            return Ok(store);
        }

        let bytes = fs::read(&path)?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
        if snapshot.metadata.version != STORE_FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "{}: unknown store format version {}",
                path.display(),
                snapshot.metadata.version
            )));
        }

        let mut metadata = snapshot.metadata;
        let mut rows = snapshot.rows;
        if metadata.fingerprint != fingerprint {
            if !auto_migrate {
                return Err(StoreError::SchemaMismatch(format!(
                    "{} was written with schema generation {}, current is {}",
                    path.display(),
                    metadata.fingerprint,
                    fingerprint
                )));
            }
            migrate_rows(&mut rows, schemas)?;
            debug!(
                path = %path.display(),
                from = %metadata.fingerprint,
                to = %fingerprint,
                "migrated durable store"
            );
            metadata.fingerprint = fingerprint;
            let mut store = Self {
                path,
                inner: MemoryStore::from_parts(metadata, rows),
            };
            store.flush()?;
            return Ok(store);
        }

        Ok(Self {
            path,
            inner: MemoryStore::from_parts(metadata, rows),
        })
    }

    /// Delete the backing file so the next `open` starts from scratch.
    pub fn reset(path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn migrate_rows(
    rows: &mut HashMap<String, BTreeMap<u64, ObjectData>>,
    schemas: &HashMap<String, Arc<EntitySchema>>,
) -> StoreResult<()> {
    // Entities dropped from the schema lose their rows.
    rows.retain(|entity, _| schemas.contains_key(entity));
    for (entity, entity_rows) in rows.iter_mut() {
        let Some(schema) = effective_schema(schemas, entity) else {
            continue;
        };
        for (key, data) in entity_rows.iter_mut() {
            data.retain(|name, _| {
                schema.find_attribute(name).is_some() || schema.find_relationship(name).is_some()
            });
            for attr in schema.attributes() {
                match data.get(&attr.name) {
                    Some(value) => {
                        if let Err(err) = attr.validate(value) {
                            return Err(StoreError::SchemaMismatch(format!(
                                "cannot migrate row {}/{}: {}",
                                entity, key, err
                            )));
                        }
                    }
                    None if !attr.optional => {
                        return Err(StoreError::SchemaMismatch(format!(
                            "cannot migrate row {}/{}: new required attribute '{}' has no value",
                            entity, key, attr.name
                        )));
                    }
                    None => {}
                }
            }
        }
    }
    Ok(())
}

impl ObjectStore for DurableStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Durable
    }

    fn metadata(&self) -> &StoreMetadata {
        self.inner.metadata()
    }

    fn reserve_keys(&mut self, count: u64) -> StoreResult<u64> {
        self.inner.reserve_keys(count)
    }

    fn rows(&self, entity: &str) -> Vec<(u64, ObjectData)> {
        self.inner.rows(entity)
    }

    fn get(&self, entity: &str, key: u64) -> Option<ObjectData> {
        self.inner.get(entity, key)
    }

    fn apply(&mut self, changes: &ChangeSet) -> StoreResult<()> {
        self.inner.apply(changes)
    }

    fn put(&mut self, entity: &str, key: u64, data: ObjectData) {
        self.inner.put(entity, key, data);
    }

    fn remove(&mut self, entity: &str, key: u64) -> bool {
        self.inner.remove(entity, key)
    }

    fn flush(&mut self) -> StoreResult<()> {
        let snapshot = StoreSnapshot {
            metadata: self.inner.metadata().clone(),
            rows: self.inner.all_rows().clone(),
        };
        let bytes = rmp_serde::to_vec(&snapshot)
            .map_err(|e| StoreError::Io(format!("serialize snapshot: {}", e)))?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent)?;
                parent
            }
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|e| StoreError::Io(format!("replace {}: {}", self.path.display(), e)))?;
        Ok(())
    }

    fn destroy(&mut self) -> StoreResult<()> {
        self.inner.destroy()?;
        Self::reset(&self.path)
    }

    fn row_count(&self) -> usize {
        self.inner.row_count()
    }
}

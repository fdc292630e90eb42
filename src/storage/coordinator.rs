use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::{
    EntitySchema, ObjectData, ObjectId, Result, StackError, StoreError, Value, effective_schema,
};
use crate::query::Predicate;
use crate::storage::{
    ChangeSet, DurableStore, MemoryStore, ObjectStore, StoreKind, StoreResult, permanent_key,
    schema_fingerprint,
};

// ============================================================================
// Mount options
// ============================================================================

/// How one named store configuration is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub name: String,
    pub kind: StoreKind,
    pub path: Option<PathBuf>,
    pub auto_migrate: bool,
    pub reset_on_failure: bool,
}

impl MountOptions {
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StoreKind::Memory,
            path: None,
            auto_migrate: false,
            reset_on_failure: false,
        }
    }

    pub fn durable(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: StoreKind::Durable,
            path: Some(path.into()),
            auto_migrate: false,
            reset_on_failure: false,
        }
    }

    pub fn auto_migrate(mut self) -> Self {
        self.auto_migrate = true;
        self
    }

    /// On an incompatible-schema open failure, destroy the store file and
    /// recreate it once. Any other failure class still propagates.
    pub fn reset_on_failure(mut self) -> Self {
        self.reset_on_failure = true;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StackError::Configuration(
                "Store configuration name cannot be empty".into(),
            ));
        }
        match (self.kind, &self.path) {
            (StoreKind::Durable, None) => Err(StackError::Configuration(format!(
                "Durable configuration '{}' requires a file path",
                self.name
            ))),
            (StoreKind::Memory, Some(_)) => Err(StackError::Configuration(format!(
                "Memory configuration '{}' cannot take a file path",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct MountedStore {
    options: MountOptions,
    store: Box<dyn ObjectStore>,
}

#[derive(Clone)]
struct EntityBinding {
    configuration: String,
    schema: Arc<EntitySchema>,
}

struct Inner {
    stores: HashMap<String, MountedStore>,
    bindings: HashMap<String, EntityBinding>,
    /// Copy-on-write snapshot of every registered entity with its parent
    /// chain merged in. Rebuilt on mount, shared with the fetch layer.
    effective: Arc<HashMap<String, Arc<EntitySchema>>>,
    commits: u64,
}

/// Owner of the mounted stores and the entity registry. Every entity kind
/// maps to at most one configuration; the coordinator routes change sets and
/// fetches to the owning store and hands out permanent keys at commit time.
pub struct StoreCoordinator {
    inner: RwLock<Inner>,
}

impl Default for StoreCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCoordinator {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                stores: HashMap::new(),
                bindings: HashMap::new(),
                effective: Arc::new(HashMap::new()),
                commits: 0,
            }),
        }
    }

    /// Mount a store configuration and register its entities.
    ///
    /// Remounting an existing configuration with identical options and an
    /// already-registered subset of entities is a no-op; different options
    /// for the same name fail with `IncompatibleStore`, and an entity that
    /// is already bound elsewhere fails with a configuration error without
    /// touching the first mapping.
    pub async fn mount(&self, options: MountOptions, schemas: Vec<EntitySchema>) -> Result<()> {
        options.validate()?;
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.stores.get(&options.name) {
            if existing.options != options {
                return Err(StoreError::IncompatibleStore(format!(
                    "configuration '{}' is already mounted with different options",
                    options.name
                ))
                .into());
            }
            for schema in &schemas {
                match inner.bindings.get(schema.name()) {
                    Some(bound)
                        if bound.configuration == options.name && *bound.schema == *schema => {}
                    Some(bound) => {
                        return Err(StackError::Configuration(format!(
                            "Entity '{}' is already registered to configuration '{}'",
                            schema.name(),
                            bound.configuration
                        )));
                    }
                    None => {
                        return Err(StackError::Configuration(format!(
                            "Configuration '{}' is already mounted; entity '{}' cannot be added after the fact",
                            options.name,
                            schema.name()
                        )));
                    }
                }
            }
            return Ok(());
        }

        let mut seen = HashSet::new();
        for schema in &schemas {
            if !seen.insert(schema.name().to_string()) {
                return Err(StackError::Configuration(format!(
                    "Entity '{}' appears twice in one mount",
                    schema.name()
                )));
            }
            if let Some(bound) = inner.bindings.get(schema.name()) {
                return Err(StackError::Configuration(format!(
                    "Entity '{}' is already registered to configuration '{}'",
                    schema.name(),
                    bound.configuration
                )));
            }
        }
        for schema in &schemas {
            validate_parent_chain(schema, &schemas, &inner.bindings)?;
        }

        let config_schemas: HashMap<String, Arc<EntitySchema>> = schemas
            .iter()
            .map(|s| (s.name().to_string(), Arc::new(s.clone())))
            .collect();

        let store: Box<dyn ObjectStore> = match options.kind {
            StoreKind::Memory => Box::new(MemoryStore::new(schema_fingerprint(&config_schemas))),
            StoreKind::Durable => {
                let Some(path) = options.path.as_ref() else {
                    return Err(StackError::Configuration(format!(
                        "Durable configuration '{}' requires a file path",
                        options.name
                    )));
                };
                match DurableStore::open(path, &config_schemas, options.auto_migrate) {
                    Ok(store) => Box::new(store),
                    Err(err)
                        if options.reset_on_failure && err.is_schema_incompatibility() =>
                    {
                        warn!(
                            configuration = %options.name,
                            %err,
                            "resetting incompatible durable store"
                        );
                        DurableStore::reset(path)?;
                        Box::new(DurableStore::open(path, &config_schemas, options.auto_migrate)?)
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        debug!(
            configuration = %options.name,
            kind = %options.kind,
            entities = schemas.len(),
            "mounted store configuration"
        );

        for (name, schema) in &config_schemas {
            inner.bindings.insert(
                name.clone(),
                EntityBinding {
                    configuration: options.name.clone(),
                    schema: schema.clone(),
                },
            );
        }
        inner
            .stores
            .insert(options.name.clone(), MountedStore { options, store });
        inner.effective = rebuild_effective(&inner.bindings);
        Ok(())
    }

    /// Merged schema snapshot for the query layer. Cheap to clone out; stale
    /// snapshots only matter across mounts, which happen at bootstrap.
    pub async fn schemas(&self) -> Arc<HashMap<String, Arc<EntitySchema>>> {
        self.inner.read().await.effective.clone()
    }

    /// Replace temporary identities with store-assigned permanent ones.
    /// Identities that are already permanent pass through untouched.
    pub async fn assign_permanent_ids(
        &self,
        ids: &[ObjectId],
    ) -> Result<HashMap<ObjectId, ObjectId>> {
        let mut inner = self.inner.write().await;
        let mut by_configuration: HashMap<String, Vec<ObjectId>> = HashMap::new();
        for id in ids {
            if !id.is_temporary() {
                continue;
            }
            let binding = inner.bindings.get(id.entity()).ok_or_else(|| {
                StackError::Store(StoreError::UnknownEntity(format!(
                    "'{}' is not registered with any store",
                    id.entity()
                )))
            })?;
            by_configuration
                .entry(binding.configuration.clone())
                .or_default()
                .push(id.clone());
        }

        let mut mapping = HashMap::new();
        for (configuration, ids) in by_configuration {
            let mounted = inner.stores.get_mut(&configuration).ok_or_else(|| {
                StackError::Configuration(format!(
                    "Configuration '{}' is not mounted",
                    configuration
                ))
            })?;
            let first = mounted.store.reserve_keys(ids.len() as u64)?;
            for (offset, id) in ids.into_iter().enumerate() {
                let permanent = id.with_permanent_key(first + offset as u64);
                mapping.insert(id, permanent);
            }
        }
        Ok(mapping)
    }

    /// Apply one committed change set. All identities must already be
    /// permanent. Every row is validated against its entity's merged schema
    /// before anything is written; durable stores are flushed afterwards.
    pub async fn commit(&self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write().await;

        for (id, data) in changes.inserts.iter().chain(changes.updates.iter()) {
            let schema = inner.effective.get(id.entity()).ok_or_else(|| {
                StackError::Store(StoreError::UnknownEntity(format!(
                    "'{}' is not registered with any store",
                    id.entity()
                )))
            })?;
            schema.validate_data(data)?;
        }

        let mut per_configuration: HashMap<String, ChangeSet> = HashMap::new();
        {
            let bindings = &inner.bindings;
            let route = |id: &ObjectId| -> Result<String> {
                bindings
                    .get(id.entity())
                    .map(|b| b.configuration.clone())
                    .ok_or_else(|| {
                        StackError::Store(StoreError::UnknownEntity(format!(
                            "'{}' is not registered with any store",
                            id.entity()
                        )))
                    })
            };
            for (id, data) in &changes.inserts {
                per_configuration
                    .entry(route(id)?)
                    .or_default()
                    .inserts
                    .push((id.clone(), data.clone()));
            }
            for (id, data) in &changes.updates {
                per_configuration
                    .entry(route(id)?)
                    .or_default()
                    .updates
                    .push((id.clone(), data.clone()));
            }
            for id in &changes.deletes {
                per_configuration
                    .entry(route(id)?)
                    .or_default()
                    .deletes
                    .push(id.clone());
            }
        }

        for (configuration, subset) in &per_configuration {
            let mounted = inner.stores.get_mut(configuration).ok_or_else(|| {
                StackError::Configuration(format!(
                    "Configuration '{}' is not mounted",
                    configuration
                ))
            })?;
            mounted.store.apply(subset)?;
            mounted.store.flush()?;
        }

        inner.commits += 1;
        debug!(
            changes = changes.len(),
            configurations = per_configuration.len(),
            "committed change set"
        );
        Ok(())
    }

    /// Rows for a fetch: the entity's own rows first, then each subkind's
    /// when requested, each tagged with its concrete entity.
    pub async fn fetch_rows(
        &self,
        entity: &str,
        include_subkinds: bool,
    ) -> Result<Vec<(ObjectId, ObjectData)>> {
        let inner = self.inner.read().await;
        if !inner.bindings.contains_key(entity) {
            return Err(StackError::Store(StoreError::UnknownEntity(format!(
                "'{}' is not registered with any store",
                entity
            ))));
        }
        let mut targets = vec![entity.to_string()];
        if include_subkinds {
            targets.extend(descendants_of(&inner.effective, entity));
        }

        let mut rows = Vec::new();
        for target in &targets {
            let Some(binding) = inner.bindings.get(target) else {
                continue;
            };
            let Some(mounted) = inner.stores.get(&binding.configuration) else {
                continue;
            };
            for (key, data) in mounted.store.rows(target) {
                rows.push((ObjectId::permanent(target.clone(), key), data));
            }
        }
        Ok(rows)
    }

    /// Current stored row for one permanent identity; `None` when the row is
    /// gone or the identity never reached a store.
    pub async fn get_row(&self, id: &ObjectId) -> Result<Option<ObjectData>> {
        if id.is_temporary() {
            return Ok(None);
        }
        let inner = self.inner.read().await;
        let binding = inner.bindings.get(id.entity()).ok_or_else(|| {
            StackError::Store(StoreError::UnknownEntity(format!(
                "'{}' is not registered with any store",
                id.entity()
            )))
        })?;
        let Some(mounted) = inner.stores.get(&binding.configuration) else {
            return Ok(None);
        };
        let key = match crate::storage::permanent_key(id) {
            Ok(key) => key,
            Err(_) => return Ok(None),
        };
        Ok(mounted.store.get(id.entity(), key))
    }

    /// Store-level bulk update: rewrite matching rows in place, bypassing
    /// every context. Returns the identities touched.
    pub async fn batch_update(
        &self,
        entity: &str,
        predicate: Option<&Predicate>,
        changes: &HashMap<String, Value>,
    ) -> Result<Vec<ObjectId>> {
        let mut inner = self.inner.write().await;
        let schema = inner
            .effective
            .get(entity)
            .ok_or_else(|| {
                StackError::Store(StoreError::UnknownEntity(format!(
                    "'{}' is not registered with any store",
                    entity
                )))
            })?
            .clone();
        validate_batch_changes(&schema, changes)?;

        let mut targets = vec![entity.to_string()];
        targets.extend(descendants_of(&inner.effective, entity));

        let mut touched = Vec::new();
        let mut dirty_configurations = HashSet::new();
        for target in &targets {
            let Some(binding) = inner.bindings.get(target) else {
                continue;
            };
            let configuration = binding.configuration.clone();
            let Some(mounted) = inner.stores.get_mut(&configuration) else {
                continue;
            };
            for (key, mut data) in mounted.store.rows(target) {
                if let Some(predicate) = predicate
                    && !predicate.evaluate(&data)?
                {
                    continue;
                }
                for (name, value) in changes {
                    data.insert(name.clone(), value.clone());
                }
                mounted.store.put(target, key, data);
                touched.push(ObjectId::permanent(target.clone(), key));
                dirty_configurations.insert(configuration.clone());
            }
        }
        flush_configurations(&mut inner, &dirty_configurations)?;
        debug!(entity, touched = touched.len(), "batch update");
        Ok(touched)
    }

    /// Store-level bulk delete. Returns the identities removed.
    pub async fn batch_delete(
        &self,
        entity: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<ObjectId>> {
        let mut inner = self.inner.write().await;
        if !inner.bindings.contains_key(entity) {
            return Err(StackError::Store(StoreError::UnknownEntity(format!(
                "'{}' is not registered with any store",
                entity
            ))));
        }
        let mut targets = vec![entity.to_string()];
        targets.extend(descendants_of(&inner.effective, entity));

        let mut removed = Vec::new();
        let mut dirty_configurations = HashSet::new();
        for target in &targets {
            let Some(binding) = inner.bindings.get(target) else {
                continue;
            };
            let configuration = binding.configuration.clone();
            let Some(mounted) = inner.stores.get_mut(&configuration) else {
                continue;
            };
            for (key, data) in mounted.store.rows(target) {
                if let Some(predicate) = predicate
                    && !predicate.evaluate(&data)?
                {
                    continue;
                }
                mounted.store.remove(target, key);
                removed.push(ObjectId::permanent(target.clone(), key));
                dirty_configurations.insert(configuration.clone());
            }
        }
        flush_configurations(&mut inner, &dirty_configurations)?;
        debug!(entity, removed = removed.len(), "batch delete");
        Ok(removed)
    }

    /// Store-level bulk delete by explicit identity. Temporary identities
    /// have no store row and are skipped; identities whose row is already
    /// gone drop out of the result. Returns the identities removed.
    pub async fn batch_delete_ids(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let mut inner = self.inner.write().await;
        let mut removed = Vec::new();
        let mut dirty_configurations = HashSet::new();
        for id in ids {
            if id.is_temporary() {
                continue;
            }
            let key = permanent_key(id)?;
            let configuration = inner
                .bindings
                .get(id.entity())
                .map(|binding| binding.configuration.clone())
                .ok_or_else(|| {
                    StackError::Store(StoreError::UnknownEntity(format!(
                        "'{}' is not registered with any store",
                        id.entity()
                    )))
                })?;
            let Some(mounted) = inner.stores.get_mut(&configuration) else {
                continue;
            };
            if mounted.store.remove(id.entity(), key) {
                removed.push(id.clone());
                dirty_configurations.insert(configuration);
            }
        }
        flush_configurations(&mut inner, &dirty_configurations)?;
        debug!(removed = removed.len(), "batch delete by identity");
        Ok(removed)
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let inner = self.inner.read().await;
        CoordinatorStats {
            mounted_stores: inner.stores.len(),
            registered_entities: inner.bindings.len(),
            commits: inner.commits,
            total_rows: inner.stores.values().map(|m| m.store.row_count()).sum(),
        }
    }
}

fn flush_configurations(inner: &mut Inner, configurations: &HashSet<String>) -> StoreResult<()> {
    for configuration in configurations {
        if let Some(mounted) = inner.stores.get_mut(configuration) {
            mounted.store.flush()?;
        }
    }
    Ok(())
}

fn validate_batch_changes(
    schema: &EntitySchema,
    changes: &HashMap<String, Value>,
) -> Result<()> {
    for (name, value) in changes {
        if let Some(attr) = schema.find_attribute(name) {
            attr.validate(value)?;
        } else if let Some(rel) = schema.find_relationship(name) {
            match value {
                Value::Null => {}
                Value::Reference(id) if id.entity() == rel.destination => {}
                other => {
                    return Err(StoreError::Validation(format!(
                        "Relationship '{}' of '{}' cannot be set to {}",
                        name,
                        schema.name(),
                        other.type_name()
                    ))
                    .into());
                }
            }
        } else {
            return Err(StoreError::Validation(format!(
                "Entity '{}' has no attribute or relationship '{}'",
                schema.name(),
                name
            ))
            .into());
        }
    }
    Ok(())
}

fn validate_parent_chain(
    schema: &EntitySchema,
    new: &[EntitySchema],
    bindings: &HashMap<String, EntityBinding>,
) -> Result<()> {
    let mut visited: HashSet<String> = HashSet::from([schema.name().to_string()]);
    let mut current = schema.parent().map(str::to_string);
    while let Some(parent_name) = current {
        if !visited.insert(parent_name.clone()) {
            return Err(StackError::Configuration(format!(
                "Parent cycle through entity '{}'",
                parent_name
            )));
        }
        let Some(parent) = find_schema(new, bindings, &parent_name) else {
            return Err(StackError::Configuration(format!(
                "Parent entity '{}' of '{}' is not registered",
                parent_name,
                schema.name()
            )));
        };
        current = parent.parent().map(str::to_string);
    }
    Ok(())
}

fn find_schema<'a>(
    new: &'a [EntitySchema],
    bindings: &'a HashMap<String, EntityBinding>,
    name: &str,
) -> Option<&'a EntitySchema> {
    new.iter()
        .find(|s| s.name() == name)
        .or_else(|| bindings.get(name).map(|b| b.schema.as_ref()))
}

fn rebuild_effective(
    bindings: &HashMap<String, EntityBinding>,
) -> Arc<HashMap<String, Arc<EntitySchema>>> {
    let raw: HashMap<String, Arc<EntitySchema>> = bindings
        .iter()
        .map(|(name, binding)| (name.clone(), binding.schema.clone()))
        .collect();
    let mut effective = HashMap::new();
    for name in raw.keys() {
        if let Some(merged) = effective_schema(&raw, name) {
            effective.insert(name.clone(), Arc::new(merged));
        }
    }
    Arc::new(effective)
}

/// Entities whose parent chain passes through `entity`, sorted by name.
pub(crate) fn descendants_of(
    schemas: &HashMap<String, Arc<EntitySchema>>,
    entity: &str,
) -> Vec<String> {
    let mut result = Vec::new();
    'outer: for (name, schema) in schemas {
        if name == entity {
            continue;
        }
        let mut current = schema.parent();
        let mut hops = 0;
        while let Some(parent) = current {
            if parent == entity {
                result.push(name.clone());
                continue 'outer;
            }
            current = schemas.get(parent).and_then(|s| s.parent());
            hops += 1;
            if hops > schemas.len() {
                break;
            }
        }
    }
    result.sort();
    result
}

/// Point-in-time coordinator counters.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub mounted_stores: usize,
    pub registered_entities: usize,
    pub commits: u64,
    pub total_rows: usize,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttributeKind;
    use tempfile::TempDir;

    fn item_schema() -> EntitySchema {
        EntitySchema::new("Item")
            .required_attribute("name", AttributeKind::Text)
            .attribute("age", AttributeKind::Integer)
    }

    fn item(name: &str, age: i64) -> ObjectData {
        let mut data = ObjectData::new();
        data.insert("name".into(), name.into());
        data.insert("age".into(), age.into());
        data
    }

    async fn seeded_coordinator() -> StoreCoordinator {
        let coordinator = StoreCoordinator::new();
        coordinator
            .mount(MountOptions::memory("main"), vec![item_schema()])
            .await
            .unwrap();
        coordinator
    }

    async fn insert_items(coordinator: &StoreCoordinator, items: Vec<ObjectData>) -> Vec<ObjectId> {
        let temp_ids: Vec<ObjectId> =
            items.iter().map(|_| ObjectId::temporary("Item")).collect();
        let mapping = coordinator.assign_permanent_ids(&temp_ids).await.unwrap();
        let mut changes = ChangeSet::default();
        for (temp, data) in temp_ids.iter().zip(items) {
            changes.inserts.push((mapping[temp].clone(), data));
        }
        coordinator.commit(&changes).await.unwrap();
        changes.inserts.into_iter().map(|(id, _)| id).collect()
    }

    #[tokio::test]
    async fn test_entity_maps_to_at_most_one_configuration() {
        let coordinator = seeded_coordinator().await;
        let err = coordinator
            .mount(MountOptions::memory("second"), vec![item_schema()])
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Configuration(_)));

        // The first mapping is unaffected.
        insert_items(&coordinator, vec![item("a", 1)]).await;
        let rows = coordinator.fetch_rows("Item", true).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_same_name_different_options_is_incompatible() {
        let dir = TempDir::new().unwrap();
        let coordinator = seeded_coordinator().await;
        let err = coordinator
            .mount(
                MountOptions::durable("main", dir.path().join("x.store")),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StackError::Store(StoreError::IncompatibleStore(_))
        ));
    }

    #[tokio::test]
    async fn test_identical_remount_is_a_no_op() {
        let coordinator = seeded_coordinator().await;
        coordinator
            .mount(MountOptions::memory("main"), vec![item_schema()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_assign_then_commit_round_trips() {
        let coordinator = seeded_coordinator().await;
        let ids = insert_items(&coordinator, vec![item("a", 1), item("b", 2)]).await;
        assert!(ids.iter().all(|id| !id.is_temporary()));

        let rows = coordinator.fetch_rows("Item", true).await.unwrap();
        assert_eq!(rows.len(), 2);
        let row = coordinator.get_row(&ids[0]).await.unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&"a".into()));
        assert_eq!(coordinator.stats().await.commits, 1);
    }

    #[tokio::test]
    async fn test_validation_failure_blocks_the_whole_commit() {
        let coordinator = seeded_coordinator().await;
        let temp = ObjectId::temporary("Item");
        let mapping = coordinator
            .assign_permanent_ids(std::slice::from_ref(&temp))
            .await
            .unwrap();
        let mut bad = ObjectData::new();
        bad.insert("age".into(), 3i64.into()); // required "name" missing
        let changes = ChangeSet {
            inserts: vec![(mapping[&temp].clone(), bad)],
            ..Default::default()
        };
        let err = coordinator.commit(&changes).await.unwrap_err();
        assert!(matches!(err, StackError::Store(StoreError::Validation(_))));
        assert_eq!(coordinator.stats().await.total_rows, 0);
        assert_eq!(coordinator.stats().await.commits, 0);
    }

    #[tokio::test]
    async fn test_subkind_rows_ride_along() {
        let coordinator = StoreCoordinator::new();
        coordinator
            .mount(
                MountOptions::memory("main"),
                vec![
                    EntitySchema::new("Person").attribute("name", AttributeKind::Text),
                    EntitySchema::new("Employee")
                        .parent_kind("Person")
                        .attribute("salary", AttributeKind::Float),
                ],
            )
            .await
            .unwrap();

        let person = ObjectId::temporary("Person");
        let employee = ObjectId::temporary("Employee");
        let mapping = coordinator
            .assign_permanent_ids(&[person.clone(), employee.clone()])
            .await
            .unwrap();
        let mut changes = ChangeSet::default();
        let mut data = ObjectData::new();
        data.insert("name".into(), "p".into());
        changes.inserts.push((mapping[&person].clone(), data));
        let mut data = ObjectData::new();
        data.insert("name".into(), "e".into());
        data.insert("salary".into(), 1.5f64.into());
        changes.inserts.push((mapping[&employee].clone(), data));
        coordinator.commit(&changes).await.unwrap();

        let all = coordinator.fetch_rows("Person", true).await.unwrap();
        assert_eq!(all.len(), 2);
        let exact = coordinator.fetch_rows("Person", false).await.unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].0.entity(), "Person");
    }

    #[tokio::test]
    async fn test_unknown_parent_is_rejected() {
        let coordinator = StoreCoordinator::new();
        let err = coordinator
            .mount(
                MountOptions::memory("main"),
                vec![EntitySchema::new("Orphan").parent_kind("Missing")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_batch_update_and_delete() {
        let coordinator = seeded_coordinator().await;
        insert_items(
            &coordinator,
            vec![item("a", 1), item("b", 2), item("c", 3)],
        )
        .await;

        let mut changes = HashMap::new();
        changes.insert("age".to_string(), Value::Integer(0));
        let touched = coordinator
            .batch_update("Item", Some(&Predicate::gt("age", 1i64)), &changes)
            .await
            .unwrap();
        assert_eq!(touched.len(), 2);

        let removed = coordinator
            .batch_delete("Item", Some(&Predicate::eq("age", 0i64)))
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(coordinator.stats().await.total_rows, 1);
    }

    #[tokio::test]
    async fn test_batch_delete_by_identity() {
        let coordinator = seeded_coordinator().await;
        let ids = insert_items(
            &coordinator,
            vec![item("a", 1), item("b", 2), item("c", 3)],
        )
        .await;

        // One live row, one temporary, one already gone.
        let mut targets = vec![ids[0].clone(), ObjectId::temporary("Item")];
        coordinator.batch_delete("Item", Some(&Predicate::eq("age", 2i64)))
            .await
            .unwrap();
        targets.push(ids[1].clone());

        let removed = coordinator.batch_delete_ids(&targets).await.unwrap();
        assert_eq!(removed, vec![ids[0].clone()]);
        assert_eq!(coordinator.stats().await.total_rows, 1);
    }

    #[tokio::test]
    async fn test_batch_update_rejects_unknown_attribute() {
        let coordinator = seeded_coordinator().await;
        let mut changes = HashMap::new();
        changes.insert("bogus".to_string(), Value::Integer(0));
        let err = coordinator
            .batch_update("Item", None, &changes)
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Store(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unregistered_entity_is_rejected_at_the_store_layer() {
        let coordinator = seeded_coordinator().await;
        let err = coordinator.fetch_rows("Ghost", false).await.unwrap_err();
        assert!(matches!(
            err,
            StackError::Store(StoreError::UnknownEntity(_))
        ));
        let err = coordinator.batch_delete("Ghost", None).await.unwrap_err();
        assert!(matches!(
            err,
            StackError::Store(StoreError::UnknownEntity(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_on_failure_recreates_the_store_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.store");

        let first = StoreCoordinator::new();
        first
            .mount(
                MountOptions::durable("disk", &path),
                vec![item_schema()],
            )
            .await
            .unwrap();
        insert_items(&first, vec![item("a", 1)]).await;

        // A different schema generation without auto-migrate. Plain mount
        // fails; with reset_on_failure the file is wiped and recreated.
        let incompatible = vec![
            EntitySchema::new("Item").required_attribute("name", AttributeKind::Text),
        ];
        let second = StoreCoordinator::new();
        let err = second
            .mount(
                MountOptions::durable("disk", &path),
                incompatible.clone(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StackError::Store(StoreError::SchemaMismatch(_))
        ));

        let third = StoreCoordinator::new();
        third
            .mount(
                MountOptions::durable("disk", &path).reset_on_failure(),
                incompatible,
            )
            .await
            .unwrap();
        assert_eq!(third.stats().await.total_rows, 0);
        assert!(path.exists());
    }
}

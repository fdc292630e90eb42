//! Fetch facade: describes what to read and executes it against one
//! context's object graph overlaid on the coordinator's stored rows.
//!
//! Every read-capable surface funnels through [`Fetcher`], so pending
//! changes, subkind expansion, predicate filtering, sorting and the
//! aggregate path behave identically no matter which context issued the
//! request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{Object, SharedGraph};
use crate::core::{resolve_key_path, ObjectData, ObjectId, Result, StackError, Value};
use crate::query::sort::sort_rows;
use crate::query::{
    AggregateQuery, AggregateRow, FetchOptions, Predicate, SelectTarget, SortDescriptor,
};
use crate::storage::coordinator::descendants_of;
use crate::storage::StoreCoordinator;

// ===== Request =====

/// A declarative description of one fetch: target entity, optional filter,
/// sort order and execution options.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortDescriptor>,
    pub options: FetchOptions,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            sort: Vec::new(),
            options: FetchOptions::default(),
        }
    }

    /// Restricts the result to rows matching `predicate`.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Appends one sort descriptor; earlier descriptors win.
    pub fn sort_by(mut self, descriptor: SortDescriptor) -> Self {
        self.sort.push(descriptor);
        self
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.options.offset = Some(offset);
        self
    }
}

// ===== Capability =====

/// Read side of the context API. Implemented by the main context and by
/// update handles; both delegate to the same execution pipeline.
#[async_trait]
pub trait ReadCapable {
    /// All matching objects as live handles, materialized into the
    /// caller's graph.
    async fn fetch_all(&self, request: FetchRequest) -> Result<Vec<Object>>;

    /// Exactly one match. Absence is an error so call sites can lean on
    /// `?` instead of unwrapping options.
    async fn fetch_one(&self, request: FetchRequest) -> Result<Object>;

    /// Matching identities without materializing data.
    async fn fetch_ids(&self, request: FetchRequest) -> Result<Vec<ObjectId>>;

    /// Matching rows as plain property maps, outside the object graph.
    async fn fetch_properties(&self, request: FetchRequest) -> Result<Vec<ObjectData>>;

    /// Number of matching rows.
    async fn count(&self, request: FetchRequest) -> Result<usize>;

    /// Grouped aggregate evaluation over matching rows.
    async fn aggregate(&self, query: AggregateQuery) -> Result<Vec<AggregateRow>>;
}

// ===== Execution =====

/// Shared fetch pipeline: one context's graph overlaid on the rows the
/// coordinator holds for the target entity family.
#[derive(Clone)]
pub(crate) struct Fetcher {
    graph: SharedGraph,
    coordinator: Arc<StoreCoordinator>,
}

impl Fetcher {
    pub(crate) fn new(graph: SharedGraph, coordinator: Arc<StoreCoordinator>) -> Self {
        Self { graph, coordinator }
    }

    /// Runs the full pipeline and returns matching `(id, data)` pairs in
    /// final order. The data side reflects pending local edits when the
    /// request includes them.
    pub(crate) async fn rows(
        &self,
        request: FetchRequest,
    ) -> Result<Vec<(ObjectId, ObjectData)>> {
        let mut request = request;
        // The tweak hook runs after everything else was assembled so it
        // can override any part of the request.
        if let Some(tweak) = request.options.tweak.clone() {
            tweak(&mut request);
        }

        let schemas = self.coordinator.schemas().await;
        let mut family: HashSet<String> = HashSet::from([request.entity.clone()]);
        if request.options.include_subkinds {
            family.extend(descendants_of(&schemas, &request.entity));
        }

        let store_rows = self
            .coordinator
            .fetch_rows(&request.entity, request.options.include_subkinds)
            .await?;

        let materialize =
            !request.options.ids_only && !request.options.properties_only;
        let mut by_id: HashMap<ObjectId, ObjectData> =
            HashMap::with_capacity(store_rows.len());

        if request.options.include_pending_changes {
            {
                let mut graph = self.graph.lock();
                for (id, data) in &store_rows {
                    if materialize {
                        graph.materialize(id, data.clone());
                    }
                }
                for (id, data) in store_rows {
                    by_id.insert(id, data);
                }
                for id in graph.deleted_ids(&family) {
                    by_id.remove(&id);
                }
                for (id, data) in graph.rows_of(&family) {
                    by_id.insert(id, data);
                }
            }
        } else {
            // Committed state only. Pending inserts stay invisible and
            // pending deletes still show the stored row.
            for (id, data) in store_rows {
                by_id.insert(id, data);
            }
        }

        let mut rows: Vec<(ObjectId, ObjectData)> = Vec::with_capacity(by_id.len());
        for (id, data) in by_id {
            if let Some(predicate) = &request.predicate
                && !predicate.evaluate(&data)?
            {
                continue;
            }
            rows.push((id, data));
        }

        if request.sort.is_empty() {
            // Stable fallback order so unsorted fetches stay deterministic.
            rows.sort_by(|a, b| a.0.cmp(&b.0));
        } else {
            sort_rows(&mut rows, &request.sort, |(_, data)| data)?;
        }

        let offset = request.options.offset.unwrap_or(0);
        if offset > 0 {
            rows.drain(..offset.min(rows.len()));
        }
        if let Some(limit) = request.options.limit {
            rows.truncate(limit);
        }

        if materialize && !request.options.prefetch.is_empty() {
            let paths = request.options.prefetch.clone();
            self.prefetch(&rows, &paths).await?;
        }

        Ok(rows)
    }

    pub(crate) async fn fetch_all(&self, request: FetchRequest) -> Result<Vec<Object>> {
        let rows = self.rows(request).await?;
        Ok(rows
            .into_iter()
            .map(|(id, _)| Object::new(self.graph.clone(), id))
            .collect())
    }

    pub(crate) async fn fetch_one(&self, request: FetchRequest) -> Result<Object> {
        let entity = request.entity.clone();
        let rows = self.rows(request).await?;
        match rows.into_iter().next() {
            Some((id, _)) => Ok(Object::new(self.graph.clone(), id)),
            None => Err(StackError::NotFound(entity)),
        }
    }

    pub(crate) async fn fetch_ids(&self, request: FetchRequest) -> Result<Vec<ObjectId>> {
        let mut request = request;
        request.options.ids_only = true;
        let rows = self.rows(request).await?;
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    pub(crate) async fn fetch_properties(
        &self,
        request: FetchRequest,
    ) -> Result<Vec<ObjectData>> {
        let mut request = request;
        request.options.properties_only = true;
        let distinct = request.options.distinct;
        let rows = self.rows(request).await?;
        let mut out: Vec<ObjectData> = Vec::with_capacity(rows.len());
        for (_, data) in rows {
            if distinct && out.contains(&data) {
                continue;
            }
            out.push(data);
        }
        Ok(out)
    }

    pub(crate) async fn count(&self, request: FetchRequest) -> Result<usize> {
        let mut request = request;
        request.options.ids_only = true;
        Ok(self.rows(request).await?.len())
    }

    // ----- aggregates -----

    pub(crate) async fn aggregate(&self, query: AggregateQuery) -> Result<Vec<AggregateRow>> {
        let schemas = self.coordinator.schemas().await;
        // Resolve every referenced key path up front; a dangling segment
        // fails the whole query before any row is read.
        for target in &query.select {
            match target {
                SelectTarget::Key(key) => {
                    resolve_key_path(&schemas, &query.entity, key)?;
                }
                SelectTarget::Aggregate { key_path, .. } => {
                    resolve_key_path(&schemas, &query.entity, key_path)?;
                }
            }
        }
        for key in &query.group_by {
            resolve_key_path(&schemas, &query.entity, key)?;
        }

        let mut request = FetchRequest::new(&query.entity);
        request.predicate = query.predicate.clone();
        request.options.properties_only = true;
        let rows = self.rows(request).await?;

        // Group rows by their group-key tuple, preserving first-seen order.
        let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
        let mut groups: Vec<(Vec<Value>, Vec<ObjectData>)> = Vec::new();
        for (_, data) in rows {
            let mut key = Vec::with_capacity(query.group_by.len());
            for path in &query.group_by {
                key.push(self.value_at_path(&data, path).await?);
            }
            match index.get(&key) {
                Some(&slot) => groups[slot].1.push(data),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![data]));
                }
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (key_values, members) in groups {
            let mut row = AggregateRow::new();
            for (path, value) in query.group_by.iter().zip(key_values) {
                row.insert(path.clone(), value);
            }
            for target in &query.select {
                match target {
                    SelectTarget::Key(key) => {
                        let value = match members.first() {
                            Some(member) => self.value_at_path(member, key).await?,
                            None => Value::Null,
                        };
                        row.insert(target.column_name(), value);
                    }
                    SelectTarget::Aggregate {
                        function, key_path, ..
                    } => {
                        let mut column = Vec::with_capacity(members.len());
                        for member in &members {
                            column.push(self.value_at_path(member, key_path).await?);
                        }
                        row.insert(target.column_name(), function.apply(&column)?);
                    }
                }
            }
            if let Some(having) = &query.having
                && !having.evaluate(&row)?
            {
                continue;
            }
            out.push(row);
        }
        Ok(out)
    }

    // ----- key paths and prefetching -----

    /// Reads `path` out of `data`, following `Value::Reference` links
    /// through the graph and the stores for every non-final segment. A
    /// null link short-circuits to `Null`; a non-reference intermediate
    /// is a type error.
    async fn value_at_path(&self, data: &ObjectData, path: &str) -> Result<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = data.clone();
        for (position, segment) in segments.iter().enumerate() {
            let value = current.get(*segment).cloned().unwrap_or(Value::Null);
            if position + 1 == segments.len() {
                return Ok(value);
            }
            match value {
                Value::Reference(id) => match self.lookup(&id).await? {
                    Some(next) => current = next,
                    None => return Ok(Value::Null),
                },
                Value::Null => return Ok(Value::Null),
                other => {
                    return Err(StackError::TypeMismatch(format!(
                        "segment '{}' of key path '{}' holds {}, expected a reference",
                        segment,
                        path,
                        other.type_name()
                    )));
                }
            }
        }
        Ok(Value::Null)
    }

    /// Walks each prefetch path for each row and pulls the referenced
    /// rows into the graph so later handle traversal finds them warm.
    async fn prefetch(
        &self,
        rows: &[(ObjectId, ObjectData)],
        paths: &[String],
    ) -> Result<()> {
        for path in paths {
            for (_, data) in rows {
                let mut current = data.clone();
                for segment in path.split('.') {
                    let Some(Value::Reference(id)) = current.get(segment).cloned() else {
                        break;
                    };
                    match self.lookup(&id).await? {
                        Some(next) => {
                            self.graph.lock().materialize(&id, next.clone());
                            current = next;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Graph-first row lookup, falling back to the coordinator's stores.
    async fn lookup(&self, id: &ObjectId) -> Result<Option<ObjectData>> {
        if let Some(data) = self.graph.lock().data(id) {
            return Ok(Some(data));
        }
        self.coordinator.get_row(id).await
    }
}

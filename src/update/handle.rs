//! The handle transaction bodies receive: object lifecycle, batch
//! mutations and the guarded recursive commit.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::base::save_cascade;
use crate::context::Object;
use crate::core::{ObjectData, ObjectId, Result, StackError, Value};
use crate::fetch::{FetchRequest, Fetcher, ReadCapable};
use crate::query::{AggregateQuery, AggregateRow, Operand, Predicate};
use crate::storage::coordinator::descendants_of;
use crate::storage::StoreCoordinator;
use crate::update::context::{schedule_unit, UpdateShared};
use crate::update::origin::CommitNotice;

/// Write side of the context API. Only update handles implement it; the
/// main context stays read-only.
#[async_trait]
pub trait WriteCapable {
    /// Registers a fresh object of `entity` with a temporary identity.
    async fn create(&self, entity: &str) -> Result<Object>;

    /// Returns the one object matching `predicate`, creating and seeding
    /// it from the predicate's equality pairs when absent. Only a
    /// conjunction of `key == literal` terms can be inverted; any other
    /// shape is `UnsupportedPredicateShape`.
    async fn fetch_or_create(&self, entity: &str, predicate: &Predicate) -> Result<Object>;

    /// Marks one object for deletion at the next commit.
    async fn delete(&self, object: &Object) -> Result<()>;

    async fn delete_many(&self, objects: &[Object]) -> Result<()>;

    /// Keys-only fetch followed by per-object pending deletion; returns
    /// how many objects were marked.
    async fn delete_all(&self, entity: &str, predicate: Option<&Predicate>) -> Result<usize>;

    /// Re-homes an object from another context by identity lookup.
    /// `NotFound` when the committed row no longer exists.
    async fn adopt(&self, object: &Object) -> Result<Object>;
}

/// Live access to one update context from inside a transaction body.
/// Clones share the context.
#[derive(Clone)]
pub struct UpdateHandle {
    shared: Arc<UpdateShared>,
}

impl UpdateHandle {
    pub(crate) fn new(shared: Arc<UpdateShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        self.shared.core.name()
    }

    pub fn has_changes(&self) -> bool {
        self.shared.core.graph.lock().has_changes()
    }

    /// Schedules nested work on this context's lane. The transaction's
    /// task group covers the unit, so a serialized origin's exclusive
    /// window stretches until it finishes.
    pub fn perform<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce(UpdateHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        schedule_unit(self.shared.clone(), body)
    }

    /// Guarded recursive save. A no-op without pending changes; otherwise
    /// permanent identities are assigned and the pending set moves up the
    /// parent chain, the top of which writes through the coordinator.
    /// Reports whether a store commit happened; exactly one commit notice
    /// goes out per successful top save when the origin does not
    /// auto-merge.
    pub async fn commit(&self) -> Result<bool> {
        let committed = save_cascade(self.shared.core.clone()).await?;
        if committed && !self.shared.auto_merge {
            let _ = self.shared.notices.send(CommitNotice {
                origin: self.shared.origin,
            });
        }
        Ok(committed)
    }

    /// Discards this context's pending changes only. Unsaved inserts
    /// vanish; modified and deleted objects snap back to their committed
    /// rows.
    pub async fn rollback(&self) -> Result<()> {
        let pending = self.shared.core.graph.lock().pending_changes();
        if pending.is_empty() {
            return Ok(());
        }
        let mut restored: HashMap<ObjectId, ObjectData> = HashMap::new();
        for (id, _) in &pending.updates {
            if let Some(data) = self.coordinator().get_row(id).await? {
                restored.insert(id.clone(), data);
            }
        }
        for id in &pending.deletes {
            if let Some(data) = self.coordinator().get_row(id).await? {
                restored.insert(id.clone(), data);
            }
        }
        self.shared.core.graph.lock().discard_pending(&restored);
        self.shared.core.emit_changed(&pending);
        debug!(context = %self.name(), "rolled back pending changes");
        Ok(())
    }

    /// Store-level bulk update bypassing every context, followed by
    /// invalidation of this context's materialized objects of that kind.
    pub async fn batch_update(
        &self,
        entity: &str,
        predicate: Option<&Predicate>,
        changes: &HashMap<String, Value>,
    ) -> Result<Vec<ObjectId>> {
        let updated = self
            .coordinator()
            .batch_update(entity, predicate, changes)
            .await?;
        self.invalidate(entity).await;
        Ok(updated)
    }

    /// Store-level bulk delete; same invalidation contract as
    /// [`batch_update`](Self::batch_update).
    pub async fn batch_delete(
        &self,
        entity: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<ObjectId>> {
        let deleted = self.coordinator().batch_delete(entity, predicate).await?;
        self.invalidate(entity).await;
        Ok(deleted)
    }

    /// Store-level bulk delete by explicit identity, with the same
    /// invalidation as [`batch_delete`](Self::batch_delete) for every
    /// entity the removed identities belong to.
    pub async fn batch_delete_ids(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let deleted = self.coordinator().batch_delete_ids(ids).await?;
        let entities: HashSet<String> = deleted
            .iter()
            .map(|id| id.entity().to_string())
            .collect();
        for entity in entities {
            self.invalidate(&entity).await;
        }
        Ok(deleted)
    }

    /// Drops materialized rows of `entity` and its subkinds from this
    /// context so stale copies cannot shadow the store. Pending local
    /// changes survive.
    async fn invalidate(&self, entity: &str) {
        let schemas = self.coordinator().schemas().await;
        let mut family: HashSet<String> = HashSet::from([entity.to_string()]);
        family.extend(descendants_of(&schemas, entity));
        self.shared.core.graph.lock().invalidate_entities(&family);
        self.shared.core.emit_entities(family);
    }

    fn coordinator(&self) -> &Arc<StoreCoordinator> {
        self.shared.core.coordinator()
    }

    fn fetcher(&self) -> Fetcher {
        Fetcher::new(self.shared.core.graph.clone(), self.coordinator().clone())
    }
}

#[async_trait]
impl WriteCapable for UpdateHandle {
    async fn create(&self, entity: &str) -> Result<Object> {
        let schemas = self.coordinator().schemas().await;
        if !schemas.contains_key(entity) {
            return Err(StackError::Configuration(format!(
                "unknown entity '{entity}'"
            )));
        }
        let id = self.shared.core.graph.lock().create(entity);
        Ok(Object::new(self.shared.core.graph.clone(), id))
    }

    async fn fetch_or_create(&self, entity: &str, predicate: &Predicate) -> Result<Object> {
        let pairs = predicate.equality_pairs()?;
        for (_, operand) in &pairs {
            if matches!(operand, Operand::Key(_)) {
                return Err(StackError::UnsupportedPredicateShape(
                    "key-to-key equality cannot seed a new object".into(),
                ));
            }
        }
        let request = FetchRequest::new(entity).filter(predicate.clone());
        match self.fetcher().fetch_one(request).await {
            Ok(object) => Ok(object),
            Err(error) if error.is_not_found() => {
                let object = self.create(entity).await?;
                for (key, operand) in pairs {
                    if let Operand::Value(value) = operand {
                        object.set(&key, value)?;
                    }
                }
                Ok(object)
            }
            Err(error) => Err(error),
        }
    }

    async fn delete(&self, object: &Object) -> Result<()> {
        self.shared.core.graph.lock().delete(&object.id());
        Ok(())
    }

    async fn delete_many(&self, objects: &[Object]) -> Result<()> {
        let mut graph = self.shared.core.graph.lock();
        for object in objects {
            graph.delete(&object.id());
        }
        Ok(())
    }

    async fn delete_all(&self, entity: &str, predicate: Option<&Predicate>) -> Result<usize> {
        let mut request = FetchRequest::new(entity);
        if let Some(predicate) = predicate {
            request = request.filter(predicate.clone());
        }
        let ids = self.fetcher().fetch_ids(request).await?;
        let count = ids.len();
        let mut graph = self.shared.core.graph.lock();
        for id in &ids {
            graph.delete(id);
        }
        Ok(count)
    }

    async fn adopt(&self, object: &Object) -> Result<Object> {
        let id = object.id();
        if self.shared.core.graph.lock().contains(&id) {
            return Ok(Object::new(self.shared.core.graph.clone(), id));
        }
        match self.coordinator().get_row(&id).await? {
            Some(data) => {
                self.shared.core.graph.lock().materialize(&id, data);
                Ok(Object::new(self.shared.core.graph.clone(), id))
            }
            None => Err(StackError::NotFound(id.entity().to_string())),
        }
    }
}

#[async_trait]
impl ReadCapable for UpdateHandle {
    async fn fetch_all(&self, request: FetchRequest) -> Result<Vec<Object>> {
        self.fetcher().fetch_all(request).await
    }

    async fn fetch_one(&self, request: FetchRequest) -> Result<Object> {
        self.fetcher().fetch_one(request).await
    }

    async fn fetch_ids(&self, request: FetchRequest) -> Result<Vec<ObjectId>> {
        self.fetcher().fetch_ids(request).await
    }

    async fn fetch_properties(&self, request: FetchRequest) -> Result<Vec<ObjectData>> {
        self.fetcher().fetch_properties(request).await
    }

    async fn count(&self, request: FetchRequest) -> Result<usize> {
        self.fetcher().count(request).await
    }

    async fn aggregate(&self, query: AggregateQuery) -> Result<Vec<AggregateRow>> {
        self.fetcher().aggregate(query).await
    }
}

impl std::fmt::Debug for UpdateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHandle")
            .field("context", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;

    use crate::context::MainContext;
    use crate::core::{AttributeKind, EntitySchema};
    use crate::facade::sink::ErrorSink;
    use crate::storage::MountOptions;
    use crate::update::origin::{OriginId, OriginOptions, StackWiring, TransactionOrigin};

    async fn store_origin() -> (TransactionOrigin, StackWiring) {
        let coordinator = Arc::new(StoreCoordinator::new());
        coordinator
            .mount(
                MountOptions::memory("primary"),
                vec![EntitySchema::new("Item")
                    .attribute("name", AttributeKind::Text)
                    .attribute("age", AttributeKind::Integer)],
            )
            .await
            .unwrap();
        let wiring = StackWiring {
            main: MainContext::new(coordinator.clone(), None),
            coordinator,
            root: None,
            sink: Arc::new(ErrorSink::new()),
            notices: broadcast::channel(16).0,
            open_contexts: Arc::new(AtomicUsize::new(0)),
        };
        let origin =
            TransactionOrigin::new(OriginId(7), OriginOptions::store(), wiring.clone()).unwrap();
        (origin, wiring)
    }

    #[tokio::test]
    async fn test_create_commit_notifies_and_persists() {
        let (origin, wiring) = store_origin().await;
        let mut notices = wiring.notices.subscribe();
        let context = origin.begin_update();

        context
            .perform_and_wait(|handle| async move {
                let item = handle.create("Item").await?;
                item.set("name", "a")?;
                item.set("age", 1i64)?;
                assert!(handle.commit().await?);
                Ok(())
            })
            .await
            .unwrap();

        assert!(wiring.sink.last_error().is_none());
        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.origin, OriginId(7));
        let rows = wiring.coordinator.fetch_rows("Item", true).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_without_changes_is_noop() {
        let (origin, wiring) = store_origin().await;
        let mut notices = wiring.notices.subscribe();
        let context = origin.begin_update();

        context
            .perform_and_wait(|handle| async move {
                assert!(!handle.commit().await?);
                Ok(())
            })
            .await
            .unwrap();

        assert!(notices.try_recv().is_err());
        assert_eq!(wiring.coordinator.stats().await.commits, 0);
    }

    #[tokio::test]
    async fn test_fetch_or_create_does_not_duplicate() {
        let (origin, wiring) = store_origin().await;
        let context = origin.begin_update();

        context
            .perform_and_wait(|handle| async move {
                let predicate = Predicate::and(vec![
                    Predicate::eq("name", "a"),
                    Predicate::eq("age", 1i64),
                ]);
                let first = handle.fetch_or_create("Item", &predicate).await?;
                assert_eq!(first.get("name"), Value::Text("a".into()));
                handle.commit().await?;

                let second = handle.fetch_or_create("Item", &predicate).await?;
                assert_eq!(second.id(), first.id());
                assert_eq!(handle.count(FetchRequest::new("Item")).await?, 1);
                Ok(())
            })
            .await
            .unwrap();
        assert!(wiring.sink.last_error().is_none());
    }

    #[tokio::test]
    async fn test_fetch_or_create_rejects_other_shapes() {
        let (origin, _wiring) = store_origin().await;
        let context = origin.begin_update();

        context
            .perform_and_wait(|handle| async move {
                let result = handle
                    .fetch_or_create("Item", &Predicate::gt("age", 1i64))
                    .await;
                assert!(matches!(
                    result,
                    Err(StackError::UnsupportedPredicateShape(_))
                ));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rollback_restores_committed_rows() {
        let (origin, wiring) = store_origin().await;
        let context = origin.begin_update();

        context
            .perform_and_wait(|handle| async move {
                let item = handle.create("Item").await?;
                item.set("name", "a")?;
                handle.commit().await?;

                item.set("name", "changed")?;
                let stray = handle.create("Item").await?;
                stray.set("name", "b")?;
                handle.rollback().await?;

                assert!(!handle.has_changes());
                assert_eq!(item.get("name"), Value::Text("a".into()));
                assert_eq!(handle.count(FetchRequest::new("Item")).await?, 1);
                Ok(())
            })
            .await
            .unwrap();
        assert!(wiring.sink.last_error().is_none());
    }

    #[tokio::test]
    async fn test_adopt_by_identity() {
        let (origin, _wiring) = store_origin().await;
        let writer = origin.begin_update();

        writer
            .perform_and_wait(|handle| async move {
                let item = handle.create("Item").await?;
                item.set("name", "shared")?;
                handle.commit().await?;
                Ok(())
            })
            .await
            .unwrap();

        let reader = origin.begin_update();
        reader
            .perform_and_wait(|handle| async move {
                let committed = handle
                    .fetch_one(FetchRequest::new("Item").filter(Predicate::eq("name", "shared")))
                    .await?;
                let adopted = handle.adopt(&committed).await?;
                assert_eq!(adopted.get("name"), Value::Text("shared".into()));

                let ghost = handle.create("Item").await?;
                handle.rollback().await?;
                assert!(matches!(
                    handle.adopt(&ghost).await,
                    Err(StackError::NotFound(_))
                ));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_batch_update_invalidates_materialized_rows() {
        let (origin, wiring) = store_origin().await;
        let context = origin.begin_update();

        context
            .perform_and_wait(|handle| async move {
                let item = handle.create("Item").await?;
                item.set("name", "a")?;
                item.set("age", 1i64)?;
                handle.commit().await?;

                // Materialize, then mutate underneath through the store.
                let held = handle
                    .fetch_one(FetchRequest::new("Item").filter(Predicate::eq("name", "a")))
                    .await?;
                let mut changes = HashMap::new();
                changes.insert("age".to_string(), Value::Integer(42));
                let touched = handle.batch_update("Item", None, &changes).await?;
                assert_eq!(touched.len(), 1);

                // The stale materialized copy is gone; a fresh fetch sees
                // the store's new value.
                let fresh = handle
                    .fetch_one(FetchRequest::new("Item").filter(Predicate::eq("name", "a")))
                    .await?;
                assert_eq!(fresh.get("age"), Value::Integer(42));
                assert_eq!(held.id(), fresh.id());
                Ok(())
            })
            .await
            .unwrap();
        assert!(wiring.sink.last_error().is_none());
    }

    #[tokio::test]
    async fn test_body_error_routes_to_sink() {
        let (origin, wiring) = store_origin().await;
        let context = origin.begin_update();

        context
            .perform_and_wait(|handle| async move {
                handle.create("Ghost").await?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            wiring.sink.last_error(),
            Some(StackError::Configuration(_))
        ));
    }
}

//! The long-lived read context that UI-facing code observes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::context::base::{ContextCore, GraphChange};
use crate::context::Object;
use crate::core::{ObjectData, ObjectId, Result};
use crate::fetch::{FetchRequest, Fetcher, ReadCapable};
use crate::query::{AggregateQuery, AggregateRow};
use crate::storage::StoreCoordinator;

/// Read surface of the stack. Committed changes from update contexts are
/// merged in over its lane; fetches overlay its graph on stored rows.
///
/// Cloning is cheap and every clone observes the same graph.
#[derive(Clone)]
pub struct MainContext {
    core: Arc<ContextCore>,
}

impl MainContext {
    /// When `parent` is absent the main context sits at the top of the
    /// chain and publishes save events itself.
    pub(crate) fn new(
        coordinator: Arc<StoreCoordinator>,
        parent: Option<Arc<ContextCore>>,
    ) -> Self {
        let publishes_saves = parent.is_none();
        Self {
            core: ContextCore::new("main", parent, coordinator, publishes_saves),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ContextCore> {
        &self.core
    }

    /// Change feed: fires whenever committed changes are merged into this
    /// context's graph.
    pub fn subscribe(&self) -> broadcast::Receiver<GraphChange> {
        self.core.subscribe_graph()
    }

    /// Drops every row and pending flag from the graph and tells
    /// observers to rebuild from scratch. Runs on the context lane so it
    /// cannot interleave with a merge.
    pub async fn reset(&self) -> Result<()> {
        let core = self.core.clone();
        self.core
            .lane
            .run(move || async move {
                core.graph.lock().reset();
                core.emit_all_changed();
            })
            .await
    }

    /// Resolves once every merge enqueued before the call has landed.
    pub async fn wait(&self) -> Result<()> {
        self.core.lane.barrier().await
    }

    /// Committed row for `id` as this context currently sees it.
    pub async fn existing_data(&self, id: &ObjectId) -> Result<Option<ObjectData>> {
        if let Some(data) = self.core.graph.lock().data(id) {
            return Ok(Some(data));
        }
        self.core.coordinator().get_row(id).await
    }

    /// Number of rows materialized in this context's graph.
    pub fn materialized_count(&self) -> usize {
        self.core.graph.lock().row_count()
    }

    fn fetcher(&self) -> Fetcher {
        Fetcher::new(self.core.graph.clone(), self.core.coordinator().clone())
    }
}

#[async_trait]
impl ReadCapable for MainContext {
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

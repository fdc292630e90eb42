use std::collections::HashSet;
use std::sync::Arc;

use async_recursion::async_recursion;
use tokio::sync::broadcast;
use tracing::debug;

use crate::context::graph::SharedGraph;
use crate::context::lane::Lane;
use crate::core::Result;
use crate::storage::{ChangeSet, StoreCoordinator};

const GRAPH_EVENT_CAPACITY: usize = 256;
const SAVE_EVENT_CAPACITY: usize = 64;

/// Emitted on a context's event channel when its graph changes behind the
/// readers' backs: cascade merges, committed-change replay, reset.
#[derive(Debug, Clone)]
pub enum GraphChange {
    Entities(HashSet<String>),
    /// The whole object cache was dropped.
    All,
}

impl GraphChange {
    pub fn touches_any(&self, entities: &HashSet<String>) -> bool {
        match self {
            Self::All => true,
            Self::Entities(touched) => !touched.is_disjoint(entities),
        }
    }

    fn from_changes(changes: &ChangeSet) -> Self {
        let mut entities = HashSet::new();
        for (id, _) in changes.inserts.iter().chain(changes.updates.iter()) {
            entities.insert(id.entity().to_string());
        }
        for id in &changes.deletes {
            entities.insert(id.entity().to_string());
        }
        Self::Entities(entities)
    }
}

/// Published by a context that commits straight to the coordinator, after
/// each successful save. Auto-merge subscriptions replay these into the
/// main context.
#[derive(Debug, Clone)]
pub struct SaveEvent {
    pub changes: ChangeSet,
}

/// State every context shares: a private graph, a private lane, an optional
/// parent, and the coordinator at the bottom of the chain.
pub(crate) struct ContextCore {
    name: String,
    pub(crate) graph: SharedGraph,
    pub(crate) lane: Arc<Lane>,
    parent: Option<Arc<ContextCore>>,
    coordinator: Arc<StoreCoordinator>,
    graph_events: broadcast::Sender<GraphChange>,
    save_events: Option<broadcast::Sender<SaveEvent>>,
}

impl ContextCore {
    pub(crate) fn new(
        name: impl Into<String>,
        parent: Option<Arc<ContextCore>>,
        coordinator: Arc<StoreCoordinator>,
        publishes_save_events: bool,
    ) -> Arc<Self> {
        let name = name.into();
        let save_events = publishes_save_events
            .then(|| broadcast::channel(SAVE_EVENT_CAPACITY).0);
        Arc::new(Self {
            graph: SharedGraph::new(),
            lane: Arc::new(Lane::new(name.clone())),
            name,
            parent,
            coordinator,
            graph_events: broadcast::channel(GRAPH_EVENT_CAPACITY).0,
            save_events,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn coordinator(&self) -> &Arc<StoreCoordinator> {
        &self.coordinator
    }

    pub(crate) fn subscribe_graph(&self) -> broadcast::Receiver<GraphChange> {
        self.graph_events.subscribe()
    }

    pub(crate) fn subscribe_saves(&self) -> Option<broadcast::Receiver<SaveEvent>> {
        self.save_events.as_ref().map(|sender| sender.subscribe())
    }

    pub(crate) fn emit_changed(&self, changes: &ChangeSet) {
        if self.graph_events.receiver_count() == 0 {
            return;
        }
        let _ = self.graph_events.send(GraphChange::from_changes(changes));
    }

    pub(crate) fn emit_all_changed(&self) {
        if self.graph_events.receiver_count() == 0 {
            return;
        }
        let _ = self.graph_events.send(GraphChange::All);
    }

    pub(crate) fn emit_entities(&self, entities: HashSet<String>) {
        if self.graph_events.receiver_count() == 0 || entities.is_empty() {
            return;
        }
        let _ = self.graph_events.send(GraphChange::Entities(entities));
    }

    /// Replay committed changes from elsewhere into this graph, on this
    /// context's lane.
    pub(crate) async fn merge_committed(self: &Arc<Self>, changes: ChangeSet) -> Result<()> {
        let target = self.clone();
        self.lane
            .run(move || async move {
                target.graph.lock().merge_committed(&changes);
                target.emit_changed(&changes);
            })
            .await
    }
}

/// Drive one save through the context chain. Must be called on `core`'s
/// lane.
///
/// With nothing pending this is a no-op and reports `false`. Otherwise
/// temporary identities get permanent keys, the pending set transfers into
/// the parent graph (one unit on the parent's lane, which then saves the
/// parent the same way), and only the chain's top talks to the coordinator.
/// A failure above leaves the changes parked at the level that could not
/// push them further; levels below have already cleared.
#[async_recursion]
pub(crate) async fn save_cascade(core: Arc<ContextCore>) -> Result<bool> {
    let mut pending = core.graph.lock().pending_changes();
    if pending.is_empty() {
        return Ok(false);
    }

    let temporary = pending.temporary_ids();
    if !temporary.is_empty() {
        let mapping = core.coordinator.assign_permanent_ids(&temporary).await?;
        core.graph.lock().apply_id_mapping(&mapping);
        pending.remap(&mapping);
    }

    match &core.parent {
        Some(parent) => {
            let hop = parent.clone();
            let child_graph = core.graph.clone();
            debug!(
                context = %core.name,
                parent = %parent.name(),
                changes = pending.len(),
                "saving into parent"
            );
            parent
                .lane
                .run(move || async move {
                    hop.graph.lock().merge_pending(&pending);
                    child_graph.lock().clear_pending();
                    hop.emit_changed(&pending);
                    save_cascade(hop).await
                })
                .await?
        }
        None => {
            core.coordinator.commit(&pending).await?;
            core.graph.lock().clear_pending();
            debug!(context = %core.name, changes = pending.len(), "committed to store");
            if let Some(save_events) = &core.save_events
                && save_events.receiver_count() > 0
            {
                let _ = save_events.send(SaveEvent { changes: pending });
            }
            Ok(true)
        }
    }
}

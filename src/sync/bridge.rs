//! Bridges change batches onto a bound list: collect, reconcile, notify.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sync::edits::{order_edits, BoundList};
use crate::sync::result_set::{ListEvent, ResultSet, SectionSnapshot};

const CHANGED_CAPACITY: usize = 16;

/// Pure reshaping function applied to the full sectioned snapshot while
/// a post-filter is active.
pub type SnapshotFilter = dyn Fn(&SectionSnapshot) -> SectionSnapshot + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Collecting,
    Reconciling,
}

/// How the last batch reached the bound list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileKind {
    /// One ordered edit transaction.
    Incremental,
    /// Whole content replaced from the snapshot.
    FullReload,
    /// Whole content replaced from the filtered snapshot.
    FilteredReload,
}

/// Checks whether an item-update's path collides with a structural edit
/// in the same batch: the path is also deleted or a move source
/// (pre-batch side), inserted or a move destination (post-batch side),
/// or its section is inserted or deleted. A torn batch like that cannot
/// be applied as one edit transaction.
fn collides(events: &[ListEvent]) -> bool {
    let mut pre = HashSet::new();
    let mut post = HashSet::new();
    let mut gone_sections = HashSet::new();
    let mut born_sections = HashSet::new();
    for event in events {
        match event {
            ListEvent::DeleteItem { path } => {
                pre.insert(*path);
            }
            ListEvent::InsertItem { path } => {
                post.insert(*path);
            }
            ListEvent::MoveItem { from, to } => {
                pre.insert(*from);
                post.insert(*to);
            }
            ListEvent::DeleteSection { index } => {
                gone_sections.insert(*index);
            }
            ListEvent::InsertSection { index } => {
                born_sections.insert(*index);
            }
            ListEvent::UpdateItem { .. } => {}
        }
    }
    events.iter().any(|event| {
        if let ListEvent::UpdateItem { path } = event {
            pre.contains(path)
                || post.contains(path)
                || gone_sections.contains(&path.section)
                || born_sections.contains(&path.section)
        } else {
            false
        }
    })
}

// ===== Bridge =====

/// Applies change batches to one bound list.
///
/// Follows Idle → Collecting → Reconciling per batch: `will_change`
/// opens the batch, `record` buffers atomic events, `did_change` resolves
/// them into either one ordered edit transaction or one full reload.
/// While a filter is active every batch becomes a filtered reload.
pub struct ListBridge<L> {
    list: L,
    state: BridgeState,
    buffer: Vec<ListEvent>,
    filter: Option<Arc<SnapshotFilter>>,
    batch_filter: Option<Arc<SnapshotFilter>>,
    gate: Arc<Mutex<()>>,
    last_outcome: Option<ReconcileKind>,
    changed: broadcast::Sender<()>,
}

impl<L: BoundList + Send> ListBridge<L> {
    pub fn new(list: L) -> Self {
        let (changed, _) = broadcast::channel(CHANGED_CAPACITY);
        Self {
            list,
            state: BridgeState::Idle,
            buffer: Vec::new(),
            filter: None,
            batch_filter: None,
            gate: Arc::new(Mutex::new(())),
            last_outcome: None,
            changed,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn last_outcome(&self) -> Option<ReconcileKind> {
        self.last_outcome
    }

    pub fn list(&self) -> &L {
        &self.list
    }

    pub fn list_mut(&mut self) -> &mut L {
        &mut self.list
    }

    /// Installs a post-filter. Takes effect from the next batch on; the
    /// running batch keeps the filter state it saw at will-change.
    pub fn set_filter<F>(&mut self, filter: F)
    where
        F: Fn(&SectionSnapshot) -> SectionSnapshot + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Fires after every resolved batch, whichever path it took.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.changed.subscribe()
    }

    /// Opens a batch: clears buffered state and pins the current filter
    /// for the whole batch.
    pub fn will_change(&mut self) {
        if self.state != BridgeState::Idle {
            warn!(state = ?self.state, "will-change while a batch is open, dropping it");
        }
        self.buffer.clear();
        self.batch_filter = self.filter.clone();
        self.state = BridgeState::Collecting;
    }

    /// Buffers one atomic event. Nothing reaches the bound list until
    /// did-change.
    pub fn record(&mut self, event: ListEvent) {
        if self.state != BridgeState::Collecting {
            warn!(?event, "event outside an open batch, ignoring");
            return;
        }
        self.buffer.push(event);
    }

    /// Resolves the open batch against the post-batch snapshot.
    pub async fn did_change(&mut self, snapshot: &SectionSnapshot) -> ReconcileKind {
        if self.state != BridgeState::Collecting {
            warn!(state = ?self.state, "did-change without will-change, reloading");
            self.reload(snapshot).await;
            return self.last_outcome.unwrap_or(ReconcileKind::FullReload);
        }
        self.state = BridgeState::Reconciling;
        let events = std::mem::take(&mut self.buffer);
        let batch_filter = self.batch_filter.take();

        // One edit transaction at a time; a new batch waits here until
        // the previous completion resolves.
        let _slot = self.gate.clone().lock_owned().await;
        let kind = if let Some(filter) = batch_filter {
            self.list.reload(&filter(snapshot)).await;
            ReconcileKind::FilteredReload
        } else if !self.list.is_attached() {
            self.list.reload(snapshot).await;
            ReconcileKind::FullReload
        } else if collides(&events) {
            debug!("item update collides with a structural edit, reloading");
            self.list.reload(snapshot).await;
            ReconcileKind::FullReload
        } else {
            let script = order_edits(&events);
            self.list.apply(&script, snapshot).await;
            ReconcileKind::Incremental
        };

        self.state = BridgeState::Idle;
        self.last_outcome = Some(kind);
        let _ = self.changed.send(());
        kind
    }

    /// Forces a full reload from the snapshot, discarding any open batch.
    pub async fn reload(&mut self, snapshot: &SectionSnapshot) {
        let _slot = self.gate.clone().lock_owned().await;
        let shaped = self.filter.as_ref().map(|filter| filter(snapshot));
        self.list.reload(shaped.as_ref().unwrap_or(snapshot)).await;
        self.buffer.clear();
        self.batch_filter = None;
        self.state = BridgeState::Idle;
        self.last_outcome = Some(match shaped {
            Some(_) => ReconcileKind::FilteredReload,
            None => ReconcileKind::FullReload,
        });
        let _ = self.changed.send(());
    }
}

impl<L> fmt::Debug for ListBridge<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListBridge")
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("filtered", &self.filter.is_some())
            .field("last_outcome", &self.last_outcome)
            .finish()
    }
}

// ===== Driver =====

/// Background task feeding a projection's change batches through a
/// bridge: will-change, the batch's events, did-change, one batch at a
/// time. A lagging feed falls back to a full reload from the current
/// snapshot.
pub struct BridgeDriver {
    task: JoinHandle<()>,
}

impl BridgeDriver {
    pub fn spawn<L>(results: &ResultSet, bridge: Arc<Mutex<ListBridge<L>>>) -> Self
    where
        L: BoundList + Send + 'static,
    {
        let mut feed = results.subscribe();
        let state = results.state_handle();
        let task = tokio::spawn(async move {
            let (mut covered, initial) = {
                let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                (state.generation, state.snapshot.clone())
            };
            bridge.lock().await.reload(&initial).await;

            loop {
                match feed.recv().await {
                    // Reloads cover every generation up to the snapshot
                    // they came from; older batches must not replay on
                    // top of one.
                    Ok(batch) if batch.generation <= covered => continue,
                    Ok(batch) if batch.generation > covered + 1 => {
                        warn!(
                            have = covered,
                            got = batch.generation,
                            "generation gap in change batches, reloading list"
                        );
                        covered = batch.generation;
                        bridge.lock().await.reload(&batch.snapshot).await;
                    }
                    Ok(batch) => {
                        covered = batch.generation;
                        let mut bridge = bridge.lock().await;
                        bridge.will_change();
                        for event in &batch.events {
                            bridge.record(event.clone());
                        }
                        bridge.did_change(&batch.snapshot).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change batches lagged, reloading list");
                        let (generation, snapshot) = {
                            let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                            (state.generation, state.snapshot.clone())
                        };
                        covered = generation;
                        bridge.lock().await.reload(&snapshot).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { task }
    }
}

impl Drop for BridgeDriver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for BridgeDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeDriver")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

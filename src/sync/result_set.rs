//! Live sectioned query projections and the change batches they emit.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::{GraphChange, MainContext};
use crate::core::{ObjectData, ObjectId, Result};
use crate::fetch::{FetchRequest, Fetcher};
use crate::storage::coordinator::descendants_of;

const BATCH_CAPACITY: usize = 32;

// ===== Sectioned snapshots =====

/// Position of one item: section index, then item index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemPath {
    pub section: usize,
    pub item: usize,
}

impl ItemPath {
    pub fn new(section: usize, item: usize) -> Self {
        Self { section, item }
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.section, self.item)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: ObjectId,
    pub data: ObjectData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub key: String,
    pub items: Vec<Entry>,
}

/// Full two-dimensional state of a projection at one instant: ordered
/// sections, each an ordered run of entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SectionSnapshot {
    pub sections: Vec<Section>,
}

impl SectionSnapshot {
    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn entry(&self, path: ItemPath) -> Option<&Entry> {
        self.sections.get(path.section)?.items.get(path.item)
    }
}

// ===== Change events =====

/// One atomic change between two snapshots. Deletes, moves-from and
/// updates address pre-batch positions; inserts and moves-to address
/// post-batch positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEvent {
    InsertSection { index: usize },
    DeleteSection { index: usize },
    InsertItem { path: ItemPath },
    DeleteItem { path: ItemPath },
    MoveItem { from: ItemPath, to: ItemPath },
    UpdateItem { path: ItemPath },
}

/// One complete change notification: every atomic event plus the
/// post-batch snapshot they lead to. Generations count re-evaluations;
/// consumers that resynchronized from a snapshot skip batches at or
/// below the generation they loaded.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub events: Vec<ListEvent>,
    pub snapshot: SectionSnapshot,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProjectionState {
    pub(crate) generation: u64,
    pub(crate) snapshot: SectionSnapshot,
}

// ===== Snapshot construction and diffing =====

/// Groups fetched rows into sections. Without a section key everything
/// lands in one unnamed section; with one, sections order ascending by
/// the rendered key and items keep fetch order.
pub(crate) fn build_snapshot(
    rows: Vec<(ObjectId, ObjectData)>,
    section_key: Option<&str>,
) -> SectionSnapshot {
    let entries = rows.into_iter().map(|(id, data)| Entry { id, data });
    let Some(key) = section_key else {
        return SectionSnapshot {
            sections: vec![Section {
                key: String::new(),
                items: entries.collect(),
            }],
        };
    };

    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<Entry>> = HashMap::new();
    for entry in entries {
        let section = entry
            .data
            .get(key)
            .map(|value| value.to_string())
            .unwrap_or_default();
        if !grouped.contains_key(&section) {
            order.push(section.clone());
        }
        grouped.entry(section).or_default().push(entry);
    }
    order.sort();

    SectionSnapshot {
        sections: order
            .into_iter()
            .map(|key| {
                let items = grouped.remove(&key).unwrap_or_default();
                Section { key, items }
            })
            .collect(),
    }
}

/// Computes the atomic events turning `old` into `new`.
///
/// Sections match by key, items by identity. An item only counts as
/// moved when its section key changes or its order relative to the
/// other surviving items changes; index shifts caused by neighbouring
/// inserts and deletes carry no event of their own. Item events inside
/// inserted or deleted sections are subsumed by the section event.
pub(crate) fn diff_snapshots(old: &SectionSnapshot, new: &SectionSnapshot) -> Vec<ListEvent> {
    let mut events = Vec::new();

    let old_keys: HashSet<&str> = old.sections.iter().map(|s| s.key.as_str()).collect();
    let new_keys: HashSet<&str> = new.sections.iter().map(|s| s.key.as_str()).collect();

    let mut deleted_sections: HashSet<usize> = HashSet::new();
    for (index, section) in old.sections.iter().enumerate() {
        if !new_keys.contains(section.key.as_str()) {
            deleted_sections.insert(index);
            events.push(ListEvent::DeleteSection { index });
        }
    }
    let mut inserted_sections: HashSet<usize> = HashSet::new();
    for (index, section) in new.sections.iter().enumerate() {
        if !old_keys.contains(section.key.as_str()) {
            inserted_sections.insert(index);
            events.push(ListEvent::InsertSection { index });
        }
    }

    let mut old_pos: HashMap<&ObjectId, ItemPath> = HashMap::new();
    for (s, section) in old.sections.iter().enumerate() {
        for (i, entry) in section.items.iter().enumerate() {
            old_pos.insert(&entry.id, ItemPath::new(s, i));
        }
    }
    let mut new_pos: HashMap<&ObjectId, ItemPath> = HashMap::new();
    for (s, section) in new.sections.iter().enumerate() {
        for (i, entry) in section.items.iter().enumerate() {
            new_pos.insert(&entry.id, ItemPath::new(s, i));
        }
    }

    for (s, section) in old.sections.iter().enumerate() {
        if deleted_sections.contains(&s) {
            continue;
        }
        for (i, entry) in section.items.iter().enumerate() {
            if !new_pos.contains_key(&entry.id) {
                events.push(ListEvent::DeleteItem {
                    path: ItemPath::new(s, i),
                });
            }
        }
    }

    // Survivors in old traversal order get a running rank; a survivor
    // keeps its place when its rank sequence stays increasing in the new
    // traversal (longest increasing subsequence), otherwise it moved.
    let mut old_rank: HashMap<&ObjectId, usize> = HashMap::new();
    for section in &old.sections {
        for entry in &section.items {
            if new_pos.contains_key(&entry.id) {
                let rank = old_rank.len();
                old_rank.insert(&entry.id, rank);
            }
        }
    }

    let mut survivors: Vec<(&Entry, ItemPath, ItemPath)> = Vec::new();
    let mut ranks: Vec<usize> = Vec::new();
    for (s, section) in new.sections.iter().enumerate() {
        for (i, entry) in section.items.iter().enumerate() {
            match old_pos.get(&entry.id) {
                None => {
                    if !inserted_sections.contains(&s) {
                        events.push(ListEvent::InsertItem {
                            path: ItemPath::new(s, i),
                        });
                    }
                }
                Some(&from) => {
                    survivors.push((entry, from, ItemPath::new(s, i)));
                    ranks.push(old_rank[&entry.id]);
                }
            }
        }
    }

    let stable = longest_increasing(&ranks);
    for (position, (entry, from, to)) in survivors.into_iter().enumerate() {
        let key_changed = old.sections[from.section].key != new.sections[to.section].key;
        if key_changed || !stable.contains(&position) {
            events.push(ListEvent::MoveItem { from, to });
        } else if old.sections[from.section].items[from.item].data != entry.data {
            events.push(ListEvent::UpdateItem { path: from });
        }
    }

    events
}

/// Positions within `seq` forming one longest strictly increasing
/// subsequence (patience sorting with parent links).
fn longest_increasing(seq: &[usize]) -> HashSet<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut parents: Vec<Option<usize>> = vec![None; seq.len()];
    for (position, &value) in seq.iter().enumerate() {
        let slot = tails.partition_point(|&t| seq[t] < value);
        if slot > 0 {
            parents[position] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(position);
        } else {
            tails[slot] = position;
        }
    }

    let mut stable = HashSet::new();
    let mut cursor = tails.last().copied();
    while let Some(position) = cursor {
        stable.insert(position);
        cursor = parents[position];
    }
    stable
}

// ===== Live projection =====

/// Live sectioned projection of one fetch request over the main context.
///
/// Re-evaluates whenever the context reports changes touching the target
/// entity family, then broadcasts one [`ChangeBatch`] per re-evaluation.
pub struct ResultSet {
    fetcher: Fetcher,
    request: FetchRequest,
    section_key: Option<String>,
    state: Arc<Mutex<ProjectionState>>,
    batches: broadcast::Sender<ChangeBatch>,
    refresh_task: JoinHandle<()>,
}

impl ResultSet {
    pub async fn new(
        main: &MainContext,
        request: FetchRequest,
        section_key: Option<String>,
    ) -> Result<Self> {
        let core = main.core();
        let fetcher = Fetcher::new(core.graph.clone(), core.coordinator().clone());

        let schemas = core.coordinator().schemas().await;
        let mut family: HashSet<String> = HashSet::from([request.entity.clone()]);
        family.extend(descendants_of(&schemas, &request.entity));

        // Subscribe before the first evaluation so nothing lands unseen
        // in between.
        let mut feed = main.subscribe();
        let initial = build_snapshot(
            fetcher.rows(request.clone()).await?,
            section_key.as_deref(),
        );
        let state = Arc::new(Mutex::new(ProjectionState {
            generation: 0,
            snapshot: initial,
        }));
        let (batches, _) = broadcast::channel(BATCH_CAPACITY);

        let refresh_task = {
            let fetcher = fetcher.clone();
            let request = request.clone();
            let section_key = section_key.clone();
            let state = state.clone();
            let batches = batches.clone();
            tokio::spawn(async move {
                loop {
                    let relevant = match feed.recv().await {
                        Ok(GraphChange::All) => true,
                        Ok(change) => change.touches_any(&family),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "change feed lagged, re-evaluating projection");
                            true
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if !relevant {
                        continue;
                    }
                    if let Err(error) = Self::re_evaluate(
                        &fetcher,
                        &request,
                        section_key.as_deref(),
                        &state,
                        &batches,
                    )
                    .await
                    {
                        warn!(error = %error, "projection refresh failed");
                    }
                }
            })
        };

        Ok(Self {
            fetcher,
            request,
            section_key,
            state,
            batches,
            refresh_task,
        })
    }

    /// Current post-batch state.
    pub fn snapshot(&self) -> SectionSnapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    pub fn item_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .item_count()
    }

    /// Change feed; one batch per re-evaluation that produced events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.batches.subscribe()
    }

    pub(crate) fn state_handle(&self) -> Arc<Mutex<ProjectionState>> {
        self.state.clone()
    }

    /// Re-evaluates immediately instead of waiting for a context change.
    pub async fn refresh(&self) -> Result<()> {
        Self::re_evaluate(
            &self.fetcher,
            &self.request,
            self.section_key.as_deref(),
            &self.state,
            &self.batches,
        )
        .await
    }

    async fn re_evaluate(
        fetcher: &Fetcher,
        request: &FetchRequest,
        section_key: Option<&str>,
        state: &Arc<Mutex<ProjectionState>>,
        batches: &broadcast::Sender<ChangeBatch>,
    ) -> Result<()> {
        let fresh = build_snapshot(fetcher.rows(request.clone()).await?, section_key);
        let (events, generation) = {
            let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
            let events = diff_snapshots(&current.snapshot, &fresh);
            if events.is_empty() {
                return Ok(());
            }
            current.generation += 1;
            current.snapshot = fresh.clone();
            (events, current.generation)
        };
        debug!(events = events.len(), generation, "projection changed");
        let _ = batches.send(ChangeBatch {
            events,
            snapshot: fresh,
            generation,
        });
        Ok(())
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("entity", &self.request.entity)
            .field("section_key", &self.section_key)
            .field("items", &self.item_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn entry(entity: &str, key: u64, name: &str, group: &str) -> (ObjectId, ObjectData) {
        let id = ObjectId::permanent(entity, key);
        let mut data = ObjectData::new();
        data.insert("name".into(), Value::Text(name.into()));
        data.insert("group".into(), Value::Text(group.into()));
        (id, data)
    }

    fn snapshot(rows: Vec<(ObjectId, ObjectData)>) -> SectionSnapshot {
        build_snapshot(rows, Some("group"))
    }

    #[test]
    fn test_build_snapshot_groups_and_orders_sections() {
        let snapshot = snapshot(vec![
            entry("Item", 1, "a", "z"),
            entry("Item", 2, "b", "a"),
            entry("Item", 3, "c", "z"),
        ]);
        assert_eq!(snapshot.section_count(), 2);
        assert_eq!(snapshot.sections[0].key, "a");
        assert_eq!(snapshot.sections[1].key, "z");
        assert_eq!(snapshot.sections[1].items.len(), 2);
        assert_eq!(snapshot.item_count(), 3);
    }

    #[test]
    fn test_diff_reports_insert_delete_update() {
        let old = snapshot(vec![
            entry("Item", 1, "a", "g"),
            entry("Item", 2, "b", "g"),
        ]);
        let new = snapshot(vec![
            entry("Item", 1, "a-edited", "g"),
            entry("Item", 3, "c", "g"),
        ]);
        let events = diff_snapshots(&old, &new);

        assert!(events.contains(&ListEvent::DeleteItem {
            path: ItemPath::new(0, 1)
        }));
        assert!(events.contains(&ListEvent::InsertItem {
            path: ItemPath::new(0, 1)
        }));
        assert!(events.contains(&ListEvent::UpdateItem {
            path: ItemPath::new(0, 0)
        }));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_diff_reports_move_across_sections() {
        let old = snapshot(vec![
            entry("Item", 1, "a", "g1"),
            entry("Item", 2, "b", "g2"),
        ]);
        let new = snapshot(vec![
            entry("Item", 1, "a", "g2"),
            entry("Item", 2, "b", "g2"),
        ]);
        let events = diff_snapshots(&old, &new);

        // Only the section-changer moves; "b" merely shifted below it.
        assert_eq!(
            events,
            vec![
                ListEvent::DeleteSection { index: 0 },
                ListEvent::MoveItem {
                    from: ItemPath::new(0, 0),
                    to: ItemPath::new(0, 0),
                },
            ]
        );
    }

    #[test]
    fn test_diff_reports_reorder_as_single_move() {
        let old = snapshot(vec![
            entry("Item", 1, "a", "g"),
            entry("Item", 2, "b", "g"),
            entry("Item", 3, "c", "g"),
        ]);
        let new = snapshot(vec![
            entry("Item", 1, "a", "g"),
            entry("Item", 3, "c", "g"),
            entry("Item", 2, "b", "g"),
        ]);
        let events = diff_snapshots(&old, &new);

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ListEvent::MoveItem { .. }));
    }

    #[test]
    fn test_diff_subsumes_items_of_inserted_section() {
        let old = snapshot(vec![entry("Item", 1, "a", "g1")]);
        let new = snapshot(vec![
            entry("Item", 1, "a", "g1"),
            entry("Item", 2, "b", "g2"),
            entry("Item", 3, "c", "g2"),
        ]);
        let events = diff_snapshots(&old, &new);

        assert_eq!(events, vec![ListEvent::InsertSection { index: 1 }]);
    }

    #[test]
    fn test_diff_ignores_section_shift_without_reorder() {
        let old = snapshot(vec![
            entry("Item", 1, "a", "m"),
            entry("Item", 2, "b", "m"),
        ]);
        // New section "a" lands above "m"; items of "m" keep their
        // in-section order and must not show up as moves.
        let new = snapshot(vec![
            entry("Item", 3, "c", "a"),
            entry("Item", 1, "a", "m"),
            entry("Item", 2, "b", "m"),
        ]);
        let events = diff_snapshots(&old, &new);

        assert_eq!(events, vec![ListEvent::InsertSection { index: 0 }]);
    }
}

//! Ordered edit scripts and the surface a bound list implements.

use async_trait::async_trait;

use crate::core::ObjectId;
use crate::sync::result_set::{ItemPath, ListEvent, SectionSnapshot};

// ===== Edit ordering =====

/// Sorts a batch of atomic events into safe application order: section
/// deletes then item deletes (pre-batch positions, descending), section
/// inserts then item inserts (post-batch positions, ascending), then
/// moves, then updates. Applying the result one event at a time never
/// addresses an index the preceding events have shifted.
pub fn order_edits(events: &[ListEvent]) -> Vec<ListEvent> {
    let mut section_deletes = Vec::new();
    let mut item_deletes = Vec::new();
    let mut section_inserts = Vec::new();
    let mut item_inserts = Vec::new();
    let mut moves = Vec::new();
    let mut updates = Vec::new();

    for event in events {
        match event {
            ListEvent::DeleteSection { index } => section_deletes.push(*index),
            ListEvent::DeleteItem { path } => item_deletes.push(*path),
            ListEvent::InsertSection { index } => section_inserts.push(*index),
            ListEvent::InsertItem { path } => item_inserts.push(*path),
            ListEvent::MoveItem { from, to } => moves.push((*from, *to)),
            ListEvent::UpdateItem { path } => updates.push(*path),
        }
    }

    section_deletes.sort_unstable_by(|a, b| b.cmp(a));
    item_deletes.sort_unstable_by(|a, b| b.cmp(a));
    section_inserts.sort_unstable();
    item_inserts.sort_unstable();
    moves.sort_unstable_by_key(|(_, to)| *to);
    updates.sort_unstable();

    let mut script = Vec::with_capacity(events.len());
    script.extend(
        section_deletes
            .into_iter()
            .map(|index| ListEvent::DeleteSection { index }),
    );
    script.extend(
        item_deletes
            .into_iter()
            .map(|path| ListEvent::DeleteItem { path }),
    );
    script.extend(
        section_inserts
            .into_iter()
            .map(|index| ListEvent::InsertSection { index }),
    );
    script.extend(
        item_inserts
            .into_iter()
            .map(|path| ListEvent::InsertItem { path }),
    );
    script.extend(
        moves
            .into_iter()
            .map(|(from, to)| ListEvent::MoveItem { from, to }),
    );
    script.extend(
        updates
            .into_iter()
            .map(|path| ListEvent::UpdateItem { path }),
    );
    script
}

// ===== Bound list surface =====

/// What a rendered list must offer the bridge: either replace its whole
/// content from a snapshot or play back one ordered edit script. The
/// snapshot passed alongside a script is the post-batch state and serves
/// as the data source for inserted content.
#[async_trait]
pub trait BoundList {
    /// Whether a rendering surface is currently attached. Detached lists
    /// receive full reloads instead of edit scripts.
    fn is_attached(&self) -> bool;

    async fn reload(&mut self, snapshot: &SectionSnapshot);

    async fn apply(&mut self, script: &[ListEvent], snapshot: &SectionSnapshot);
}

// ===== Reference implementation =====

/// In-memory bound list mirroring section and item identities. Plays
/// edit scripts for real (two phases over pre- and post-batch indices)
/// and keeps a log of everything applied.
#[derive(Debug, Default)]
pub struct SectionedList {
    attached: bool,
    sections: Vec<Vec<ObjectId>>,
    log: Vec<ListEvent>,
    reloads: usize,
}

impl SectionedList {
    pub fn new() -> Self {
        Self {
            attached: true,
            ..Self::default()
        }
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attach(&mut self) {
        self.attached = true;
    }

    pub fn sections(&self) -> &[Vec<ObjectId>] {
        &self.sections
    }

    pub fn item_count(&self) -> usize {
        self.sections.iter().map(Vec::len).sum()
    }

    pub fn reloads(&self) -> usize {
        self.reloads
    }

    pub fn log(&self) -> &[ListEvent] {
        &self.log
    }

    fn id_at(snapshot: &SectionSnapshot, path: ItemPath) -> Option<ObjectId> {
        snapshot.entry(path).map(|entry| entry.id.clone())
    }

    fn play(&mut self, script: &[ListEvent], snapshot: &SectionSnapshot) {
        let mut item_removals: Vec<ItemPath> = Vec::new();
        let mut section_removals: Vec<usize> = Vec::new();
        let mut item_insertions: Vec<ItemPath> = Vec::new();
        let mut section_insertions: Vec<usize> = Vec::new();
        for event in script {
            match event {
                ListEvent::DeleteSection { index } => section_removals.push(*index),
                ListEvent::DeleteItem { path } => item_removals.push(*path),
                ListEvent::InsertSection { index } => section_insertions.push(*index),
                ListEvent::InsertItem { path } => item_insertions.push(*path),
                ListEvent::MoveItem { from, to } => {
                    item_removals.push(*from);
                    item_insertions.push(*to);
                }
                ListEvent::UpdateItem { .. } => {}
            }
        }

        // All removals address pre-batch positions, applied highest-first
        // so earlier removals never shift a later one. Items go before
        // their (pre-batch-indexed) sections.
        item_removals.sort_unstable_by(|a, b| b.cmp(a));
        for path in item_removals {
            if let Some(section) = self.sections.get_mut(path.section)
                && path.item < section.len()
            {
                section.remove(path.item);
            }
        }
        section_removals.sort_unstable_by(|a, b| b.cmp(a));
        for index in section_removals {
            if index < self.sections.len() {
                self.sections.remove(index);
            }
        }

        // All insertions address post-batch positions, lowest-first.
        // Inserted sections pull their items straight from the snapshot
        // since the diff subsumes them.
        section_insertions.sort_unstable();
        for index in section_insertions {
            let items = snapshot
                .sections
                .get(index)
                .map(|section| section.items.iter().map(|e| e.id.clone()).collect())
                .unwrap_or_default();
            let index = index.min(self.sections.len());
            self.sections.insert(index, items);
        }
        item_insertions.sort_unstable();
        for path in item_insertions {
            if let Some(id) = Self::id_at(snapshot, path)
                && let Some(section) = self.sections.get_mut(path.section)
            {
                let item = path.item.min(section.len());
                section.insert(item, id);
            }
        }
        self.log.extend_from_slice(script);
    }
}

#[async_trait]
impl BoundList for SectionedList {
    fn is_attached(&self) -> bool {
        self.attached
    }

    async fn reload(&mut self, snapshot: &SectionSnapshot) {
        self.sections = snapshot
            .sections
            .iter()
            .map(|section| section.items.iter().map(|e| e.id.clone()).collect())
            .collect();
        self.reloads += 1;
    }

    async fn apply(&mut self, script: &[ListEvent], snapshot: &SectionSnapshot) {
        self.play(script, snapshot);
    }
}

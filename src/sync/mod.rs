//! Incremental synchronization between live projections and bound lists.
//!
//! A [`ResultSet`] keeps one sectioned fetch evaluated against the main
//! context and emits a [`ChangeBatch`] per re-evaluation. A [`ListBridge`]
//! turns each batch into either one ordered edit transaction or one full
//! reload of a [`BoundList`]; [`BridgeDriver`] wires the two together.

pub mod bridge;
pub mod edits;
pub mod result_set;

pub use bridge::{BridgeDriver, BridgeState, ListBridge, ReconcileKind, SnapshotFilter};
pub use edits::{order_edits, BoundList, SectionedList};
pub use result_set::{ChangeBatch, Entry, ItemPath, ListEvent, ResultSet, Section, SectionSnapshot};

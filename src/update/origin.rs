//! Transaction origins: the policy objects update contexts are minted from.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::base::ContextCore;
use crate::context::{Lane, MainContext};
use crate::core::{Result, StackError};
use crate::facade::sink::ErrorSink;
use crate::storage::StoreCoordinator;
use crate::update::context::{UpdateContext, UpdateShared};
use crate::update::group::WorkGroup;

// ===== Identity and notifications =====

/// Stable identity of one origin within its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginId(pub(crate) u64);

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broadcast after a top-of-chain save from an origin that does not
/// auto-merge. Carries no payload beyond the origin; interested parties
/// refetch.
#[derive(Debug, Clone)]
pub struct CommitNotice {
    pub origin: OriginId,
}

// ===== Policy =====

/// Where commits from an origin's contexts land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginTarget {
    /// Parent is the main context; saved changes appear in the UI graph
    /// as part of the cascade, so auto-merge is implicit.
    Main,
    /// Parent is the root context. With `auto_merge` set the origin keeps
    /// a standing subscription that replays root saves into main.
    Root { auto_merge: bool },
    /// No parent context; saves go straight through the coordinator.
    Store,
}

/// How transaction bodies from one origin order among themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginOrdering {
    /// All bodies funnel through one global lane: strict mutual exclusion
    /// in submission order, nested work extending each exclusive window.
    Serialized,
    /// Bodies run on their contexts' private lanes with no cross-context
    /// ordering.
    Concurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginOptions {
    pub target: OriginTarget,
    pub ordering: OriginOrdering,
}

impl OriginOptions {
    pub fn main() -> Self {
        Self {
            target: OriginTarget::Main,
            ordering: OriginOrdering::Concurrent,
        }
    }

    pub fn root() -> Self {
        Self {
            target: OriginTarget::Root { auto_merge: false },
            ordering: OriginOrdering::Concurrent,
        }
    }

    pub fn root_auto_merge() -> Self {
        Self {
            target: OriginTarget::Root { auto_merge: true },
            ordering: OriginOrdering::Concurrent,
        }
    }

    pub fn store() -> Self {
        Self {
            target: OriginTarget::Store,
            ordering: OriginOrdering::Concurrent,
        }
    }

    pub fn serialized(mut self) -> Self {
        self.ordering = OriginOrdering::Serialized;
        self
    }
}

// ===== Wiring =====

/// Stack internals an origin needs; assembled by the facade.
#[derive(Clone)]
pub(crate) struct StackWiring {
    pub(crate) coordinator: Arc<StoreCoordinator>,
    pub(crate) main: MainContext,
    pub(crate) root: Option<Arc<ContextCore>>,
    pub(crate) sink: Arc<ErrorSink>,
    pub(crate) notices: broadcast::Sender<CommitNotice>,
    pub(crate) open_contexts: Arc<AtomicUsize>,
}

/// Standing auto-merge subscription. Dropping the guard tears the
/// replay task down.
struct MergeGuard {
    task: JoinHandle<()>,
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ===== Origin =====

/// Factory for update contexts sharing one target and ordering policy.
///
/// The policy combination is validated here, at construction, so
/// `begin_update` cannot fail later.
pub struct TransactionOrigin {
    id: OriginId,
    options: OriginOptions,
    wiring: StackWiring,
    global_lane: Option<Arc<Lane>>,
    sequence: AtomicU64,
    _merge_guard: Option<MergeGuard>,
}

impl TransactionOrigin {
    pub(crate) fn new(id: OriginId, options: OriginOptions, wiring: StackWiring) -> Result<Self> {
        if matches!(options.target, OriginTarget::Root { .. }) && wiring.root.is_none() {
            return Err(StackError::Configuration(
                "origin targets the root layer but the stack was built without one".into(),
            ));
        }

        let global_lane = matches!(options.ordering, OriginOrdering::Serialized)
            .then(|| Arc::new(Lane::new(format!("origin-{id}"))));

        let merge_guard = if let OriginTarget::Root { auto_merge: true } = options.target {
            Some(Self::install_merge_guard(&wiring)?)
        } else {
            None
        };

        debug!(origin = %id, ?options, "origin created");
        Ok(Self {
            id,
            options,
            wiring,
            global_lane,
            sequence: AtomicU64::new(0),
            _merge_guard: merge_guard,
        })
    }

    /// Subscribes to root save events and replays each committed change
    /// set into the main context on its lane. Replay is an idempotent
    /// upsert, so overlap with other propagation paths is harmless.
    fn install_merge_guard(wiring: &StackWiring) -> Result<MergeGuard> {
        let root = wiring
            .root
            .as_ref()
            .ok_or_else(|| StackError::Configuration("auto-merge requires a root layer".into()))?;
        let mut saves = root.subscribe_saves().ok_or_else(|| {
            StackError::Configuration("root context does not publish save events".into())
        })?;

        let main = wiring.main.clone();
        let sink = wiring.sink.clone();
        let task = tokio::spawn(async move {
            loop {
                match saves.recv().await {
                    Ok(event) => {
                        if let Err(error) = main.core().merge_committed(event.changes).await {
                            sink.record(error);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed change sets cannot be replayed; reset so
                        // observers rebuild from the stores.
                        warn!(skipped, "save event feed lagged, resetting main context");
                        if let Err(error) = main.reset().await {
                            sink.record(error);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(MergeGuard { task })
    }

    pub fn id(&self) -> OriginId {
        self.id
    }

    pub fn options(&self) -> OriginOptions {
        self.options
    }

    /// Effective merge policy: `Main` always merges through the cascade,
    /// `Store` never does.
    pub fn auto_merge(&self) -> bool {
        match self.options.target {
            OriginTarget::Main => true,
            OriginTarget::Root { auto_merge } => auto_merge,
            OriginTarget::Store => false,
        }
    }

    /// Mints a fresh private write context parented per the target policy.
    pub fn begin_update(&self) -> UpdateContext {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!("update-{}-{}", self.id, sequence);
        let parent = match self.options.target {
            OriginTarget::Main => Some(self.wiring.main.core().clone()),
            OriginTarget::Root { .. } => self.wiring.root.clone(),
            OriginTarget::Store => None,
        };
        let core = ContextCore::new(name, parent, self.wiring.coordinator.clone(), false);
        UpdateContext::new(Arc::new(UpdateShared {
            core,
            origin: self.id,
            auto_merge: self.auto_merge(),
            global_lane: self.global_lane.clone(),
            group: WorkGroup::new(),
            sink: self.wiring.sink.clone(),
            notices: self.wiring.notices.clone(),
            _open: OpenGuard::new(self.wiring.open_contexts.clone()),
        }))
    }
}

impl fmt::Debug for TransactionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionOrigin")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish()
    }
}

/// Keeps the stack's open-context count honest: incremented when a
/// context is minted, decremented when its last reference drops.
pub(crate) struct OpenGuard {
    counter: Arc<AtomicUsize>,
}

impl OpenGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

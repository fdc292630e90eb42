use std::sync::Arc;

use tokio::sync::broadcast;

use crate::context::base::{ContextCore, SaveEvent};
use crate::storage::StoreCoordinator;

/// Optional background context directly above storage. It is written to
/// only through cascading commits, and it publishes a save event for every
/// change set it pushes into the coordinator; auto-merge subscriptions feed
/// on those events.
pub struct RootContext {
    core: Arc<ContextCore>,
}

impl RootContext {
    pub(crate) fn new(coordinator: Arc<StoreCoordinator>) -> Self {
        Self {
            core: ContextCore::new("root", None, coordinator, true),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ContextCore> {
        &self.core
    }

    pub(crate) fn subscribe_saves(&self) -> Option<broadcast::Receiver<SaveEvent>> {
        self.core.subscribe_saves()
    }
}

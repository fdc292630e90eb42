//! The assembled stack: coordinator, context chain, origins, observers.

pub mod config;
pub mod sink;

pub use config::StackConfig;
pub use sink::ErrorSink;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::context::{MainContext, RootContext};
use crate::core::{EntitySchema, Result, StackError};
use crate::fetch::FetchRequest;
use crate::storage::{MountOptions, StoreCoordinator};
use crate::sync::ResultSet;
use crate::update::origin::StackWiring;
use crate::update::{CommitNotice, OriginId, OriginOptions, TransactionOrigin};

/// One assembled context hierarchy over one store coordinator.
///
/// Construction wires the chain per [`StackConfig`]: coordinator at the
/// bottom, an optional root layer above it, the main context on top.
/// Everything else hangs off this value; there is no process-wide
/// instance.
pub struct DataStack {
    config: StackConfig,
    coordinator: Arc<StoreCoordinator>,
    root: Option<RootContext>,
    main: MainContext,
    sink: Arc<ErrorSink>,
    notices: broadcast::Sender<CommitNotice>,
    open_contexts: Arc<AtomicUsize>,
    next_origin: AtomicU64,
}

impl DataStack {
    pub fn new(config: StackConfig) -> Result<Self> {
        config.validate()?;
        let coordinator = Arc::new(StoreCoordinator::new());
        let root = config
            .root_layer
            .then(|| RootContext::new(coordinator.clone()));
        let main = MainContext::new(
            coordinator.clone(),
            root.as_ref().map(|root| root.core().clone()),
        );
        let (notices, _) = broadcast::channel(config.notice_capacity);
        info!(
            name = %config.name,
            root_layer = config.root_layer,
            "data stack assembled"
        );
        Ok(Self {
            config,
            coordinator,
            root,
            main,
            sink: Arc::new(ErrorSink::new()),
            notices,
            open_contexts: Arc::new(AtomicUsize::new(0)),
            next_origin: AtomicU64::new(1),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(StackConfig::default())
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn has_root_layer(&self) -> bool {
        self.root.is_some()
    }

    /// The long-lived read context at the top of the chain.
    pub fn main(&self) -> &MainContext {
        &self.main
    }

    /// Mounts one named store configuration and registers its entities.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use datastack::{AttributeKind, DataStack, EntitySchema, MountOptions};
    ///
    /// # tokio_test::block_on(async {
    /// let stack = DataStack::with_defaults().unwrap();
    /// let task = EntitySchema::new("Task").required_attribute("title", AttributeKind::String);
    /// stack.mount(MountOptions::memory("default"), vec![task]).await.unwrap();
    /// # });
    /// ```
    pub async fn mount(&self, options: MountOptions, schemas: Vec<EntitySchema>) -> Result<()> {
        self.coordinator.mount(options, schemas).await
    }

    /// Creates a transaction origin. The target/ordering combination is
    /// validated here; `begin_update` on the result cannot fail.
    pub fn origin(&self, options: OriginOptions) -> Result<TransactionOrigin> {
        let id = OriginId(self.next_origin.fetch_add(1, Ordering::Relaxed));
        TransactionOrigin::new(id, options, self.wiring())
    }

    fn wiring(&self) -> StackWiring {
        StackWiring {
            coordinator: self.coordinator.clone(),
            main: self.main.clone(),
            root: self.root.as_ref().map(|root| root.core().clone()),
            sink: self.sink.clone(),
            notices: self.notices.clone(),
            open_contexts: self.open_contexts.clone(),
        }
    }

    /// Live sectioned projection of one fetch request over the main
    /// context.
    pub async fn results(
        &self,
        request: FetchRequest,
        section_key: Option<&str>,
    ) -> Result<ResultSet> {
        ResultSet::new(&self.main, request, section_key.map(str::to_string)).await
    }

    /// Subscribes to commit notifications, optionally filtered to one
    /// origin.
    pub fn subscribe_commits(&self, origin: Option<OriginId>) -> CommitSubscription {
        CommitSubscription {
            receiver: self.notices.subscribe(),
            origin,
        }
    }

    /// Installs the error callback. Transaction-body and save-path errors
    /// with no caller to return to pass through it.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&StackError) + Send + Sync + 'static,
    {
        self.sink.install_callback(callback);
    }

    pub fn last_error(&self) -> Option<StackError> {
        self.sink.last_error()
    }

    pub fn take_last_error(&self) -> Option<StackError> {
        self.sink.take_last()
    }

    /// Point-in-time counters across the whole stack.
    pub async fn stats(&self) -> StackStats {
        let coordinator = self.coordinator.stats().await;
        StackStats {
            mounted_stores: coordinator.mounted_stores,
            registered_entities: coordinator.registered_entities,
            commits: coordinator.commits,
            total_rows: coordinator.total_rows,
            open_update_contexts: self.open_contexts.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for DataStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStack")
            .field("name", &self.config.name)
            .field("root_layer", &self.root.is_some())
            .finish()
    }
}

/// Owned guard over the commit-notification channel. Receives every
/// notice, or only one origin's when a filter is set.
pub struct CommitSubscription {
    receiver: broadcast::Receiver<CommitNotice>,
    origin: Option<OriginId>,
}

impl CommitSubscription {
    /// Next matching notice; `None` once the stack is gone.
    pub async fn recv(&mut self) -> Option<CommitNotice> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) => {
                    if self.origin.is_none_or(|origin| origin == notice.origin) {
                        return Some(notice);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "commit notices lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Point-in-time stack counters.
#[derive(Debug, Clone, Default)]
pub struct StackStats {
    pub mounted_stores: usize,
    pub registered_entities: usize,
    pub commits: u64,
    pub total_rows: usize,
    pub open_update_contexts: usize,
}

//! Private write contexts and the scheduling of transaction bodies.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::context::base::ContextCore;
use crate::context::Lane;
use crate::core::Result;
use crate::facade::sink::ErrorSink;
use crate::update::group::WorkGroup;
use crate::update::handle::UpdateHandle;
use crate::update::origin::{CommitNotice, OpenGuard, OriginId};

/// State shared between one update context and the handles its bodies
/// receive. Lives as long as any scheduled unit still references it.
pub(crate) struct UpdateShared {
    pub(crate) core: Arc<ContextCore>,
    pub(crate) origin: OriginId,
    pub(crate) auto_merge: bool,
    pub(crate) global_lane: Option<Arc<Lane>>,
    pub(crate) group: WorkGroup,
    pub(crate) sink: Arc<ErrorSink>,
    pub(crate) notices: broadcast::Sender<CommitNotice>,
    pub(crate) _open: OpenGuard,
}

/// One private write transaction. Bodies scheduled through it run on the
/// context's own lane; under a serialized origin each body additionally
/// holds the origin's global lane until its nested work drains.
pub struct UpdateContext {
    shared: Arc<UpdateShared>,
}

impl UpdateContext {
    pub(crate) fn new(shared: Arc<UpdateShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        self.shared.core.name()
    }

    pub fn origin(&self) -> OriginId {
        self.shared.origin
    }

    /// Schedules `body` and returns without waiting for it. The body gets
    /// an [`UpdateHandle`]; an `Err` it returns is routed to the stack's
    /// error sink.
    pub fn perform<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce(UpdateHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        match self.shared.global_lane.clone() {
            None => schedule_unit(self.shared.clone(), body),
            Some(global) => {
                let shared = self.shared.clone();
                global.submit(move || serialized_unit(shared, body))
            }
        }
    }

    /// As [`perform`](Self::perform), but resolves when the body (and,
    /// under a serialized origin, the whole exclusive window) completes.
    /// Body errors still go to the sink; the returned `Result` reports
    /// scheduling failures only.
    pub async fn perform_and_wait<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce(UpdateHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        match self.shared.global_lane.clone() {
            None => {
                let shared = self.shared.clone();
                shared.group.enter();
                let inner = shared.clone();
                let driven = shared
                    .core
                    .lane
                    .run(move || async move { run_body(inner, body).await })
                    .await;
                shared.group.leave();
                driven
            }
            Some(global) => {
                let shared = self.shared.clone();
                global.run(move || serialized_unit(shared, body)).await
            }
        }
    }

    /// Schedules a commit of this context's pending changes.
    pub fn commit(&self) -> Result<()> {
        self.perform(|handle| async move { handle.commit().await.map(|_| ()) })
    }

    /// Schedules a rollback discarding this context's pending changes.
    pub fn rollback(&self) -> Result<()> {
        self.perform(|handle| async move { handle.rollback().await })
    }

    /// Barrier: resolves when work queued so far has drained, scheduling
    /// nothing new.
    pub async fn wait(&self) -> Result<()> {
        if let Some(global) = &self.shared.global_lane {
            global.barrier().await?;
        }
        self.shared.core.lane.barrier().await?;
        self.shared.group.drained().await;
        Ok(())
    }
}

impl std::fmt::Debug for UpdateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateContext")
            .field("name", &self.name())
            .field("origin", &self.shared.origin)
            .field("outstanding", &self.shared.group.active())
            .finish()
    }
}

/// Runs one body on the current lane and routes its error to the sink.
async fn run_body<F, Fut>(shared: Arc<UpdateShared>, body: F)
where
    F: FnOnce(UpdateHandle) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let handle = UpdateHandle::new(shared.clone());
    if let Err(error) = body(handle).await {
        shared.sink.record(error);
    }
}

/// Fire-and-forget unit on the context's private lane, bracketed by the
/// task group. Also the shape of nested `perform` calls.
pub(crate) fn schedule_unit<F, Fut>(shared: Arc<UpdateShared>, body: F) -> Result<()>
where
    F: FnOnce(UpdateHandle) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    shared.group.enter();
    let inner = shared.clone();
    let scheduled = shared.core.lane.submit(move || async move {
        run_body(inner.clone(), body).await;
        inner.group.leave();
    });
    if scheduled.is_err() {
        shared.group.leave();
    }
    scheduled
}

/// One exclusive window on a serialized origin's global lane: drive the
/// private lane through the body, then hold the lane until nested work
/// scheduled by the body has drained.
async fn serialized_unit<F, Fut>(shared: Arc<UpdateShared>, body: F)
where
    F: FnOnce(UpdateHandle) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    shared.group.enter();
    let inner = shared.clone();
    let driven = shared
        .core
        .lane
        .run(move || async move { run_body(inner, body).await })
        .await;
    shared.group.leave();
    if let Err(error) = driven {
        shared.sink.record(error);
    }
    shared.group.drained().await;
}

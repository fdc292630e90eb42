use std::future::Future;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::core::{Result, StackError};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Serial executor. A dedicated task drains a FIFO queue and awaits every
/// job to completion before starting the next, so jobs on one lane never
/// overlap, even when they suspend. Dropping the lane closes the queue; the
/// drain task finishes whatever was already enqueued and exits.
pub struct Lane {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
}

impl Lane {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let drain_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job().await;
            }
            trace!(lane = %drain_name, "lane closed");
        });
        Self { name, sender }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget enqueue.
    pub fn submit<F, Fut>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(job())
            }))
            .map_err(|_| StackError::LaneClosed(self.name.clone()))
    }

    /// Enqueue and await the job's result.
    pub async fn run<F, Fut, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (ack, done) = oneshot::channel();
        self.submit(move || async move {
            let _ = ack.send(job().await);
        })?;
        done.await
            .map_err(|_| StackError::LaneClosed(self.name.clone()))
    }

    /// Resolves once everything enqueued before the call has run.
    pub async fn barrier(&self) -> Result<()> {
        self.run(|| async {}).await
    }
}

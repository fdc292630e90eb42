use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Explicit liveness counter for one transaction's outstanding work.
///
/// Scheduling code calls `enter` before a unit is queued and `leave` when
/// it finishes; `drained` resolves once the count returns to zero. The
/// counter is what serialized origins and `wait()` await, so the exclusive
/// window of a transaction covers nested work it scheduled, not just the
/// body itself.
#[derive(Debug, Default)]
pub(crate) struct WorkGroup {
    active: AtomicUsize,
    idle: Notify,
}

impl WorkGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unbalanced WorkGroup::leave");
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Resolves when the count reaches zero. Immediate when already idle.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drained_resolves_immediately_when_idle() {
        let group = WorkGroup::new();
        group.drained().await;
    }

    #[tokio::test]
    async fn test_drained_waits_for_every_leave() {
        let group = Arc::new(WorkGroup::new());
        group.enter();
        group.enter();

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move {
                group.drained().await;
            })
        };

        group.leave();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        group.leave();
        waiter.await.unwrap();
        assert_eq!(group.active(), 0);
    }
}

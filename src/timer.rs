//! One-shot timers on the shared scheduler.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Schedules deferred work without blocking a worker thread.
#[derive(Debug, Clone)]
pub struct Timer {
    handle: Handle,
}

impl Timer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Run `task` once `delay` has elapsed.
    pub fn after<F>(&self, delay: Duration, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await
        })
    }

    /// Suspend the calling task for `delay`.
    pub async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

use std::{future::Future, pin::Pin, time::Duration};

use anyhow::{Context, Result};
use tokio::{runtime::Handle, time};
use tokio_util::sync::CancellationToken;

pub type Task = Box<dyn FnOnce() + Send + 'static>;
pub type ReadyFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Host timer facility used by visibility models.
pub trait TaskScheduler: Send + Sync {
    /// Runs `task` once after `delay` unless the returned handle is
    /// cancelled or dropped first.
    fn schedule_after(&self, delay: Duration, task: Task) -> ScheduledTask;

    /// Runs `task` once `ready` completes. There is no timeout.
    fn when_ready(&self, ready: ReadyFuture, task: Task);
}

/// Cancel handle for a delayed task. Dropping it cancels the task.
#[derive(Debug)]
pub struct ScheduledTask {
    cancel_token: CancellationToken,
}

impl ScheduledTask {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self { cancel_token }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawns delayed tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().context("visibility scheduling needs a tokio runtime")?;
        Ok(Self::new(handle))
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) -> ScheduledTask {
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        self.handle.spawn(async move {
            tokio::select! {
                biased;
                _ = token_clone.cancelled() => {}
                _ = time::sleep(delay) => task(),
            }
        });

        ScheduledTask::new(cancel_token)
    }

    fn when_ready(&self, ready: ReadyFuture, task: Task) {
        self.handle.spawn(async move {
            ready.await;
            task();
        });
    }
}

//! Shared scheduled execution pool
//!
//! Every worker, timer and transport task in a process runs on one tokio
//! runtime. The `Scheduler` is the explicit handle to that runtime; it is
//! constructed by the application and passed into every channel.

use core::time::Duration;
use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Handle to the shared execution pool
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// Wrap an existing runtime handle
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on
    ///
    /// Panics when called outside of a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Run a future on the pool as soon as possible
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run a future on the pool once `delay` has elapsed
    pub fn schedule<F>(&self, delay: Duration, future: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            future.await;
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }

    /// Underlying runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

// ----------------------------------------------------------------------------
// Timer Handle
// ----------------------------------------------------------------------------

/// Cancellable handle to a scheduled task
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancel the task if it has not fired yet
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Whether the task has fired, finished or been cancelled
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Cancel the timer held in `slot`, if any, and clear the slot
pub(crate) fn cancel_timer(slot: &mut Option<TimerHandle>) {
    if let Some(timer) = slot.take() {
        timer.cancel();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Sequential worker
//!
//! A `SequentialWorker<S>` is a single logical thread of execution on top of
//! the shared scheduler. It exclusively owns a state value `S`; every task
//! receives `&mut S` and tasks run one at a time, in submission order. This is
//! the only mutual-exclusion mechanism used by connections and channels.
//!
//! The worker is an actor: handles push envelopes into an unbounded queue and
//! a single drain task on the scheduler pops them. While disabled, submitted
//! tasks accumulate in a backlog; enabling the worker drains the backlog in
//! FIFO order. Retiring the worker is terminal: queued tasks are dropped and
//! their futures resolve with `WorkerError::Retired`.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::errors::WorkerError;
use crate::scheduler::Scheduler;

// ----------------------------------------------------------------------------
// Queue Envelopes
// ----------------------------------------------------------------------------

type Job<S> = Box<dyn FnOnce(&mut S) -> BoxFuture<'static, ()> + Send>;

enum Envelope<S> {
    Run(Job<S>),
    Enable(bool),
    Retire,
}

// ----------------------------------------------------------------------------
// Sequential Worker
// ----------------------------------------------------------------------------

/// Handle to a single-logical-thread task queue owning a state value
pub struct SequentialWorker<S> {
    shared: Arc<WorkerShared<S>>,
}

struct WorkerShared<S> {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Envelope<S>>,
    retired: Arc<AtomicBool>,
    enabled: AtomicBool,
}

impl<S> Clone for SequentialWorker<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Send + 'static> SequentialWorker<S> {
    /// Create a worker owning `state` and start its drain task on `scheduler`
    pub fn new(scheduler: &Scheduler, name: impl Into<String>, state: S, enabled: bool) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (sender, receiver) = mpsc::unbounded_channel();
        let retired = Arc::new(AtomicBool::new(false));

        scheduler.spawn(drain(
            Arc::clone(&name),
            receiver,
            state,
            enabled,
            Arc::clone(&retired),
        ));

        Self {
            shared: Arc::new(WorkerShared {
                name,
                sender,
                retired,
                enabled: AtomicBool::new(enabled),
            }),
        }
    }

    /// Queue a synchronous task
    pub fn submit<R, F>(&self, task: F) -> TaskFuture<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let name = Arc::clone(&self.shared.name);

        let job: Job<S> = Box::new(move |state: &mut S| {
            let outcome = catch_unwind(AssertUnwindSafe(|| task(state))).map_err(|_| {
                error!(worker = %name, "Task panicked");
                WorkerError::Panicked
            });
            let _ = sender.send(outcome);
            future::ready(()).boxed()
        });

        self.enqueue(job, receiver)
    }

    /// Queue a task that continues asynchronously
    ///
    /// The worker does not start the next task until the returned future has
    /// resolved. The future cannot borrow the state.
    pub fn submit_async<R, F, Fut>(&self, task: F) -> TaskFuture<R>
    where
        F: FnOnce(&mut S) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let name = Arc::clone(&self.shared.name);

        let job: Job<S> = Box::new(move |state: &mut S| {
            match catch_unwind(AssertUnwindSafe(|| task(state))) {
                Ok(continuation) => async move {
                    let outcome = AssertUnwindSafe(continuation)
                        .catch_unwind()
                        .await
                        .map_err(|_| {
                            error!(worker = %name, "Task continuation panicked");
                            WorkerError::Panicked
                        });
                    let _ = sender.send(outcome);
                }
                .boxed(),
                Err(_) => {
                    error!(worker = %name, "Task panicked");
                    let _ = sender.send(Err(WorkerError::Panicked));
                    future::ready(()).boxed()
                }
            }
        });

        self.enqueue(job, receiver)
    }

    fn enqueue<R>(
        &self,
        job: Job<S>,
        receiver: oneshot::Receiver<Result<R, WorkerError>>,
    ) -> TaskFuture<R> {
        // A rejected job is dropped here, which resolves the future as retired
        if !self.shared.retired.load(Ordering::Acquire) {
            let _ = self.shared.sender.send(Envelope::Run(job));
        }
        TaskFuture { receiver }
    }
}

impl<S> SequentialWorker<S> {
    /// Allow or pause execution of queued tasks
    pub fn enable(&self, enabled: bool) {
        if self.shared.retired.load(Ordering::Acquire) {
            return;
        }
        self.shared.enabled.store(enabled, Ordering::Release);
        let _ = self.shared.sender.send(Envelope::Enable(enabled));
    }

    /// Stop accepting tasks and discard the ones still queued
    pub fn retire(&self) {
        if !self.shared.retired.swap(true, Ordering::AcqRel) {
            let _ = self.shared.sender.send(Envelope::Retire);
        }
    }

    /// Whether the worker has been retired
    pub fn is_retired(&self) -> bool {
        self.shared.retired.load(Ordering::Acquire)
    }

    /// Whether queued tasks are currently allowed to run
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire) && !self.is_retired()
    }

    /// Worker name used in logs
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<S> std::fmt::Debug for SequentialWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialWorker")
            .field("name", &self.shared.name)
            .field("enabled", &self.is_enabled())
            .field("retired", &self.is_retired())
            .finish()
    }
}

async fn drain<S>(
    name: Arc<str>,
    mut receiver: mpsc::UnboundedReceiver<Envelope<S>>,
    mut state: S,
    mut enabled: bool,
    retired: Arc<AtomicBool>,
) {
    let mut backlog: VecDeque<Job<S>> = VecDeque::new();

    while let Some(envelope) = receiver.recv().await {
        match envelope {
            Envelope::Run(job) => backlog.push_back(job),
            Envelope::Enable(flag) => enabled = flag,
            Envelope::Retire => break,
        }

        while enabled && !retired.load(Ordering::Acquire) {
            match backlog.pop_front() {
                Some(job) => job(&mut state).await,
                None => break,
            }
        }

        if retired.load(Ordering::Acquire) {
            break;
        }
    }

    debug!(worker = %name, discarded = backlog.len(), "Worker stopped");
}

// ----------------------------------------------------------------------------
// Task Future
// ----------------------------------------------------------------------------

/// Completion of a task submitted to a `SequentialWorker`
///
/// Dropping the future does not cancel the task.
#[derive(Debug)]
pub struct TaskFuture<R> {
    receiver: oneshot::Receiver<Result<R, WorkerError>>,
}

impl<R> Future for TaskFuture<R> {
    type Output = Result<R, WorkerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WorkerError::Retired)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Cross-thread task handoff.
//!
//! A task created on any thread is submitted for execution on a context's
//! owning thread. The submitter either blocks until the task ran
//! ([`HandoffMode::Sync`]) or gets a [`TaskHandle`] back immediately
//! ([`HandoffMode::Async`]).
//!
//! Blocking waits never stall a context thread: a context thread waiting on
//! another context keeps running its own queued tasks in the meantime, so two
//! contexts handing work to each other cannot deadlock.
//!
//! # Example
//! ```ignore
//! let context = RuntimeContext::spawn(ContextConfig::new("main"))?;
//!
//! // Blocking
//! let handles = context.run_sync(|scope| scope.stats().handles)?;
//!
//! // Fire and forget, await later
//! let handle = context.spawn_task(|scope| scope.collect_garbage())?;
//! let finalized = handle.await?;
//! ```

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::context::{ContextId, ContextMessage, ContextScope, RuntimeContext};
use crate::error::HandoffError;

/// Unit of work executed on a context's owning thread.
pub type Task = Box<dyn FnOnce(&ContextScope) + Send + 'static>;

/// How the submitter waits for a handed-off task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffMode {
    /// Block until the task ran and return its result.
    Sync,
    /// Return a handle immediately.
    Async,
}

/// Outcome of [`submit`].
pub enum Handoff<R> {
    /// The task ran (sync mode).
    Completed(R),
    /// The task is queued (async mode).
    Pending(TaskHandle<R>),
}

impl<R> Handoff<R> {
    /// Wait for the result, whatever the mode.
    pub fn wait(self) -> Result<R, HandoffError> {
        match self {
            Handoff::Completed(value) => Ok(value),
            Handoff::Pending(handle) => handle.wait(),
        }
    }
}

/// Submit `f` to run on `context`'s owning thread.
pub fn submit<R, F>(context: &RuntimeContext, mode: HandoffMode, f: F) -> Result<Handoff<R>, HandoffError>
where
    R: Send + 'static,
    F: FnOnce(&ContextScope) -> R + Send + 'static,
{
    match mode {
        HandoffMode::Sync => run_sync(context, f).map(Handoff::Completed),
        HandoffMode::Async => spawn(context, f).map(Handoff::Pending),
    }
}

/// Run `f` on the owning thread and block until it completed.
pub fn run_sync<R, F>(context: &RuntimeContext, f: F) -> Result<R, HandoffError>
where
    R: Send + 'static,
    F: FnOnce(&ContextScope) -> R + Send + 'static,
{
    // Already there: queuing would wait on ourselves.
    if let Some(scope) = context.try_scope() {
        return Ok(f(&scope));
    }

    log::trace!(
        "Sync handoff to runtime context {} from {:?}",
        context.id(),
        std::thread::current().id()
    );

    spawn(context, f)?.wait()
}

/// Queue `f` for the owning thread and return a handle to its result.
///
/// Tasks queued from the owning thread itself run on a later tick.
pub fn spawn<R, F>(context: &RuntimeContext, f: F) -> Result<TaskHandle<R>, HandoffError>
where
    R: Send + 'static,
    F: FnOnce(&ContextScope) -> R + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let id = context.id();

    let task: Task = Box::new(move |scope| {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(scope)));

        let result = outcome.map_err(|_| {
            log::error!("Task panicked on runtime context {}", id);
            HandoffError::TaskPanicked { context: id }
        });

        // The submitter may have stopped waiting
        let _ = tx.send(result);
    });

    context.send(ContextMessage::Run(task))?;

    Ok(TaskHandle { context: id, rx })
}

/// Handle to a task queued on a context.
///
/// Await it, or call [`TaskHandle::wait`] from synchronous code. Dropping the
/// handle does not cancel the task.
pub struct TaskHandle<R> {
    context: ContextId,
    rx: oneshot::Receiver<Result<R, HandoffError>>,
}

impl<R> TaskHandle<R> {
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Block until the task completed.
    ///
    /// On a context thread, queued tasks of that context keep running while
    /// waiting.
    pub fn wait(mut self) -> Result<R, HandoffError> {
        let Some(scope) = ContextScope::current() else {
            return futures::executor::block_on(self);
        };

        loop {
            match self.rx.try_recv() {
                Ok(result) => return result,
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(HandoffError::ContextClosed {
                        context: self.context,
                    });
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    if !scope.run_one_pending() {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, HandoffError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let context = self.context;

        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a result: the task was discarded
            Poll::Ready(Err(_)) => Poll::Ready(Err(HandoffError::ContextClosed { context })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> std::fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("context", &self.context)
            .finish()
    }
}

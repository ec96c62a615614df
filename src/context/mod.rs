//! Runtime contexts pinned to a dedicated thread.
//!
//! A [`RuntimeContext`] is a cheap, cloneable handle to one embedded runtime
//! instance. The instance runs on its own thread for its whole life; its
//! handle table and ledger are only touched from that thread, through a
//! [`ContextScope`].
//!
//! ## Lifecycle
//!
//! 1. `RuntimeContext::spawn()` starts the thread and its event loop
//! 2. Any thread submits work with `run_sync()` / `spawn_task()`
//! 3. `shutdown()` stops accepting work, drains what was queued, detaches
//!    every remaining mirror and joins the thread
//!
//! Dropping the last `RuntimeContext` handle stops the context the same way,
//! without joining. Handles held by the context's own machinery (its event
//! loop, mirrored objects) do not keep it running.

mod config;
mod scope;

pub use config::{ContextConfig, DEFAULT_GC_EXTERNAL_THRESHOLD, StrengthObserver};
pub use scope::ContextScope;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{ContextError, HandoffError};
use crate::gc::{DeferredAdjustmentQueue, ExternalMemoryLedger, MirrorTarget};
use crate::handoff::{self, Task, TaskHandle};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a runtime context, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Messages processed by a context's event loop.
pub(crate) enum ContextMessage {
    /// Run a task on the owning thread.
    Run(Task),
    /// Deferred work was queued; run a tick.
    Wake,
    Shutdown,
}

pub(crate) struct ContextShared {
    pub(crate) id: ContextId,
    pub(crate) config: ContextConfig,
    pub(crate) thread: OnceLock<ThreadId>,
    tx: mpsc::UnboundedSender<ContextMessage>,
    pub(crate) ledger: ExternalMemoryLedger,
    pub(crate) deferred: DeferredAdjustmentQueue,
    /// Counted handles alive (user-facing ones)
    handles: AtomicUsize,
    closed: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ContextShared {
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Handle to a runtime context running on its own thread.
///
/// The context stops once every handle obtained from [`RuntimeContext::spawn`],
/// [`RuntimeContext::current`] or `clone()` is dropped.
pub struct RuntimeContext {
    shared: Arc<ContextShared>,
    /// Counted in `ContextShared::handles`
    counted: bool,
}

impl RuntimeContext {
    /// Start a new context on a dedicated thread.
    pub fn spawn(config: ContextConfig) -> Result<Self, ContextError> {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let thread_name = format!("runtime-{}-{}", config.name, id.0);

        let shared = Arc::new(ContextShared {
            id,
            config,
            thread: OnceLock::new(),
            tx,
            ledger: ExternalMemoryLedger::new(),
            deferred: DeferredAdjustmentQueue::new(),
            handles: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            join: Mutex::new(None),
        });

        let context = Self {
            shared: Arc::clone(&shared),
            counted: true,
        };
        let loop_context = context.uncounted();

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || crate::event_loop::run(loop_context, rx))?;

        shared.thread.get_or_init(|| handle.thread().id());
        *shared.join.lock() = Some(handle);

        log::info!(
            "Runtime context {} ({}) spawned: gc_external_threshold={}",
            id,
            shared.config.name,
            shared.config.gc_external_threshold
        );

        Ok(context)
    }

    /// The context whose owning thread is the calling thread, if any.
    pub fn current() -> Option<Self> {
        ContextScope::current().map(|scope| scope.context().clone())
    }

    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &ContextConfig {
        &self.shared.config
    }

    /// The thread this context is pinned to.
    pub fn owning_thread(&self) -> Option<ThreadId> {
        self.shared.thread.get().copied()
    }

    /// Whether the calling thread is this context's owning thread.
    pub fn is_current(&self) -> bool {
        self.owning_thread() == Some(thread::current().id())
    }

    /// Owning-thread proof for this context, if called on its thread.
    pub fn try_scope(&self) -> Option<ContextScope> {
        ContextScope::current().filter(|scope| scope.context().id() == self.id())
    }

    /// Bytes currently charged to this context's external memory ledger.
    pub fn external_memory(&self) -> i64 {
        self.shared.ledger.total()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Run `f` on the owning thread and wait for its result.
    ///
    /// Called on the owning thread itself, `f` runs inline.
    pub fn run_sync<R, F>(&self, f: F) -> Result<R, HandoffError>
    where
        R: Send + 'static,
        F: FnOnce(&ContextScope) -> R + Send + 'static,
    {
        handoff::run_sync(self, f)
    }

    /// Queue `f` for the owning thread and return immediately.
    pub fn spawn_task<R, F>(&self, f: F) -> Result<TaskHandle<R>, HandoffError>
    where
        R: Send + 'static,
        F: FnOnce(&ContextScope) -> R + Send + 'static,
    {
        handoff::spawn(self, f)
    }

    /// Stop the context: drain queued work, detach remaining mirrors and
    /// join the thread.
    ///
    /// Called from the owning thread, the loop stops after the current
    /// message and the thread is not joined. Idempotent.
    pub fn shutdown(&self) -> Result<(), ContextError> {
        // Send fails once the loop is gone; nothing left to stop then.
        let _ = self.shared.tx.send(ContextMessage::Shutdown);

        if self.is_current() {
            return Ok(());
        }

        let handle = self.shared.join.lock().take();

        if let Some(handle) = handle {
            handle.join().map_err(|_| ContextError::ThreadPanicked)?;
            log::info!("Runtime context {} ({}) shut down", self.id(), self.name());
        }

        Ok(())
    }

    pub(crate) fn send(&self, message: ContextMessage) -> Result<(), HandoffError> {
        if self.is_closed() {
            return Err(HandoffError::ContextClosed { context: self.id() });
        }

        self.shared
            .tx
            .send(message)
            .map_err(|_| HandoffError::ContextClosed { context: self.id() })
    }

    /// Buffer an object for a ledger flush on the owning thread.
    pub(crate) fn defer_external(&self, target: Arc<dyn MirrorTarget>) {
        self.shared.deferred.defer(target);

        if self.send(ContextMessage::Wake).is_err() {
            log::debug!(
                "Runtime context {} closed, external memory adjustment stays buffered",
                self.id()
            );
        }
    }

    pub(crate) fn shared(&self) -> &ContextShared {
        &self.shared
    }

    /// Handle that does not keep the context running.
    pub(crate) fn uncounted(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            counted: false,
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }
}

impl Clone for RuntimeContext {
    fn clone(&self) -> Self {
        self.shared.handles.fetch_add(1, Ordering::Relaxed);

        Self {
            shared: Arc::clone(&self.shared),
            counted: true,
        }
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        if !self.counted || self.shared.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        log::debug!(
            "Last handle to runtime context {} ({}) dropped, stopping it",
            self.shared.id,
            self.shared.config.name
        );

        // Fails once the loop is gone. The thread is not joined: this may
        // run on it.
        let _ = self.shared.tx.send(ContextMessage::Shutdown);
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("thread", &self.owning_thread())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Snapshot of a context's handle table and ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Live handles in the table
    pub handles: usize,
    pub strong: usize,
    pub weak: usize,
    /// Script-side references across all handles
    pub script_refs: usize,
    /// Collections run so far
    pub collections: u64,
    /// Objects finalized by the collector
    pub finalized: u64,
    /// Bytes charged to the ledger
    pub external_memory: i64,
    /// Tasks run on the owning thread
    pub tasks_run: u64,
}

//! ContextScope - proof of running on a context's owning thread.
//!
//! Handle strength and ledger mutation are only reachable through a
//! `ContextScope`. The scope is `!Send` and is only handed out on the
//! context's own thread, so mutating a handle from another thread does not
//! compile.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{ContextMessage, ContextStats, RuntimeContext};
use crate::error::LifecycleError;
use crate::gc::{HandleId, Heap, MirrorTarget, Strength, StrengthChange};
use crate::object::LifecycleObject;
use crate::script::ScriptRef;

thread_local! {
    /// Scope of the context pinned to this thread (if any).
    static CURRENT_SCOPE: RefCell<Option<ContextScope>> = const { RefCell::new(None) };
}

/// Owning-thread state of a context.
pub(crate) struct ContextState {
    context: RuntimeContext,
    heap: RefCell<Heap>,
    rx: RefCell<mpsc::UnboundedReceiver<ContextMessage>>,
    tasks_run: Cell<u64>,
    shutting_down: Cell<bool>,
}

/// Access to a runtime context from its owning thread.
///
/// Obtained inside tasks (`RuntimeContext::run_sync`, `spawn_task`) or with
/// `ContextScope::current()` / `RuntimeContext::try_scope()` on the
/// owning thread.
#[derive(Clone)]
pub struct ContextScope {
    state: Rc<ContextState>,
}

impl ContextScope {
    /// Install the scope for the calling thread. Called once by the event loop.
    pub(crate) fn install(
        context: RuntimeContext,
        rx: mpsc::UnboundedReceiver<ContextMessage>,
    ) -> Self {
        let scope = Self {
            state: Rc::new(ContextState {
                context,
                heap: RefCell::new(Heap::new()),
                rx: RefCell::new(rx),
                tasks_run: Cell::new(0),
                shutting_down: Cell::new(false),
            }),
        };

        CURRENT_SCOPE.with(|current| *current.borrow_mut() = Some(scope.clone()));
        scope
    }

    pub(crate) fn uninstall(&self) {
        CURRENT_SCOPE.with(|current| current.borrow_mut().take());
    }

    /// Scope of the context owned by the calling thread.
    pub fn current() -> Option<Self> {
        CURRENT_SCOPE.with(|current| current.borrow().clone())
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.state.context
    }

    /// Expose `object` to script code, creating its mirror on first use.
    pub fn wrap<T>(&self, object: &LifecycleObject<T>) -> Result<ScriptRef, LifecycleError>
    where
        T: Send + Sync + 'static,
    {
        object.wrap(self)
    }

    /// Run a full collection: queue every weak mirror without script
    /// references and finalize it. Returns the number of objects finalized.
    pub fn collect_garbage(&self) -> usize {
        let marked = self.state.heap.borrow_mut().mark();
        let finalized = self.run_finalizers();
        self.context().shared().ledger.mark_collected();

        log::debug!(
            "Runtime context {}: collection marked {} and finalized {} objects",
            self.context().id(),
            marked,
            finalized
        );

        finalized
    }

    /// Charge `delta` bytes to the context's ledger.
    pub fn adjust_external_memory(&self, delta: i64) -> i64 {
        self.context().shared().ledger.adjust(delta)
    }

    pub fn external_memory(&self) -> i64 {
        self.context().external_memory()
    }

    /// Strength of a handle in this context's table.
    pub fn strength(&self, handle: HandleId) -> Strength {
        self.state.heap.borrow().strength(handle)
    }

    pub fn stats(&self) -> ContextStats {
        let heap = self.state.heap.borrow().stats();

        ContextStats {
            handles: heap.handles,
            strong: heap.strong,
            weak: heap.weak,
            script_refs: heap.script_refs,
            collections: heap.collections,
            finalized: heap.finalized,
            external_memory: self.external_memory(),
            tasks_run: self.state.tasks_run.get(),
        }
    }

    /// Run every task already queued for this context.
    ///
    /// Lets code on the owning thread yield to the context's scheduler
    /// instead of blocking it.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;

        while self.run_one_pending() {
            count += 1;
        }

        count
    }

    /// Run one queued message, if any.
    pub(crate) fn run_one_pending(&self) -> bool {
        // The borrow must end before the task runs; tasks may pump again.
        let message = self.state.rx.borrow_mut().try_recv();

        match message {
            Ok(message) => {
                self.dispatch(message);
                true
            }
            Err(_) => false,
        }
    }

    /// Block until the next message arrives. `None` once all senders are gone.
    pub(crate) fn recv(&self) -> Option<ContextMessage> {
        self.state.rx.borrow_mut().blocking_recv()
    }

    /// Stop accepting messages and run what was already queued.
    pub(crate) fn close_and_drain(&self) -> usize {
        self.context().shared().mark_closed();
        self.state.rx.borrow_mut().close();

        let drained = self.run_pending();
        self.tick();
        drained
    }

    pub(crate) fn dispatch(&self, message: ContextMessage) {
        match message {
            ContextMessage::Run(task) => {
                self.state.tasks_run.set(self.state.tasks_run.get() + 1);
                task(self);
            }
            ContextMessage::Wake => {}
            ContextMessage::Shutdown => self.state.shutting_down.set(true),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.state.shutting_down.get()
    }

    /// Safe point: apply deferred adjustments, run pending finalizers and
    /// collect when the ledger says so.
    pub(crate) fn tick(&self) {
        let shared = self.context().shared();

        for target in shared.deferred.take_all() {
            target.flush_external(self);
        }

        self.run_finalizers();

        let threshold = shared.config.gc_external_threshold;

        if threshold > 0 && shared.ledger.charged_since_collection() >= threshold {
            log::debug!(
                "Runtime context {}: {} external bytes since last collection (threshold {}), collecting",
                self.context().id(),
                shared.ledger.charged_since_collection(),
                threshold
            );
            self.collect_garbage();
        }
    }

    /// Drain the finalization queue. Returns the number of objects finalized.
    pub(crate) fn run_finalizers(&self) -> usize {
        let mut finalized = 0;

        loop {
            // Release the heap before calling back into native code.
            let next = self.state.heap.borrow_mut().pop_finalizer();

            let Some((handle, target)) = next else {
                break;
            };

            if target.weak_callback(self, handle) {
                self.state.heap.borrow_mut().record_finalized();
                finalized += 1;
            }
        }

        if finalized > 0 {
            tracing::trace!("Finalized {} objects", finalized);
        }

        finalized
    }

    /// Detach every remaining mirror and empty the handle table.
    pub(crate) fn teardown(&self) {
        let targets = self.state.heap.borrow_mut().drain();

        if !targets.is_empty() {
            log::debug!(
                "Runtime context {}: detaching {} mirrored objects",
                self.context().id(),
                targets.len()
            );
        }

        for target in &targets {
            target.detach();
        }

        // Detached objects folded their buffered deltas in already.
        let stale = self.context().shared().deferred.take_all();
        drop(stale);
    }

    pub(crate) fn create_handle(&self, target: Arc<dyn MirrorTarget>, strength: Strength) -> HandleId {
        let handle = self.state.heap.borrow_mut().create(target, strength);
        self.notify(handle, Strength::Empty, strength);
        handle
    }

    pub(crate) fn set_strength(&self, handle: HandleId, to: Strength) {
        let changed = self.state.heap.borrow_mut().set_strength(handle, to);

        if let Some(from) = changed {
            self.notify(handle, from, to);
        }
    }

    /// Remove a handle. The returned object must be dropped by the caller
    /// after it released any lock.
    pub(crate) fn clear_handle(&self, handle: HandleId) -> Option<Arc<dyn MirrorTarget>> {
        let cleared = self.state.heap.borrow_mut().clear(handle);
        let (from, target) = cleared?;

        self.notify(handle, from, Strength::Empty);
        target
    }

    pub(crate) fn handle_target(&self, handle: HandleId) -> Option<Arc<dyn MirrorTarget>> {
        self.state.heap.borrow().target(handle)
    }

    pub(crate) fn add_script_ref(&self, handle: HandleId) {
        self.state.heap.borrow_mut().add_script_ref(handle);
    }

    pub(crate) fn release_script_ref(&self, handle: HandleId) {
        self.state.heap.borrow_mut().release_script_ref(handle);
    }

    fn notify(&self, handle: HandleId, from: Strength, to: Strength) {
        let context = self.context();

        log::trace!(
            "Runtime context {}: handle {} {:?} -> {:?}",
            context.id(),
            handle,
            from,
            to
        );

        if let Some(observer) = &context.config().strength_observer {
            observer(&StrengthChange {
                context: context.id(),
                handle,
                from,
                to,
                thread: std::thread::current().id(),
            });
        }
    }
}

impl std::fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextScope")
            .field("context", &self.context().id())
            .finish()
    }
}

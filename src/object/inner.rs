//! Shared core of a lifecycle object: the refcount/mirror state machine.
//!
//! All transitions are serialized by one fast lock (`life`). Handle strength
//! itself lives in the owning context's handle table and is only written with
//! a [`ContextScope`]; the `state` field records the strength the handle must
//! converge to.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, ReentrantMutex};

use super::LifecycleState;
use super::payload::Payload;
use crate::context::{ContextScope, RuntimeContext};
use crate::error::{HandoffError, LifecycleError};
use crate::gc::{HandleId, MirrorTarget, Strength};
use crate::script::ScriptRef;

#[derive(Debug)]
pub(crate) struct Life {
    pub(crate) refs: usize,
    pub(crate) state: LifecycleState,
    pub(crate) mirror: Option<HandleId>,
    /// Bytes reported (or to be reported on wrap) to the ledger
    pub(crate) external_bytes: i64,
    /// Adjustments made off the owning thread, not yet in the ledger
    pub(crate) pending_external: i64,
    /// Queued on the context's deferred adjustment queue
    pub(crate) flush_queued: bool,
}

pub(crate) struct ObjectCore<T> {
    pub(crate) life: Mutex<Life>,
    pub(crate) holder: OnceLock<RuntimeContext>,
    pub(crate) invocation: ReentrantMutex<()>,
    value: Payload<T>,
}

impl<T: Send + Sync + 'static> ObjectCore<T> {
    pub(crate) fn new(value: T, extra_external: i64) -> Self {
        let base = 2 * std::mem::size_of::<Self>() as i64;

        Self {
            life: Mutex::new(Life {
                refs: 1,
                state: LifecycleState::Unmirrored,
                mirror: None,
                external_bytes: base + extra_external,
                pending_external: 0,
                flush_queued: false,
            }),
            holder: OnceLock::new(),
            invocation: ReentrantMutex::new(()),
            value: Payload::new(value),
        }
    }

    /// The payload. Only reachable through a native owner.
    pub(crate) fn value(&self) -> &T {
        self.value.get()
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.value.is_released()
    }

    /// Drop the payload of an object that just became `Destroyed`. Must be
    /// called without holding `life`.
    fn destroy(&self) {
        debug_assert_eq!(self.life.lock().state, LifecycleState::Destroyed);

        // SAFETY: the state is `Destroyed`: the count is zero and `retain`
        // refuses the object, so no owner can borrow the payload again.
        if unsafe { self.value.release() } {
            log::trace!("Object payload released");
        }
    }

    /// Ref(). Returns `false` when the object can no longer gain owners
    /// (finalizing or destroyed).
    ///
    /// On the `0 -> 1` transition of a mirrored object the handle is made
    /// strong before returning, on the owning thread.
    pub(crate) fn retain(self: &Arc<Self>) -> bool {
        let mut life = self.life.lock();

        if matches!(
            life.state,
            LifecycleState::Finalizing | LifecycleState::Destroyed
        ) {
            return false;
        }

        life.refs += 1;

        if life.refs != 1 || life.state != LifecycleState::MirroredWeak {
            return true;
        }

        life.state = LifecycleState::MirroredStrong;
        drop(life);

        let Some(context) = self.holder.get() else {
            return true;
        };

        if let Some(scope) = context.try_scope() {
            self.sync_strength(&scope);
            return true;
        }

        log::debug!(
            "Ref from {:?}: strengthening on runtime context {}",
            std::thread::current().id(),
            context.id()
        );

        let core = Arc::clone(self);

        match context.run_sync(move |scope| core.sync_strength(scope)) {
            Ok(()) => {}
            Err(err @ HandoffError::ContextClosed { .. }) => {
                log::warn!("Could not strengthen mirror ({}), detaching object", err);
                self.detach();
            }
            // Only the strength observer runs after the handle changed: the
            // mirror is strong, keep it.
            Err(err) => log::error!("Strengthening mirror failed: {}", err),
        }

        true
    }

    /// Unref().
    pub(crate) fn release(self: &Arc<Self>) {
        let mut life = self.life.lock();
        debug_assert!(life.refs > 0, "refcount underflow");

        life.refs -= 1;

        if life.mirror.is_none() {
            if life.refs == 0 {
                life.state = LifecycleState::Destroyed;
                drop(life);

                log::trace!("Unmirrored object destroyed");
                self.destroy();
            }
            return;
        }

        if life.refs > 0 {
            return;
        }

        let Some(context) = self.holder.get() else {
            life.state = LifecycleState::Destroyed;
            drop(life);
            self.destroy();
            return;
        };

        if let Some(scope) = context.try_scope() {
            life.state = LifecycleState::MirroredWeak;
            drop(life);

            // No delete: the collector decides from here.
            self.sync_strength(&scope);
            return;
        }

        // Off the owning thread: undo and redo the decrement over there.
        life.refs = 1;
        drop(life);

        log::debug!(
            "Unref from {:?}: handing off to runtime context {}",
            std::thread::current().id(),
            context.id()
        );

        let core = Arc::clone(self);

        match context.run_sync(move |_scope| core.release()) {
            Ok(()) => {}
            Err(err @ HandoffError::ContextClosed { .. }) => {
                log::warn!("Unref handoff failed ({}), releasing natively", err);
                self.release_detached();
            }
            // The decrement ran over there before the panic (only the strength
            // observer runs after it): the count is already settled.
            Err(err) => log::error!("Unref on the owning thread failed: {}", err),
        }
    }

    /// Finish an Unref whose context is gone, along with the mirror.
    fn release_detached(&self) {
        let mut life = self.life.lock();

        life.mirror = None;
        life.refs = life.refs.saturating_sub(1);

        if life.refs > 0 {
            life.state = LifecycleState::Unmirrored;
            return;
        }

        life.state = LifecycleState::Destroyed;
        drop(life);
        self.destroy();
    }

    /// Bring the handle's strength in line with `state`.
    pub(crate) fn sync_strength(&self, scope: &ContextScope) {
        let (handle, strength) = {
            let life = self.life.lock();

            let strength = match life.state {
                LifecycleState::MirroredStrong => Strength::Strong,
                LifecycleState::MirroredWeak => Strength::Weak,
                _ => return,
            };

            match life.mirror {
                Some(handle) => (handle, strength),
                None => return,
            }
        };

        scope.set_strength(handle, strength);
    }

    /// Create the mirror on first exposure; otherwise hand out another
    /// script reference to it.
    pub(crate) fn wrap(self: &Arc<Self>, scope: &ContextScope) -> Result<ScriptRef, LifecycleError> {
        let holder = self.holder.get_or_init(|| scope.context().uncounted());

        if holder.id() != scope.context().id() {
            return Err(LifecycleError::WrongContext {
                bound: holder.id(),
                current: scope.context().id(),
            });
        }

        let mirror = self.life.lock().mirror;

        if let Some(handle) = mirror {
            return Ok(ScriptRef::new(scope, handle));
        }

        // The caller owns a native reference: the new handle starts strong.
        // `life` is not held here, the strength observer may read the object.
        let target: Arc<dyn MirrorTarget> = Arc::clone(self) as Arc<dyn MirrorTarget>;
        let handle = scope.create_handle(target, Strength::Strong);

        let mut life = self.life.lock();

        if let Some(existing) = life.mirror {
            // Wrapped from the observer in the meantime.
            drop(life);
            drop(scope.clear_handle(handle));
            return Ok(ScriptRef::new(scope, existing));
        }

        // Off-thread adjustments made meanwhile went to `external_bytes`.
        life.external_bytes += life.pending_external;
        life.pending_external = 0;

        let external = life.external_bytes;
        life.mirror = Some(handle);
        life.state = LifecycleState::MirroredStrong;
        drop(life);

        scope.adjust_external_memory(external);

        log::trace!(
            "Mirrored object as {} in runtime context {} ({} external bytes)",
            handle,
            scope.context().id(),
            external
        );

        Ok(ScriptRef::new(scope, handle))
    }

    /// Explicit disposal: tear the mirror down now. No-op without a mirror.
    pub(crate) fn dispose(self: &Arc<Self>) -> Result<(), HandoffError> {
        let context = {
            let life = self.life.lock();

            if life.mirror.is_none() {
                return Ok(());
            }

            match self.holder.get() {
                Some(context) => context.uncounted(),
                None => return Ok(()),
            }
        };

        if let Some(scope) = context.try_scope() {
            self.dispose_in(&scope);
            return Ok(());
        }

        let core = Arc::clone(self);
        context.run_sync(move |scope| {
            core.dispose_in(scope);
        })
    }

    /// Handle teardown on the owning thread. Returns `false` if there was no
    /// mirror.
    pub(crate) fn dispose_in(&self, scope: &ContextScope) -> bool {
        let mut life = self.life.lock();

        let Some(handle) = life.mirror.take() else {
            return false;
        };

        let external = life.external_bytes;
        life.external_bytes += life.pending_external;
        life.pending_external = 0;
        let destroyed = life.refs == 0;
        life.state = if destroyed {
            LifecycleState::Destroyed
        } else {
            LifecycleState::Unmirrored
        };
        drop(life);

        let released = scope.clear_handle(handle);
        scope.adjust_external_memory(-external);

        log::trace!("Disposed mirror {} ({} external bytes released)", handle, external);

        if destroyed {
            self.destroy();
        }

        // May be the last reference: drop outside the lock.
        drop(released);
        true
    }

    /// adjustExternal().
    pub(crate) fn adjust_external(self: &Arc<Self>, delta: i64) {
        let mut life = self.life.lock();

        if life.mirror.is_none() {
            life.external_bytes += delta;
            return;
        }

        let Some(context) = self.holder.get() else {
            life.external_bytes += delta;
            return;
        };

        if let Some(scope) = context.try_scope() {
            let net = delta + life.pending_external;
            life.pending_external = 0;

            if net != 0 {
                life.external_bytes += net;
                drop(life);
                scope.adjust_external_memory(net);
            }
            return;
        }

        life.pending_external += delta;

        if life.pending_external != 0 && !life.flush_queued {
            life.flush_queued = true;

            // Queued under the lock: teardown detaches before it clears the queue.
            context.defer_external(Arc::clone(self) as Arc<dyn MirrorTarget>);
        }
    }
}

impl<T: Send + Sync + 'static> MirrorTarget for ObjectCore<T> {
    fn weak_callback(self: Arc<Self>, scope: &ContextScope, handle: HandleId) -> bool {
        let mut life = self.life.lock();

        if life.mirror != Some(handle) {
            return false;
        }

        if life.refs > 0 {
            // A native owner appeared after marking.
            life.state = LifecycleState::MirroredStrong;
            drop(life);
            scope.set_strength(handle, Strength::Strong);
            return false;
        }

        life.state = LifecycleState::Finalizing;
        life.mirror = None;
        life.pending_external = 0;
        let external = life.external_bytes;
        drop(life);

        let released = scope.clear_handle(handle);
        scope.adjust_external_memory(-external);

        self.life.lock().state = LifecycleState::Destroyed;
        self.destroy();

        log::trace!("Finalized mirror {} ({} external bytes released)", handle, external);

        drop(released);
        true
    }

    fn dispose_mirror(&self, scope: &ContextScope, handle: HandleId) -> bool {
        if self.life.lock().mirror != Some(handle) {
            return false;
        }

        self.dispose_in(scope)
    }

    fn flush_external(&self, scope: &ContextScope) {
        let mut life = self.life.lock();
        life.flush_queued = false;

        // Disposed or finalized meanwhile: nothing to report to.
        if life.mirror.is_none() {
            return;
        }

        let net = life.pending_external;
        life.pending_external = 0;

        if net != 0 {
            life.external_bytes += net;
            drop(life);
            scope.adjust_external_memory(net);
        }
    }

    fn detach(&self) {
        let mut life = self.life.lock();

        if life.mirror.take().is_none() {
            return;
        }

        life.external_bytes += life.pending_external;
        life.pending_external = 0;

        if life.refs > 0 {
            life.state = LifecycleState::Unmirrored;
            return;
        }

        life.state = LifecycleState::Destroyed;
        drop(life);
        self.destroy();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

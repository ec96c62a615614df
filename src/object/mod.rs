//! Dual-ownership objects.
//!
//! A [`LifecycleObject`] is owned both by native code (an explicit reference
//! count, one per `LifecycleObject` value) and, once mirrored into a runtime
//! context, by that context's collector:
//!
//! ```text
//!                      wrap (owning thread)
//!   Unmirrored ──────────────────────────────► MirroredStrong
//!       │                                        │      ▲
//!       │ last Unref                   last Unref │      │ Ref (0 -> 1)
//!       ▼                                        ▼      │
//!   Destroyed ◄── Finalizing ◄── weak callback ── MirroredWeak
//! ```
//!
//! - `Clone` is `Ref()`, `Drop` is `Unref()`
//! - Without a mirror the payload is released when the count reaches zero
//! - With a mirror the count reaching zero only weakens the handle; the
//!   collector finalizes the object later (or `dispose()` tears it down)
//! - Strength changes always run on the context's owning thread. From other
//!   threads they go through a synchronous handoff.

pub(crate) mod inner;
mod invocation;
mod payload;

pub use invocation::InvocationGuard;

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use self::inner::ObjectCore;
use crate::context::{ContextScope, RuntimeContext};
use crate::error::{HandoffError, LifecycleError};
use crate::gc::{GcTraceable, HandleId, Strength};
use crate::script::ScriptRef;

/// Lifecycle state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Native-only.
    Unmirrored,
    /// Mirrored and natively referenced: the collector must keep it.
    MirroredStrong,
    /// Mirrored, no native owner left: the collector decides.
    MirroredWeak,
    /// The weak callback is tearing the object down.
    Finalizing,
    Destroyed,
}

impl LifecycleState {
    /// Strength the mirror has (or is converging to) in this state.
    pub fn strength(self) -> Strength {
        match self {
            LifecycleState::MirroredStrong => Strength::Strong,
            LifecycleState::MirroredWeak => Strength::Weak,
            _ => Strength::Empty,
        }
    }
}

/// A native owner of a dual-ownership object.
///
/// # Example
/// ```ignore
/// let object = LifecycleObject::new(Payload::default());
/// let context = RuntimeContext::spawn(ContextConfig::new("main"))?;
///
/// let owner = object.clone();
/// context.run_sync(move |scope| {
///     let script_ref = scope.wrap(&owner).unwrap();
///     // `owner` dropped here: the mirror goes weak, the script ref keeps it
/// })?;
///
/// drop(object); // Unref from this thread is handed off to the context
/// ```
pub struct LifecycleObject<T: Send + Sync + 'static> {
    core: Arc<ObjectCore<T>>,
}

impl<T: Send + Sync + 'static> LifecycleObject<T> {
    /// Create an object with a native reference count of 1 and no mirror.
    pub fn new(value: T) -> Self {
        Self {
            core: Arc::new(ObjectCore::new(value, 0)),
        }
    }

    /// Like [`LifecycleObject::new`], also charging the memory the payload
    /// reports through [`GcTraceable`] once the object is mirrored.
    pub fn new_tracked(value: T) -> Self
    where
        T: GcTraceable,
    {
        let extra = value.external_charge();

        Self {
            core: Arc::new(ObjectCore::new(value, extra)),
        }
    }

    /// Adopt a core whose count was already incremented.
    pub(crate) fn from_core(core: Arc<ObjectCore<T>>) -> Self {
        Self { core }
    }

    pub fn ref_count(&self) -> usize {
        self.core.life.lock().refs
    }

    pub fn state(&self) -> LifecycleState {
        self.core.life.lock().state
    }

    /// Strength the mirror has, or is converging to.
    ///
    /// The handle table itself is only readable on the owning thread, see
    /// [`ContextScope::strength`].
    pub fn strength(&self) -> Strength {
        self.state().strength()
    }

    pub fn mirror(&self) -> Option<HandleId> {
        self.core.life.lock().mirror
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror().is_some()
    }

    /// The context this object is bound to. Set on first wrap, never changes.
    pub fn context(&self) -> Option<&RuntimeContext> {
        self.core.holder.get()
    }

    pub fn owning_thread(&self) -> Option<ThreadId> {
        self.context().and_then(RuntimeContext::owning_thread)
    }

    /// Bytes charged (or to be charged on wrap) to the ledger.
    pub fn external_bytes(&self) -> i64 {
        self.core.life.lock().external_bytes
    }

    /// Adjustment buffered off the owning thread and not yet in the ledger.
    pub fn pending_external(&self) -> i64 {
        self.core.life.lock().pending_external
    }

    /// Report a change of the native memory held by this object.
    ///
    /// Applied to the ledger right away on the owning thread; from other
    /// threads it is buffered and folded in at the context's next tick.
    pub fn adjust_external(&self, delta: i64) {
        self.core.adjust_external(delta);
    }

    /// Tear the mirror down now instead of waiting for the collector.
    ///
    /// Idempotent. The object stays alive while native owners remain and can
    /// be wrapped again in the same context.
    pub fn dispose(&self) -> Result<(), HandoffError> {
        self.core.dispose()
    }

    /// Acquire the invocation lock. Re-entrant on the same thread.
    pub fn enter(&self) -> InvocationGuard<'_, T> {
        InvocationGuard::acquire(&self.core.invocation, self.core.value())
    }

    pub fn try_enter(&self) -> Option<InvocationGuard<'_, T>> {
        InvocationGuard::try_acquire(&self.core.invocation, self.core.value())
    }

    pub fn downgrade(&self) -> WeakObject<T> {
        WeakObject {
            core: Arc::downgrade(&self.core),
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.core, &b.core)
    }

    pub(crate) fn wrap(&self, scope: &ContextScope) -> Result<ScriptRef, LifecycleError> {
        self.core.wrap(scope)
    }
}

impl<T: Send + Sync + 'static> Clone for LifecycleObject<T> {
    fn clone(&self) -> Self {
        // We hold a reference: the count is at least 1 and cannot be finalized.
        let retained = self.core.retain();
        debug_assert!(retained, "Ref on an object that is being destroyed");

        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + Sync + 'static> Drop for LifecycleObject<T> {
    fn drop(&mut self) {
        self.core.release();
    }
}

impl<T: Send + Sync + 'static> Deref for LifecycleObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.core.value()
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for LifecycleObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let life = self.core.life.lock();

        f.debug_struct("LifecycleObject")
            .field("refs", &life.refs)
            .field("state", &life.state)
            .field("mirror", &life.mirror)
            .field("external_bytes", &life.external_bytes)
            .field("value", self.core.value())
            .finish()
    }
}

/// Non-owning reference to a [`LifecycleObject`].
///
/// Upgrading is a `Ref()` that may take the count from 0 to 1 on any thread:
/// a weak mirror is made strong (on its owning thread) before `upgrade`
/// returns.
pub struct WeakObject<T: Send + Sync + 'static> {
    core: Weak<ObjectCore<T>>,
}

impl<T: Send + Sync + 'static> WeakObject<T> {
    /// `None` once the object is finalizing or destroyed.
    ///
    /// A failed upgrade racing the last `Unref` never delays the payload's
    /// destruction: the payload is dropped by the `Unref` itself.
    pub fn upgrade(&self) -> Option<LifecycleObject<T>> {
        let core = self.core.upgrade()?;

        if core.retain() {
            Some(LifecycleObject::from_core(core))
        } else {
            None
        }
    }
}

impl<T: Send + Sync + 'static> Clone for WeakObject<T> {
    fn clone(&self) -> Self {
        Self {
            core: Weak::clone(&self.core),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for WeakObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObject")
            .field("alive", &(self.core.strong_count() > 0))
            .finish()
    }
}

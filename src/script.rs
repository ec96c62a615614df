//! Script-side references to mirrors.
//!
//! A [`ScriptRef`] stands for a value held by script code: as long as one
//! exists the collector treats the mirror as reachable and never finalizes
//! it, whatever its strength. Script refs live on the owning thread only.

use crate::context::ContextScope;
use crate::gc::{HandleId, Strength};
use crate::object::LifecycleObject;
use crate::object::inner::ObjectCore;

/// Reference from script code to a mirrored object. `!Send`.
pub struct ScriptRef {
    scope: ContextScope,
    handle: HandleId,
}

impl ScriptRef {
    pub(crate) fn new(scope: &ContextScope, handle: HandleId) -> Self {
        scope.add_script_ref(handle);

        Self {
            scope: scope.clone(),
            handle,
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Current strength of the handle. `Empty` once the mirror is gone.
    pub fn strength(&self) -> Strength {
        self.scope.strength(self.handle)
    }

    /// Whether the mirror was disposed (or the context is tearing down).
    pub fn is_empty(&self) -> bool {
        self.strength() == Strength::Empty
    }

    /// Native owner of the object behind this mirror.
    ///
    /// This is a `Ref()`: a weak mirror becomes strong again. `None` if the
    /// mirror was torn down or `T` is not the object's payload type.
    pub fn object<T: Send + Sync + 'static>(&self) -> Option<LifecycleObject<T>> {
        let target = self.scope.handle_target(self.handle)?;
        let core = target.as_any().downcast::<ObjectCore<T>>().ok()?;

        if core.retain() {
            Some(LifecycleObject::from_core(core))
        } else {
            None
        }
    }

    /// Tear down the mirror now, from script code.
    ///
    /// Returns `false` if it was already gone.
    pub fn dispose(&self) -> bool {
        let Some(target) = self.scope.handle_target(self.handle) else {
            return false;
        };

        target.dispose_mirror(&self.scope, self.handle)
    }
}

impl Clone for ScriptRef {
    fn clone(&self) -> Self {
        Self::new(&self.scope, self.handle)
    }
}

impl Drop for ScriptRef {
    fn drop(&mut self) {
        self.scope.release_script_ref(self.handle);
    }
}

impl std::fmt::Debug for ScriptRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRef")
            .field("context", &self.scope.context().id())
            .field("handle", &self.handle)
            .finish()
    }
}

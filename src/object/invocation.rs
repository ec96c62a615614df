//! Per-object invocation lock.
//!
//! Serializes native method invocations on one object. The lock is
//! re-entrant for the holding thread. A context thread waiting for it keeps
//! running its own queued tasks, so a holder that hands work to that context
//! can still make progress.

use std::ops::Deref;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::context::ContextScope;

/// RAII guard of the invocation lock. Gives shared access to the payload.
pub struct InvocationGuard<'a, T> {
    _guard: ReentrantMutexGuard<'a, ()>,
    value: &'a T,
}

impl<'a, T> InvocationGuard<'a, T> {
    pub(crate) fn acquire(lock: &'a ReentrantMutex<()>, value: &'a T) -> Self {
        if let Some(guard) = Self::try_acquire(lock, value) {
            return guard;
        }

        let Some(scope) = ContextScope::current() else {
            return Self {
                _guard: lock.lock(),
                value,
            };
        };

        tracing::trace!(
            "Invocation lock contended on runtime context {}, pumping",
            scope.context().id()
        );

        loop {
            if let Some(guard) = Self::try_acquire(lock, value) {
                return guard;
            }

            if !scope.run_one_pending() {
                std::thread::yield_now();
            }
        }
    }

    pub(crate) fn try_acquire(lock: &'a ReentrantMutex<()>, value: &'a T) -> Option<Self> {
        lock.try_lock().map(|guard| Self {
            _guard: guard,
            value,
        })
    }
}

impl<T> Deref for InvocationGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

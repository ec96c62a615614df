//! Payload storage released on the `Destroyed` transition.
//!
//! The core outlives its last native owner whenever some other thread holds
//! a temporary `Arc` to it (a racing `WeakObject::upgrade`, a queued ledger
//! flush). The payload must not wait for those: it is dropped by whoever
//! performs the transition to `Destroyed`.

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct Payload<T> {
    value: UnsafeCell<ManuallyDrop<T>>,
    released: AtomicBool,
}

// SAFETY: shared access hands out `&T` only, like an `Arc<T>`. The one
// mutable access is `release`, which runs once no owner can reach the value.
unsafe impl<T: Send + Sync> Send for Payload<T> {}
unsafe impl<T: Send + Sync> Sync for Payload<T> {}

impl<T> Payload<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(ManuallyDrop::new(value)),
            released: AtomicBool::new(false),
        }
    }

    /// Callers hold a native reference, so the value is still there.
    pub(crate) fn get(&self) -> &T {
        debug_assert!(!self.released.load(Ordering::Acquire), "payload accessed after release");

        // SAFETY: `release` only runs after the native count reached zero for
        // good; no borrow taken through an owner can outlive that owner.
        unsafe { &**self.value.get() }
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Drop the value now. Returns `false` if it was already released.
    ///
    /// # Safety
    /// No borrow obtained from [`Payload::get`] may be alive, and none may be
    /// taken afterwards.
    pub(crate) unsafe fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        // SAFETY: first release, and the caller guarantees exclusive access.
        unsafe { ManuallyDrop::drop(&mut *self.value.get()) };
        true
    }
}

impl<T> Drop for Payload<T> {
    fn drop(&mut self) {
        if !*self.released.get_mut() {
            // SAFETY: `&mut self`, nothing else can reach the value.
            unsafe { ManuallyDrop::drop(self.value.get_mut()) };
        }
    }
}

//! Deferred external-memory adjustments.
//!
//! ## Problem
//!
//! The ledger of a context may only be written on the context's owning
//! thread. Objects adjust their external memory from whatever thread is
//! working with them.
//!
//! ## Solution
//!
//! Off-thread adjustments are buffered in the object, and the object is
//! queued here once. The owning thread drains the queue on every event loop
//! tick and folds each object's buffered delta into the ledger.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::heap::MirrorTarget;

/// Per-context queue of objects with buffered external-memory deltas.
///
/// Thread-safe; any thread may push. Only the owning thread drains it.
pub(crate) struct DeferredAdjustmentQueue {
    queue: Mutex<VecDeque<Arc<dyn MirrorTarget>>>,

    /// Fast check for pending items (avoids lock acquisition on hot path)
    pending_count: AtomicU64,
}

impl Default for DeferredAdjustmentQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredAdjustmentQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(8)),
            pending_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn defer(&self, target: Arc<dyn MirrorTarget>) {
        let mut queue = self.queue.lock();
        queue.push_back(target);
        self.pending_count.fetch_add(1, Ordering::Release);
        drop(queue);

        tracing::trace!("Deferred external memory adjustment (pending: {})", self.len());
    }

    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Take every queued object.
    pub(crate) fn take_all(&self) -> VecDeque<Arc<dyn MirrorTarget>> {
        if !self.has_pending() {
            return VecDeque::new();
        }

        let mut queue = self.queue.lock();
        let targets = std::mem::take(&mut *queue);

        // Under the lock, so the count never runs ahead of the queue
        self.pending_count
            .fetch_sub(targets.len() as u64, Ordering::Release);
        drop(queue);

        if !targets.is_empty() {
            tracing::trace!("Draining {} deferred external memory adjustments", targets.len());
        }

        targets
    }
}

impl std::fmt::Debug for DeferredAdjustmentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredAdjustmentQueue")
            .field("pending_count", &self.len())
            .finish()
    }
}

//! External memory ledger for collector pacing.

use std::sync::atomic::{AtomicI64, Ordering};

/// Running total of native bytes charged to one context's collector.
///
/// Any thread may read the total. Only the owning thread writes it, through
/// [`ContextScope::adjust_external_memory`](crate::ContextScope::adjust_external_memory).
#[derive(Default)]
pub struct ExternalMemoryLedger {
    total: AtomicI64,
    /// Net bytes charged since the last collection (pacing input).
    since_collection: AtomicI64,
}

impl ExternalMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently charged.
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }

    /// Net bytes charged since the last collection.
    pub fn charged_since_collection(&self) -> i64 {
        self.since_collection.load(Ordering::Acquire)
    }

    pub(crate) fn adjust(&self, delta: i64) -> i64 {
        if delta == 0 {
            return self.total();
        }

        self.since_collection.fetch_add(delta, Ordering::AcqRel);
        let total = self.total.fetch_add(delta, Ordering::AcqRel) + delta;

        log::trace!("Adjusted external memory: {} bytes (total {})", delta, total);

        total
    }

    pub(crate) fn mark_collected(&self) {
        self.since_collection.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for ExternalMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalMemoryLedger")
            .field("total", &self.total())
            .field("since_collection", &self.charged_since_collection())
            .finish()
    }
}

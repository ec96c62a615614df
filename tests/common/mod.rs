#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use lifecycle_bridge::{ContextConfig, ContextId, HandleId, RuntimeContext, Strength, StrengthChange};
use parking_lot::Mutex;

/// Context with GC pacing off, so collections only happen when a test asks.
pub fn spawn_context(name: &str) -> RuntimeContext {
    RuntimeContext::spawn(ContextConfig::new(name).with_gc_external_threshold(0))
        .expect("spawn runtime context")
}

/// Payload counting its own drops.
#[derive(Debug)]
pub struct DropCounter {
    drops: Arc<AtomicUsize>,
}

impl DropCounter {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        (
            Self {
                drops: Arc::clone(&drops),
            },
            drops,
        )
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every strength change of the contexts it is installed on.
#[derive(Clone, Default)]
pub struct StrengthRecorder {
    changes: Arc<Mutex<Vec<StrengthChange>>>,
}

impl StrengthRecorder {
    pub fn spawn_context(&self, name: &str) -> RuntimeContext {
        let changes = Arc::clone(&self.changes);

        let config = ContextConfig::new(name)
            .with_gc_external_threshold(0)
            .with_strength_observer(move |change: &StrengthChange| {
                changes.lock().push(change.clone());
            });

        RuntimeContext::spawn(config).expect("spawn runtime context")
    }

    pub fn changes(&self) -> Vec<StrengthChange> {
        self.changes.lock().clone()
    }

    pub fn changes_of(&self, handle: HandleId) -> Vec<(Strength, Strength)> {
        self.changes
            .lock()
            .iter()
            .filter(|change| change.handle == handle)
            .map(|change| (change.from, change.to))
            .collect()
    }

    /// Changes of `context` that ran on a thread other than `owner`.
    pub fn foreign_changes(&self, context: ContextId, owner: ThreadId) -> usize {
        self.changes
            .lock()
            .iter()
            .filter(|change| change.context == context && change.thread != owner)
            .count()
    }
}

/// Strength of `handle` as recorded in the context's handle table.
pub fn handle_strength(context: &RuntimeContext, handle: HandleId) -> Strength {
    context
        .run_sync(move |scope| scope.strength(handle))
        .expect("context alive")
}

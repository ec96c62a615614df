//! Per-context handle table standing in for the embedded collector.
//!
//! Every mirrored object owns one slot. A slot records the handle strength,
//! the object it aliases and how many script-side references point at it.
//! A weak slot with no script-side references is unreachable: marking queues
//! it for finalization, and the owning thread later drains that queue.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::context::{ContextId, ContextScope};

/// Identifier of a handle slot in a context's handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Strength of a mirror handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strength {
    /// No handle (never wrapped, disposed or finalized).
    Empty,
    /// The collector may reclaim the referent once script code drops it.
    Weak,
    /// The collector must not reclaim the referent.
    Strong,
}

/// A strength mutation, reported to the context's strength observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrengthChange {
    pub context: ContextId,
    pub handle: HandleId,
    pub from: Strength,
    pub to: Strength,
    /// Thread that performed the mutation.
    pub thread: ThreadId,
}

/// Native side of a mirror, as seen by the collector.
pub(crate) trait MirrorTarget: Send + Sync {
    /// Collector finalization callback. Runs on the owning thread.
    ///
    /// Returns `false` when the object declined (a native owner appeared
    /// since marking) or no longer owns `handle`.
    fn weak_callback(self: Arc<Self>, scope: &ContextScope, handle: HandleId) -> bool;

    /// Apply external-memory adjustments buffered off the owning thread.
    fn flush_external(&self, scope: &ContextScope);

    /// Explicit disposal requested from script code. `false` if the object
    /// no longer owns `handle`.
    fn dispose_mirror(&self, scope: &ContextScope, handle: HandleId) -> bool;

    /// The owning context is going away together with its handle table.
    fn detach(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Slot {
    strength: Strength,
    /// Cleared on teardown so stray script access finds nothing.
    target: Option<Arc<dyn MirrorTarget>>,
    script_refs: usize,
    queued: bool,
}

/// Handle table for one runtime context.
///
/// Lives on the context's owning thread and is only reachable through a
/// [`ContextScope`].
pub(crate) struct Heap {
    slots: HashMap<HandleId, Slot>,
    next_id: u64,
    finalization_queue: VecDeque<(HandleId, Arc<dyn MirrorTarget>)>,
    collections: u64,
    finalized: u64,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 1,
            finalization_queue: VecDeque::new(),
            collections: 0,
            finalized: 0,
        }
    }

    pub(crate) fn create(&mut self, target: Arc<dyn MirrorTarget>, strength: Strength) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;

        self.slots.insert(
            id,
            Slot {
                strength,
                target: Some(target),
                script_refs: 0,
                queued: false,
            },
        );

        id
    }

    pub(crate) fn strength(&self, id: HandleId) -> Strength {
        self.slots
            .get(&id)
            .map(|slot| slot.strength)
            .unwrap_or(Strength::Empty)
    }

    /// Set the strength of a live slot. Returns the previous strength if it
    /// actually changed.
    pub(crate) fn set_strength(&mut self, id: HandleId, to: Strength) -> Option<Strength> {
        let slot = self.slots.get_mut(&id)?;

        if slot.strength == to {
            return None;
        }

        let from = slot.strength;
        slot.strength = to;
        Some(from)
    }

    /// Remove a slot, returning the object it aliased.
    pub(crate) fn clear(&mut self, id: HandleId) -> Option<(Strength, Option<Arc<dyn MirrorTarget>>)> {
        self.slots
            .remove(&id)
            .map(|mut slot| (slot.strength, slot.target.take()))
    }

    pub(crate) fn target(&self, id: HandleId) -> Option<Arc<dyn MirrorTarget>> {
        self.slots.get(&id).and_then(|slot| slot.target.clone())
    }

    pub(crate) fn add_script_ref(&mut self, id: HandleId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.script_refs += 1;
        }
    }

    pub(crate) fn release_script_ref(&mut self, id: HandleId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.script_refs = slot.script_refs.saturating_sub(1);
        }
    }

    /// Queue every weak slot without script references for finalization.
    pub(crate) fn mark(&mut self) -> usize {
        self.collections += 1;

        let mut ids: Vec<HandleId> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.strength == Strength::Weak
                    && slot.script_refs == 0
                    && !slot.queued
                    && slot.target.is_some()
            })
            .map(|(id, _)| *id)
            .collect();

        // Finalize in creation order.
        ids.sort_unstable();

        for id in &ids {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.queued = true;

                if let Some(target) = &slot.target {
                    self.finalization_queue.push_back((*id, Arc::clone(target)));
                }
            }
        }

        ids.len()
    }

    /// Next queued slot that is still unreachable.
    ///
    /// Finalizers run native code that may pump the context's queue, so a
    /// queued slot can be strengthened or referenced from script code again
    /// before its turn. Those are dropped from the queue.
    pub(crate) fn pop_finalizer(&mut self) -> Option<(HandleId, Arc<dyn MirrorTarget>)> {
        while let Some((id, target)) = self.finalization_queue.pop_front() {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };

            slot.queued = false;

            if slot.strength == Strength::Weak && slot.script_refs == 0 && slot.target.is_some() {
                return Some((id, target));
            }
        }

        None
    }

    pub(crate) fn record_finalized(&mut self) {
        self.finalized += 1;
    }

    /// Empty the table, handing back every object still mirrored.
    pub(crate) fn drain(&mut self) -> Vec<Arc<dyn MirrorTarget>> {
        self.finalization_queue.clear();
        self.slots
            .drain()
            .filter_map(|(_, mut slot)| slot.target.take())
            .collect()
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            handles: self.slots.len(),
            collections: self.collections,
            finalized: self.finalized,
            ..HeapStats::default()
        };

        for slot in self.slots.values() {
            match slot.strength {
                Strength::Strong => stats.strong += 1,
                Strength::Weak => stats.weak += 1,
                Strength::Empty => {}
            }
            stats.script_refs += slot.script_refs;
        }

        stats
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HeapStats {
    pub handles: usize,
    pub strong: usize,
    pub weak: usize,
    pub script_refs: usize,
    pub collections: u64,
    pub finalized: u64,
}

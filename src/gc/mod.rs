//! Collector-facing side of the lifecycle bridge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ContextScope (owning-thread proof)                         │
//! │  ├── Only constructible on the context thread               │
//! │  ├── Exposes handle strength and ledger mutation            │
//! │  └── Drains deferred work at every event loop tick          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Heap (handle table)                                        │
//! │  ├── One slot per mirrored object (Strong / Weak)           │
//! │  ├── Script reference counts stand in for reachability      │
//! │  └── Finalization queue, drained at safe points             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  DeferredAdjustmentQueue                                    │
//! │  ├── Thread-safe queue of objects with buffered deltas      │
//! │  └── Folded into the ledger on the owning thread            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ExternalMemoryLedger                                       │
//! │  ├── Bytes charged to the collector                         │
//! │  └── Pacing input: collect past a threshold                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod deferred_adjustment;
mod external_memory;
mod heap;
mod traceable;

pub(crate) use deferred_adjustment::DeferredAdjustmentQueue;
pub use external_memory::ExternalMemoryLedger;
pub(crate) use heap::{Heap, MirrorTarget};
pub use heap::{HandleId, Strength, StrengthChange};
pub use traceable::GcTraceable;

//! Dual-ownership lifecycle bridge between natively reference-counted objects
//! and garbage-collected runtime contexts pinned to their own threads.
//!
//! - [`LifecycleObject`]: one native owner of an object (`Clone` = Ref,
//!   `Drop` = Unref)
//! - [`RuntimeContext`]: a runtime instance on a dedicated thread, with its
//!   handle table and external memory ledger
//! - [`ContextScope`]: owning-thread proof required by every handle or ledger
//!   mutation
//! - [`ScriptRef`]: script-side reference keeping a mirror reachable
//! - [`handoff`]: running work on a context's thread from anywhere

pub mod context;
pub mod error;
mod event_loop;
pub mod gc;
pub mod handoff;
pub mod object;
pub mod script;

pub use context::{ContextConfig, ContextId, ContextScope, ContextStats, RuntimeContext};
pub use error::{ContextError, HandoffError, LifecycleError};
pub use gc::{ExternalMemoryLedger, GcTraceable, HandleId, Strength, StrengthChange};
pub use handoff::{Handoff, HandoffMode, TaskHandle};
pub use object::{InvocationGuard, LifecycleObject, LifecycleState, WeakObject};
pub use script::ScriptRef;

// Derive macro, same name as the trait (separate namespaces)
pub use lifecycle_bridge_gc_derive::GcTraceable;

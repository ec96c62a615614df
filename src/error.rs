//! Error types.

use crate::context::ContextId;

/// Failure to run a task on a context's owning thread.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    /// The context no longer schedules work (it was shut down).
    #[error("runtime context {context} is closed")]
    ContextClosed { context: ContextId },

    /// The task panicked while running on the owning thread.
    #[error("task panicked on runtime context {context}")]
    TaskPanicked { context: ContextId },
}

/// Errors surfaced by lifecycle operations on objects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The object is bound to another context and cannot be mirrored here.
    #[error("object is bound to runtime context {bound}, not {current}")]
    WrongContext { bound: ContextId, current: ContextId },

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

/// Errors creating or tearing down a runtime context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to spawn runtime context thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("runtime context thread panicked")]
    ThreadPanicked,
}

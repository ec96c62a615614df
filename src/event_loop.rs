//! Event loop of a runtime context thread.
//!
//! Each iteration (a tick):
//!
//! 1. Block on the message channel
//! 2. Dispatch the message (run a task, wake up, or stop)
//! 3. Safe point: fold deferred external-memory adjustments into the ledger,
//!    drain the finalization queue, collect if the ledger crossed the
//!    pacing threshold
//!
//! The loop stops on `Shutdown`, sent by `RuntimeContext::shutdown` or when
//! the last counted handle is dropped. Then the channel is closed,
//! already-queued tasks still run, and every object still mirrored is
//! detached before the handle table goes away.

use tokio::sync::mpsc;

use crate::context::{ContextMessage, ContextScope, RuntimeContext};

pub(crate) fn run(context: RuntimeContext, rx: mpsc::UnboundedReceiver<ContextMessage>) {
    let thread_id = std::thread::current().id();
    context.shared().thread.get_or_init(|| thread_id);

    let scope = ContextScope::install(context, rx);
    let id = scope.context().id();

    log::debug!("Runtime context {} event loop started on {:?}", id, thread_id);

    loop {
        let Some(message) = scope.recv() else {
            break;
        };

        scope.dispatch(message);
        scope.tick();

        if scope.is_shutting_down() {
            break;
        }
    }

    let drained = scope.close_and_drain();

    if drained > 0 {
        log::debug!(
            "Runtime context {} ran {} queued messages during shutdown",
            id,
            drained
        );
    }

    scope.teardown();
    scope.uninstall();

    log::debug!("Runtime context {} event loop stopped", id);
}

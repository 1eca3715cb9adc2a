//! Dispatch-scoped context.
//!
//! The event bus runs every listener of one emit inside a scope that carries
//! the transition epoch observed when the emit began. A mode request made from
//! listener code picks that epoch up, so the state machine can tell whether
//! another transition committed after the event being reacted to was emitted.

use std::future::Future;

tokio::task_local! {
    static DISPATCH_EPOCH: u64;
}

/// Run `fut` as part of a dispatch that began at `epoch`.
pub async fn scope_dispatch<F: Future>(epoch: u64, fut: F) -> F::Output {
    DISPATCH_EPOCH.scope(epoch, fut).await
}

/// Epoch of the dispatch the current task belongs to, if any.
pub fn dispatch_epoch() -> Option<u64> {
    DISPATCH_EPOCH.try_with(|epoch| *epoch).ok()
}

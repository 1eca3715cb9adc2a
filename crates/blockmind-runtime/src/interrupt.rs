//! Cooperative, level-triggered interrupt.
//!
//! The state machine raises the signal when the active behavior loop must
//! abandon in-flight work. The signal stays raised until whichever loop reacts
//! to it calls [`InterruptSignal::clear`]; it never clears itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct SignalInner {
    reason: Mutex<Option<String>>,
    raises: AtomicU64,
    notify: Notify,
}

/// Shared interrupt flag with a human-readable reason. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal {
    inner: Arc<SignalInner>,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. A raise while already raised replaces the reason.
    pub fn raise(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(%reason, "interrupt raised");
        *self.inner.reason.lock() = Some(reason);
        self.inner.raises.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_waiters();
    }

    /// The pending reason, if raised.
    pub fn requested(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    pub fn is_raised(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    /// Clear the signal, returning the reason that was pending.
    pub fn clear(&self) -> Option<String> {
        let previous = self.inner.reason.lock().take();
        if previous.is_some() {
            debug!("interrupt cleared");
        }
        previous
    }

    /// Total raises since creation.
    pub fn raise_count(&self) -> u64 {
        self.inner.raises.load(Ordering::Relaxed)
    }

    /// Wait until the signal is raised. Returns immediately when it already is.
    pub async fn notified(&self) -> String {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.requested() {
                return reason;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stays_raised_until_cleared() {
        let signal = InterruptSignal::new();
        assert!(!signal.is_raised());
        signal.raise("health dropped");
        assert!(signal.is_raised());
        assert_eq!(signal.requested().as_deref(), Some("health dropped"));
        assert_eq!(signal.requested().as_deref(), Some("health dropped"));

        signal.raise("teleported");
        assert_eq!(signal.raise_count(), 2);
        assert_eq!(signal.clear().as_deref(), Some("teleported"));
        assert!(!signal.is_raised());
        assert_eq!(signal.clear(), None);
    }

    #[test]
    fn clones_share_state() {
        let a = InterruptSignal::new();
        let b = a.clone();
        a.raise("x");
        assert!(b.is_raised());
        b.clear();
        assert!(!a.is_raised());
    }

    #[tokio::test]
    async fn notified_returns_immediately_when_already_raised() {
        let signal = InterruptSignal::new();
        signal.raise("already");
        let reason = tokio::time::timeout(Duration::from_millis(50), signal.notified()).await;
        assert_eq!(reason.ok().as_deref(), Some("already"));
    }

    #[tokio::test]
    async fn notified_wakes_on_raise() {
        let signal = InterruptSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.notified().await })
        };
        tokio::task::yield_now().await;
        signal.raise("combat");
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert_eq!(reason.ok().and_then(|r| r.ok()).as_deref(), Some("combat"));
    }
}

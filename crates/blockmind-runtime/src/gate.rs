//! Serialization of mode transitions.
//!
//! Only one transition runs at a time. While one is in flight, a request with
//! strictly higher priority waits for it to finish; a request with equal or
//! lower priority is turned away, so the first of two equal requests wins.

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct TransitionGate {
    held: Mutex<Option<i32>>,
    released: Notify,
}

/// Proof of holding the gate. Releases on drop.
#[derive(Debug)]
pub struct GatePass<'a> {
    gate: &'a TransitionGate,
}

impl TransitionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire for a transition of `priority`. `None` means busy.
    pub async fn acquire(&self, priority: i32) -> Option<GatePass<'_>> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            {
                let mut held = self.held.lock();
                match *held {
                    None => {
                        *held = Some(priority);
                        return Some(GatePass { gate: self });
                    }
                    Some(in_flight) if priority > in_flight => {}
                    Some(_) => return None,
                }
            }
            released.await;
        }
    }

    /// Priority of the transition in flight, if any.
    pub fn in_flight(&self) -> Option<i32> {
        *self.held.lock()
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        *self.gate.held.lock() = None;
        self.gate.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn equal_or_lower_priority_is_busy() {
        let gate = TransitionGate::new();
        let pass = gate.acquire(50).await;
        assert!(pass.is_some());
        assert_eq!(gate.in_flight(), Some(50));
        assert!(gate.acquire(50).await.is_none());
        assert!(gate.acquire(10).await.is_none());
        drop(pass);
        assert_eq!(gate.in_flight(), None);
        assert!(gate.acquire(10).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_waits_for_release() {
        let gate = Arc::new(TransitionGate::new());
        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _pass = gate.acquire(0).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(gate.in_flight(), Some(0));

        let pass = gate.acquire(100).await;
        assert!(pass.is_some());
        assert_eq!(gate.in_flight(), Some(100));
        drop(pass);
        assert!(holder.await.is_ok());
    }
}

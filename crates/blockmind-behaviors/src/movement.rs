use std::sync::Arc;

use async_trait::async_trait;
use blockmind_protocol::{BoxError, EventKind, EventListener, GameEvent, Position};
use blockmind_runtime::InterruptSignal;
use parking_lot::Mutex;
use tracing::warn;

pub const TELEPORTED: &str = "teleported";

/// Interrupts the running behavior when the server moves the agent.
pub struct ForcedMoveWatcher {
    interrupt: InterruptSignal,
    last_position: Mutex<Option<Position>>,
}

impl ForcedMoveWatcher {
    pub fn new(interrupt: InterruptSignal) -> Self {
        Self {
            interrupt,
            last_position: Mutex::new(None),
        }
    }

    /// Where the last forced move put the agent, when it was reported.
    pub fn last_position(&self) -> Option<Position> {
        *self.last_position.lock()
    }
}

#[async_trait]
impl EventListener for ForcedMoveWatcher {
    async fn on_event(&self, event: Arc<GameEvent>) -> Result<(), BoxError> {
        let EventKind::ForcedMove { position } = &event.kind else {
            return Ok(());
        };
        match position {
            Some(position) => warn!(%position, "forced move"),
            None => warn!("forced move"),
        }
        *self.last_position.lock() = *position;
        self.interrupt.raise(TELEPORTED);
        Ok(())
    }

    fn label(&self) -> &str {
        "forced-move-watcher"
    }
}

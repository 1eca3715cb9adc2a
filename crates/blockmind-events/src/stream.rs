use std::sync::Arc;

use blockmind_protocol::GameEvent;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Broadcast fan-out of dispatched events for external observers.
///
/// Slow receivers lag and lose the oldest events; the bus never waits on them.
#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<Arc<GameEvent>>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: Arc<GameEvent>) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GameEvent>> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<Arc<GameEvent>> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

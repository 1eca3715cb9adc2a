//! Bounded, queryable tail of recently dispatched events.
//!
//! The store is a rolling buffer: when full, the oldest event is evicted on
//! each append. Every query returns an owned snapshot in insertion order
//! (oldest first, newest last), so readers never observe a partial append and
//! never hold the lock past the call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blockmind_protocol::{EventTag, GameEvent};
use parking_lot::RwLock;
use tracing::debug;

/// Default number of events retained.
pub const DEFAULT_STORE_CAPACITY: usize = 500;

#[derive(Debug)]
struct Buffer {
    entries: VecDeque<Arc<GameEvent>>,
    total_appended: u64,
    evicted: u64,
}

#[derive(Debug)]
pub struct EventStore {
    buffer: RwLock<Buffer>,
    capacity: usize,
}

impl EventStore {
    /// A `capacity` of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: RwLock::new(Buffer {
                entries: VecDeque::with_capacity(capacity),
                total_appended: 0,
                evicted: 0,
            }),
            capacity,
        }
    }

    /// Appends an event, evicting the oldest if at capacity.
    pub fn append(&self, event: Arc<GameEvent>) {
        let mut buffer = self.buffer.write();
        if buffer.entries.len() >= self.capacity {
            buffer.entries.pop_front();
            buffer.evicted += 1;
        }
        buffer.entries.push_back(event);
        buffer.total_appended += 1;
        debug!(len = buffer.entries.len(), "event appended to store");
    }

    /// The most recent `limit` events.
    pub fn recent(&self, limit: usize) -> Vec<Arc<GameEvent>> {
        let buffer = self.buffer.read();
        let skip = buffer.entries.len().saturating_sub(limit);
        buffer.entries.iter().skip(skip).cloned().collect()
    }

    /// The most recent `limit` events of one kind.
    pub fn by_kind(&self, tag: EventTag, limit: usize) -> Vec<Arc<GameEvent>> {
        self.tail_where(limit, |event| event.tag() == tag)
    }

    /// The most recent `limit` events no older than `window`, optionally of
    /// one kind only. Age is measured on the events' monotonic timestamps.
    pub fn within_window(
        &self,
        filter: Option<EventTag>,
        window: Duration,
        limit: usize,
    ) -> Vec<Arc<GameEvent>> {
        self.within_window_at(filter, window, limit, Instant::now())
    }

    /// [`within_window`](Self::within_window) evaluated against an explicit `now`.
    pub fn within_window_at(
        &self,
        filter: Option<EventTag>,
        window: Duration,
        limit: usize,
        now: Instant,
    ) -> Vec<Arc<GameEvent>> {
        self.tail_where(limit, |event| {
            filter.is_none_or(|tag| event.tag() == tag) && event.timestamp.age_at(now) <= window
        })
    }

    /// The most recent `limit` events in the world-event category.
    pub fn world_events(&self, limit: usize) -> Vec<Arc<GameEvent>> {
        self.tail_where(limit, |event| event.tag().is_world_event())
    }

    /// Chat lines from the last `window`, at most `max` of them.
    pub fn recent_chat(&self, window: Duration, max: usize) -> Vec<Arc<GameEvent>> {
        self.within_window(Some(EventTag::Chat), window, max)
    }

    pub fn len(&self) -> usize {
        self.buffer.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.buffer.write().entries.clear();
    }

    /// Events appended since creation, including evicted ones.
    pub fn total_appended(&self) -> u64 {
        self.buffer.read().total_appended
    }

    pub fn evicted(&self) -> u64 {
        self.buffer.read().evicted
    }

    fn tail_where(
        &self,
        limit: usize,
        predicate: impl Fn(&GameEvent) -> bool,
    ) -> Vec<Arc<GameEvent>> {
        let buffer = self.buffer.read();
        let mut out: Vec<Arc<GameEvent>> = buffer
            .entries
            .iter()
            .rev()
            .filter(|event| predicate(event))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }
}

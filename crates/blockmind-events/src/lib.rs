//! Event plumbing for the blockmind core: the publish/subscribe bus, the
//! bounded event store it appends to, and a broadcast stream for observers
//! that want every dispatched event without registering a listener.

pub mod bus;
pub mod store;
pub mod stream;

pub use bus::{
    BusConfig, BusStats, DEFAULT_MAX_CONCURRENT_LISTENERS, DEFAULT_MAX_LISTENERS,
    DEFAULT_MAX_LISTENERS_PER_SUBSCRIPTION, DispatchReport, EventBus, ListenerHandle,
    ListenerInfo, Subscription,
};
pub use store::{DEFAULT_STORE_CAPACITY, EventStore};
pub use stream::EventStreamHub;

//! In-process asynchronous publish/subscribe.
//!
//! `emit` runs every listener registered for the event's kind plus every
//! wildcard listener, each on its own tokio task, and waits for all of them.
//! A listener that errors or panics is counted and logged; it never affects
//! the other listeners or the producer. After dispatch the event is appended
//! to the [`EventStore`] and published on the [`EventStreamHub`].
//!
//! At most `max_concurrent_listeners` listener calls of one emit run at a
//! time. When an [`EpochSource`] is attached, its epoch is sampled before any
//! listener starts and every listener of that emit runs inside
//! [`scope_dispatch`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use blockmind_protocol::{
    BoxError, CoreError, CoreResult, EpochSource, EventId, EventListener, EventTag, GameEvent,
    ListenerId, listener_fn, scope_dispatch,
};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::store::EventStore;
use crate::stream::EventStreamHub;

/// Default global ceiling on registered listeners.
pub const DEFAULT_MAX_LISTENERS: usize = 1000;
/// Default ceiling on listeners sharing one subscription.
pub const DEFAULT_MAX_LISTENERS_PER_SUBSCRIPTION: usize = 200;
pub const DEFAULT_MAX_CONCURRENT_LISTENERS: usize = 50;

/// What a listener is subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    Kind(EventTag),
    /// Wildcard: every kind, including `unknown`.
    Any,
}

impl Subscription {
    pub fn matches(self, tag: EventTag) -> bool {
        match self {
            Self::Kind(kind) => kind == tag,
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kind(tag) => write!(f, "{tag}"),
            Self::Any => f.write_str("*"),
        }
    }
}

impl From<EventTag> for Subscription {
    fn from(tag: EventTag) -> Self {
        Self::Kind(tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Ceiling on all registered listeners.
    pub max_listeners: usize,
    /// Ceiling on listeners registered under any single subscription.
    pub max_listeners_per_subscription: usize,
    /// Listener calls of one emit allowed to run at the same time.
    pub max_concurrent_listeners: usize,
    pub stream_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_listeners: DEFAULT_MAX_LISTENERS,
            max_listeners_per_subscription: DEFAULT_MAX_LISTENERS_PER_SUBSCRIPTION,
            max_concurrent_listeners: DEFAULT_MAX_CONCURRENT_LISTENERS,
            stream_buffer: 256,
        }
    }
}

/// Non-fatal summary returned to the producer of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub event_id: EventId,
    pub tag: EventTag,
    pub listeners_run: usize,
    pub listeners_failed: usize,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.listeners_failed == 0
    }
}

/// Per-listener diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub id: ListenerId,
    pub label: String,
    pub subscription: Subscription,
    pub once: bool,
    pub invocations: u64,
    pub failures: u64,
}

/// Aggregate dispatch statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub total_emitted: u64,
    pub total_listener_calls: u64,
    pub total_failures: u64,
    pub avg_emit_ms: f64,
    pub max_emit_ms: f64,
    pub registered_listeners: usize,
}

#[derive(Debug, Default)]
struct DispatchTotals {
    emitted: u64,
    listener_calls: u64,
    failures: u64,
    emit_time: Duration,
    max_emit_time: Duration,
}

struct Registration {
    id: ListenerId,
    label: String,
    subscription: Subscription,
    listener: Arc<dyn EventListener>,
    once: bool,
    fired: AtomicBool,
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl Registration {
    /// A once-listener may be claimed by exactly one dispatch.
    fn claim(&self) -> bool {
        !self.once || !self.fired.swap(true, Ordering::AcqRel)
    }

    fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id.clone(),
            label: self.label.clone(),
            subscription: self.subscription,
            once: self.once,
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

struct BusInner {
    config: BusConfig,
    registrations: RwLock<Vec<Arc<Registration>>>,
    epochs: RwLock<Option<Arc<dyn EpochSource>>>,
    store: Arc<EventStore>,
    stream: EventStreamHub,
    totals: Mutex<DispatchTotals>,
}

impl BusInner {
    fn remove(&self, id: &ListenerId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| &r.id != id);
        before != registrations.len()
    }
}

/// Removable registration handle returned by `subscribe`.
///
/// Dropping the handle does not unsubscribe; call [`remove`](Self::remove).
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    subscription: Subscription,
    bus: Weak<BusInner>,
    removed: AtomicBool,
}

impl ListenerHandle {
    pub fn id(&self) -> &ListenerId {
        &self.id
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription
    }

    /// Deregister the listener. Idempotent, and safe to call from inside the
    /// listener's own callback. Returns whether this call removed it.
    pub fn remove(&self) -> bool {
        if self.removed.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.bus.upgrade() {
            Some(bus) => bus.remove(&self.id),
            None => false,
        }
    }

    pub fn is_removed(&self) -> bool {
        if self.removed.load(Ordering::Acquire) {
            return true;
        }
        match self.bus.upgrade() {
            Some(bus) => !bus.registrations.read().iter().any(|r| r.id == self.id),
            None => true,
        }
    }
}

/// Cheaply cloneable handle to one bus instance.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("listeners", &self.total_listeners())
            .finish()
    }
}

impl EventBus {
    pub fn new(config: BusConfig, store: Arc<EventStore>) -> Self {
        let stream = EventStreamHub::new(config.stream_buffer);
        Self {
            inner: Arc::new(BusInner {
                config,
                registrations: RwLock::new(Vec::new()),
                epochs: RwLock::new(None),
                store,
                stream,
                totals: Mutex::new(DispatchTotals::default()),
            }),
        }
    }

    pub fn subscribe(
        &self,
        subscription: impl Into<Subscription>,
        listener: Arc<dyn EventListener>,
    ) -> CoreResult<ListenerHandle> {
        self.register(subscription.into(), listener, false)
    }

    /// Register a listener that is removed after its first invocation.
    pub fn subscribe_once(
        &self,
        subscription: impl Into<Subscription>,
        listener: Arc<dyn EventListener>,
    ) -> CoreResult<ListenerHandle> {
        self.register(subscription.into(), listener, true)
    }

    /// Closure sugar over [`subscribe`](Self::subscribe).
    pub fn subscribe_fn<F, Fut>(
        &self,
        subscription: impl Into<Subscription>,
        label: impl Into<String>,
        f: F,
    ) -> CoreResult<ListenerHandle>
    where
        F: Fn(Arc<GameEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.subscribe(subscription, Arc::new(listener_fn(label, f)))
    }

    /// Sample `source` at the start of every emit and expose it to listeners
    /// through the dispatch scope.
    pub fn attach_epoch_source(&self, source: Arc<dyn EpochSource>) {
        *self.inner.epochs.write() = Some(source);
    }

    fn register(
        &self,
        subscription: Subscription,
        listener: Arc<dyn EventListener>,
        once: bool,
    ) -> CoreResult<ListenerHandle> {
        let config = &self.inner.config;
        let mut registrations = self.inner.registrations.write();
        if registrations.len() >= config.max_listeners {
            let limit = config.max_listeners;
            warn!(limit, label = listener.label(), "listener capacity exceeded");
            return Err(CoreError::ListenerCapacity { limit });
        }
        let limit = config.max_listeners_per_subscription;
        if registrations
            .iter()
            .filter(|r| r.subscription == subscription)
            .count()
            >= limit
        {
            warn!(limit, %subscription, label = listener.label(), "subscription capacity exceeded");
            return Err(CoreError::SubscriptionCapacity {
                subscription: subscription.to_string(),
                limit,
            });
        }
        let id = ListenerId::new_uuid();
        let label = listener.label().to_owned();
        info!(listener_id = %id, %label, ?subscription, once, "listener registered");
        registrations.push(Arc::new(Registration {
            id: id.clone(),
            label,
            subscription,
            listener,
            once,
            fired: AtomicBool::new(false),
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }));
        Ok(ListenerHandle {
            id,
            subscription,
            bus: Arc::downgrade(&self.inner),
            removed: AtomicBool::new(false),
        })
    }

    pub fn unsubscribe(&self, id: &ListenerId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            debug!(listener_id = %id, "listener removed");
        }
        removed
    }

    /// Remove every listener with exactly this subscription, or all listeners
    /// when `None`. Returns how many were removed.
    pub fn remove_all(&self, subscription: Option<Subscription>) -> usize {
        let mut registrations = self.inner.registrations.write();
        let before = registrations.len();
        match subscription {
            Some(sub) => registrations.retain(|r| r.subscription != sub),
            None => registrations.clear(),
        }
        before - registrations.len()
    }

    pub fn listener_count(&self, subscription: Subscription) -> usize {
        self.inner
            .registrations
            .read()
            .iter()
            .filter(|r| r.subscription == subscription)
            .count()
    }

    pub fn total_listeners(&self) -> usize {
        self.inner.registrations.read().len()
    }

    pub fn listeners_info(&self) -> Vec<ListenerInfo> {
        self.inner
            .registrations
            .read()
            .iter()
            .map(|r| r.info())
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        let totals = self.inner.totals.lock();
        let avg_emit_ms = if totals.emitted == 0 {
            0.0
        } else {
            totals.emit_time.as_secs_f64() * 1000.0 / totals.emitted as f64
        };
        BusStats {
            total_emitted: totals.emitted,
            total_listener_calls: totals.listener_calls,
            total_failures: totals.failures,
            avg_emit_ms,
            max_emit_ms: totals.max_emit_time.as_secs_f64() * 1000.0,
            registered_listeners: self.total_listeners(),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.inner.store
    }

    pub fn stream(&self) -> &EventStreamHub {
        &self.inner.stream
    }

    pub async fn emit(&self, event: GameEvent) -> DispatchReport {
        self.emit_shared(Arc::new(event)).await
    }

    #[instrument(skip(self, event), fields(event_id = %event.event_id, tag = %event.tag()))]
    pub async fn emit_shared(&self, event: Arc<GameEvent>) -> DispatchReport {
        let started = Instant::now();
        let tag = event.tag();
        let epoch = self
            .inner
            .epochs
            .read()
            .as_ref()
            .map(|source| source.current_epoch());
        let targets = self.claim_targets(tag);
        let permits = Arc::new(Semaphore::new(
            self.inner.config.max_concurrent_listeners.max(1),
        ));

        let handles: Vec<_> = targets
            .iter()
            .map(|registration| {
                let listener = registration.listener.clone();
                let event = event.clone();
                let permits = permits.clone();
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let call = listener.on_event(event);
                    match epoch {
                        Some(epoch) => scope_dispatch(epoch, call).await,
                        None => call.await,
                    }
                })
            })
            .collect();
        let results = join_all(handles).await;

        let mut failed = 0;
        for (registration, result) in targets.iter().zip(results) {
            registration.invocations.fetch_add(1, Ordering::Relaxed);
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(join_err) if join_err.is_panic() => Some("listener panicked".to_owned()),
                Err(join_err) => Some(join_err.to_string()),
            };
            if let Some(reason) = failure {
                failed += 1;
                registration.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    listener_id = %registration.id,
                    label = %registration.label,
                    error = %reason,
                    "listener failed"
                );
            }
        }

        self.inner.store.append(event.clone());
        self.inner.stream.publish(event.clone());

        let elapsed = started.elapsed();
        {
            let mut totals = self.inner.totals.lock();
            totals.emitted += 1;
            totals.listener_calls += targets.len() as u64;
            totals.failures += failed as u64;
            totals.emit_time += elapsed;
            totals.max_emit_time = totals.max_emit_time.max(elapsed);
        }

        debug!(listeners = targets.len(), failed, "event dispatched");
        DispatchReport {
            event_id: event.event_id.clone(),
            tag,
            listeners_run: targets.len(),
            listeners_failed: failed,
        }
    }

    /// Snapshot the registrations matching `tag`. Once-listeners are claimed
    /// and dropped from the registry before they run, so two concurrent
    /// emits never both invoke them.
    fn claim_targets(&self, tag: EventTag) -> Vec<Arc<Registration>> {
        let mut targets: Vec<Arc<Registration>> = self
            .inner
            .registrations
            .read()
            .iter()
            .filter(|r| r.subscription.matches(tag))
            .cloned()
            .collect();
        if targets.iter().any(|r| r.once) {
            let mut registrations = self.inner.registrations.write();
            targets.retain(|r| r.claim());
            registrations.retain(|r| !(r.once && r.fired.load(Ordering::Acquire)));
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmind_protocol::EventKind;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn bus_with(max_listeners: usize) -> EventBus {
        EventBus::new(
            BusConfig {
                max_listeners,
                stream_buffer: 16,
                ..BusConfig::default()
            },
            Arc::new(EventStore::new(100)),
        )
    }

    fn chat(message: &str) -> GameEvent {
        GameEvent::new(EventKind::Chat {
            username: Some("alex".into()),
            message: Some(message.into()),
        })
    }

    fn recorder(bus: &EventBus, sub: Subscription) -> anyhow::Result<Arc<PlMutex<Vec<String>>>> {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_fn(sub, "recorder", move |event| {
            let sink = sink.clone();
            async move {
                if let EventKind::Chat {
                    message: Some(message),
                    ..
                } = &event.kind
                {
                    sink.lock().push(message.clone());
                } else {
                    sink.lock().push(event.tag().to_string());
                }
                Ok(())
            }
        })?;
        Ok(seen)
    }

    #[tokio::test]
    async fn same_kind_events_arrive_in_emission_order() -> anyhow::Result<()> {
        let bus = bus_with(10);
        let seen = recorder(&bus, Subscription::Kind(EventTag::Chat))?;
        for i in 0..20 {
            bus.emit(chat(&format!("m{i}"))).await;
        }
        let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(*seen.lock(), expected);
        Ok(())
    }

    #[tokio::test]
    async fn wildcard_receives_every_kind() -> anyhow::Result<()> {
        let bus = bus_with(10);
        let seen = recorder(&bus, Subscription::Any)?;
        let chat_only = recorder(&bus, EventTag::Chat.into())?;
        bus.emit(GameEvent::new(EventKind::Rain)).await;
        let report = bus.emit(chat("hi")).await;
        assert_eq!(report.listeners_run, 2);
        assert_eq!(*seen.lock(), vec!["rain".to_owned(), "hi".to_owned()]);
        assert_eq!(*chat_only.lock(), vec!["hi".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn failing_listener_is_isolated() -> anyhow::Result<()> {
        let bus = bus_with(10);
        bus.subscribe_fn(EventTag::Chat, "erroring", |_event| async move {
            Err::<(), BoxError>("listener exploded".into())
        })?;
        bus.subscribe_fn(EventTag::Chat, "panicking", |_event| async move {
            if true {
                panic!("listener panicked on purpose");
            }
            Ok(())
        })?;
        let seen = recorder(&bus, EventTag::Chat.into())?;

        let report = bus.emit(chat("still delivered")).await;
        assert_eq!(report.listeners_run, 3);
        assert_eq!(report.listeners_failed, 2);
        assert!(!report.is_clean());
        assert_eq!(*seen.lock(), vec!["still delivered".to_owned()]);
        assert_eq!(bus.store().by_kind(EventTag::Chat, 10).len(), 1);

        let stats = bus.stats();
        assert_eq!(stats.total_emitted, 1);
        assert_eq!(stats.total_listener_calls, 3);
        assert_eq!(stats.total_failures, 2);
        let failures: u64 = bus.listeners_info().iter().map(|l| l.failures).sum();
        assert_eq!(failures, 2);
        Ok(())
    }

    #[tokio::test]
    async fn emit_without_listeners_still_stores() {
        let bus = bus_with(10);
        let report = bus.emit(GameEvent::new(EventKind::Spawn)).await;
        assert_eq!(report.listeners_run, 0);
        assert!(report.is_clean());
        assert_eq!(bus.store().len(), 1);
    }

    #[tokio::test]
    async fn listeners_run_concurrently() -> anyhow::Result<()> {
        let bus = bus_with(10);
        for label in ["slow-a", "slow-b"] {
            bus.subscribe_fn(EventTag::Rain, label, |_event| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })?;
        }
        let started = Instant::now();
        bus.emit(GameEvent::new(EventKind::Rain)).await;
        assert!(started.elapsed() < Duration::from_millis(390));
        Ok(())
    }

    #[tokio::test]
    async fn once_listener_fires_once() -> anyhow::Result<()> {
        let bus = bus_with(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = bus.subscribe_once(
            EventTag::Death,
            Arc::new(listener_fn("once", move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
        )?;
        bus.emit(GameEvent::new(EventKind::Death)).await;
        bus.emit(GameEvent::new(EventKind::Death)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_removed());
        assert_eq!(bus.total_listeners(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn handle_remove_is_idempotent() -> anyhow::Result<()> {
        let bus = bus_with(10);
        let handle = bus.subscribe_fn(EventTag::Rain, "noop", |_event| async move { Ok(()) })?;
        assert_eq!(bus.listener_count(Subscription::Kind(EventTag::Rain)), 1);
        assert!(handle.remove());
        assert!(!handle.remove());
        assert!(handle.is_removed());
        assert_eq!(bus.total_listeners(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn listener_can_remove_itself_during_dispatch() -> anyhow::Result<()> {
        let bus = bus_with(10);
        let slot: Arc<PlMutex<Option<ListenerHandle>>> = Arc::new(PlMutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let (inner_slot, counter) = (slot.clone(), calls.clone());
        let handle = bus.subscribe_fn(EventTag::Chat, "self-removing", move |_event| {
            let slot = inner_slot.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = slot.lock().as_ref() {
                    handle.remove();
                }
                Ok(())
            }
        })?;
        *slot.lock() = Some(handle);

        bus.emit(chat("first")).await;
        bus.emit(chat("second")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.total_listeners(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn capacity_is_a_hard_rejection() -> anyhow::Result<()> {
        let bus = bus_with(2);
        bus.subscribe_fn(EventTag::Rain, "a", |_event| async move { Ok(()) })?;
        bus.subscribe_fn(Subscription::Any, "b", |_event| async move { Ok(()) })?;
        let err = bus
            .subscribe_fn(EventTag::Chat, "c", |_event| async move { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, CoreError::ListenerCapacity { limit: 2 }));
        assert_eq!(bus.total_listeners(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn per_subscription_capacity() -> anyhow::Result<()> {
        let bus = EventBus::new(
            BusConfig {
                max_listeners_per_subscription: 1,
                ..BusConfig::default()
            },
            Arc::new(EventStore::new(10)),
        );
        bus.subscribe_fn(EventTag::Rain, "a", |_event| async move { Ok(()) })?;
        let err = bus
            .subscribe_fn(EventTag::Rain, "b", |_event| async move { Ok(()) })
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::SubscriptionCapacity { ref subscription, limit: 1 } if subscription == "rain"
        ));
        bus.subscribe_fn(EventTag::Chat, "c", |_event| async move { Ok(()) })?;
        bus.subscribe_fn(Subscription::Any, "d", |_event| async move { Ok(()) })?;
        assert_eq!(bus.total_listeners(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_listener_calls_are_capped() -> anyhow::Result<()> {
        let bus = EventBus::new(
            BusConfig {
                max_concurrent_listeners: 2,
                ..BusConfig::default()
            },
            Arc::new(EventStore::new(10)),
        );
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let (running, peak) = (running.clone(), peak.clone());
            bus.subscribe_fn(EventTag::Rain, "slow", move |_event| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })?;
        }
        let report = bus.emit(GameEvent::new(EventKind::Rain)).await;
        assert_eq!(report.listeners_run, 5);
        assert!(report.is_clean());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn listener_can_subscribe_during_dispatch() -> anyhow::Result<()> {
        let bus = bus_with(10);
        let late = Arc::new(AtomicUsize::new(0));
        let added = Arc::new(AtomicBool::new(false));
        let (inner_bus, counter) = (bus.clone(), late.clone());
        bus.subscribe_fn(EventTag::Chat, "subscriber", move |_event| {
            let bus = inner_bus.clone();
            let counter = counter.clone();
            let added = added.clone();
            async move {
                if !added.swap(true, Ordering::SeqCst) {
                    bus.subscribe_fn(EventTag::Chat, "late", move |_event| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })?;
                }
                Ok::<(), BoxError>(())
            }
        })?;

        let first = bus.emit(chat("first")).await;
        assert_eq!(first.listeners_run, 1);
        assert_eq!(late.load(Ordering::SeqCst), 0, "new listener skips the event in flight");
        assert_eq!(bus.total_listeners(), 2);

        let second = bus.emit(chat("second")).await;
        assert_eq!(second.listeners_run, 2);
        assert_eq!(late.load(Ordering::SeqCst), 1);
        Ok(())
    }

    struct FixedEpoch(u64);

    impl EpochSource for FixedEpoch {
        fn current_epoch(&self) -> u64 {
            self.0
        }
    }

    #[tokio::test]
    async fn listeners_see_the_dispatch_epoch() -> anyhow::Result<()> {
        let bus = bus_with(10);
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_fn(EventTag::Chat, "epoch", move |_event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(blockmind_protocol::dispatch_epoch());
                Ok(())
            }
        })?;
        bus.emit(chat("before")).await;
        bus.attach_epoch_source(Arc::new(FixedEpoch(3)));
        bus.emit(chat("after")).await;
        assert_eq!(*seen.lock(), vec![None, Some(3)]);
        Ok(())
    }

    #[tokio::test]
    async fn remove_all_by_subscription() -> anyhow::Result<()> {
        let bus = bus_with(10);
        for _ in 0..3 {
            bus.subscribe_fn(EventTag::Rain, "rain", |_event| async move { Ok(()) })?;
        }
        bus.subscribe_fn(Subscription::Any, "any", |_event| async move { Ok(()) })?;
        assert_eq!(bus.remove_all(Some(EventTag::Rain.into())), 3);
        assert_eq!(bus.total_listeners(), 1);
        assert_eq!(bus.remove_all(None), 1);
        Ok(())
    }

    #[tokio::test]
    async fn dispatched_events_reach_the_stream() -> anyhow::Result<()> {
        let bus = bus_with(10);
        let mut rx = bus.stream().subscribe();
        let report = bus.emit(GameEvent::new(EventKind::SpawnReset)).await;
        let event = rx.recv().await?;
        assert_eq!(event.event_id, report.event_id);
        Ok(())
    }
}

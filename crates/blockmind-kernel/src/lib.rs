//! The assembled blockmind core.
//!
//! [`AgentCoreBuilder`] wires the event store, the event bus, the mode state
//! machine and (optionally) the reference behaviors into an [`AgentCore`].
//! The core is what the world poller feeds raw events into and what behavior
//! loops consult before acting.

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use blockmind_behaviors::{CombatHandler, ForcedMoveWatcher, HealthMonitor};
use blockmind_events::{
    BusConfig, BusStats, DispatchReport, EventBus, EventStore, EventStreamHub, ListenerHandle,
    ListenerInfo, Subscription,
};
use blockmind_protocol::{
    BoxError, CoreError, CoreResult, EventFactory, EventListener, EventTag, GameEvent,
    ListenerId, ModeConfig, ModeHandler, ModeInfo, ModeName, ModeSnapshot, TransitionOutcome,
    TransitionRecord, TransitionTrigger,
};
use blockmind_runtime::{
    InterruptSignal, MachineConfig, MachineStats, ModeRegistry, ModeStateMachine, TickReport,
};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

pub use config::{ConfigError, CoreConfig};

const CHANGE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct AgentCoreBuilder {
    config: CoreConfig,
    interrupt: Option<InterruptSignal>,
    behaviors: bool,
}

impl AgentCoreBuilder {
    pub fn new() -> Self {
        Self::from_config(CoreConfig::default())
    }

    pub fn from_config(config: CoreConfig) -> Self {
        Self {
            config,
            interrupt: None,
            behaviors: true,
        }
    }

    pub fn max_listeners(mut self, max_listeners: usize) -> Self {
        self.config.max_listeners = max_listeners;
        self
    }

    pub fn event_store_capacity(mut self, capacity: usize) -> Self {
        self.config.event_store_capacity = capacity;
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Add or replace one mode in the table.
    pub fn mode(mut self, name: impl Into<ModeName>, config: ModeConfig) -> Self {
        self.config.modes.insert(name.into(), config);
        self
    }

    pub fn default_mode(mut self, name: impl Into<ModeName>) -> Self {
        self.config.default_mode = name.into();
        self
    }

    /// Share an existing interrupt signal instead of creating one.
    pub fn interrupt_signal(mut self, signal: InterruptSignal) -> Self {
        self.interrupt = Some(signal);
        self
    }

    /// Whether to install the health, combat and forced-move behaviors.
    pub fn with_behaviors(mut self, enabled: bool) -> Self {
        self.behaviors = enabled;
        self
    }

    pub fn build(self) -> CoreResult<AgentCore> {
        self.config
            .validate()
            .map_err(|err| CoreError::InvalidConfig(err.to_string()))?;

        let registry = ModeRegistry::new(self.config.default_mode.clone(), self.config.modes.clone())?;
        let store = Arc::new(EventStore::new(self.config.event_store_capacity));
        let bus = EventBus::new(
            BusConfig {
                max_listeners: self.config.max_listeners,
                max_listeners_per_subscription: self.config.max_listeners_per_subscription,
                max_concurrent_listeners: self.config.max_concurrent_listeners,
                stream_buffer: self.config.stream_buffer,
            },
            store,
        );
        let machine = ModeStateMachine::new(
            MachineConfig {
                history_capacity: self.config.history_capacity,
                change_buffer: CHANGE_BUFFER,
            },
            registry,
            self.interrupt.unwrap_or_default(),
        );
        bus.attach_epoch_source(Arc::new(machine.clone()));

        let mut core = AgentCore {
            config: Arc::new(self.config),
            bus,
            machine,
            combat: None,
        };
        if self.behaviors {
            core.install_behaviors()?;
        }
        info!(
            mode = %core.machine.current_mode(),
            listeners = core.bus.total_listeners(),
            "agent core built"
        );
        Ok(core)
    }
}

impl Default for AgentCoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of everything worth logging about a running core.
#[derive(Debug, Clone, Serialize)]
pub struct CoreDiagnostics {
    pub current_mode: ModeSnapshot,
    pub decision_engine_allowed: bool,
    pub interrupt_pending: Option<String>,
    pub interrupt_raises: u64,
    pub stored_events: usize,
    pub bus: BusStats,
    pub listeners: Vec<ListenerInfo>,
    pub machine: MachineStats,
    pub modes: Vec<ModeInfo>,
    pub handlers: IndexMap<ModeName, serde_json::Value>,
    pub history: Vec<TransitionRecord>,
}

/// Cheaply cloneable handle to one assembled core.
#[derive(Clone)]
pub struct AgentCore {
    config: Arc<CoreConfig>,
    bus: EventBus,
    machine: ModeStateMachine,
    combat: Option<Arc<CombatHandler>>,
}

impl std::fmt::Debug for AgentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCore")
            .field("machine", &self.machine)
            .field("listeners", &self.bus.total_listeners())
            .finish_non_exhaustive()
    }
}

impl AgentCore {
    pub fn builder() -> AgentCoreBuilder {
        AgentCoreBuilder::new()
    }

    fn install_behaviors(&mut self) -> CoreResult<()> {
        let health = HealthMonitor::new(self.config.health.clone(), self.machine.clone());
        self.bus.subscribe(EventTag::Health, Arc::new(health))?;

        let watcher = ForcedMoveWatcher::new(self.machine.interrupt().clone());
        self.bus.subscribe(EventTag::ForcedMove, Arc::new(watcher))?;

        let combat = Arc::new(CombatHandler::new(
            self.config.threat.clone(),
            self.machine.default_mode(),
        ));
        self.register_listener_handler(
            combat.clone(),
            [
                Subscription::Kind(EventTag::EntityHurt),
                Subscription::Kind(EventTag::EntityDead),
            ],
        )?;
        self.combat = Some(combat);
        Ok(())
    }

    // ── Ingest ──

    /// Build an event from a raw poller payload and dispatch it. Never fails:
    /// malformed payloads become `unknown` events.
    #[instrument(skip(self, raw))]
    pub async fn ingest(&self, raw: &serde_json::Value) -> DispatchReport {
        let event = EventFactory::from_raw(raw);
        debug!(tag = %event.tag(), event_id = %event.event_id, "raw event ingested");
        self.bus.emit(event).await
    }

    pub async fn emit(&self, event: GameEvent) -> DispatchReport {
        self.bus.emit(event).await
    }

    // ── Registration ──

    pub fn subscribe(
        &self,
        subscription: impl Into<Subscription>,
        listener: Arc<dyn EventListener>,
    ) -> CoreResult<ListenerHandle> {
        self.bus.subscribe(subscription, listener)
    }

    pub fn subscribe_once(
        &self,
        subscription: impl Into<Subscription>,
        listener: Arc<dyn EventListener>,
    ) -> CoreResult<ListenerHandle> {
        self.bus.subscribe_once(subscription, listener)
    }

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
        self.bus.subscribe_fn(subscription, label, f)
    }

    pub fn unsubscribe(&self, id: &ListenerId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn register_mode_handler(&self, handler: Arc<dyn ModeHandler>) {
        self.machine.register_handler(handler);
    }

    /// Register a handler that also listens to events, under each of
    /// `subscriptions`.
    pub fn register_listener_handler<H>(
        &self,
        handler: Arc<H>,
        subscriptions: impl IntoIterator<Item = Subscription>,
    ) -> CoreResult<Vec<ListenerHandle>>
    where
        H: ModeHandler + EventListener + 'static,
    {
        let handles = subscriptions
            .into_iter()
            .map(|subscription| {
                let listener: Arc<dyn EventListener> = handler.clone();
                self.bus.subscribe(subscription, listener)
            })
            .collect::<CoreResult<Vec<_>>>()?;
        self.machine.register_handler(handler);
        Ok(handles)
    }

    // ── Modes ──

    pub async fn request_mode(
        &self,
        target: impl Into<ModeName>,
        reason: impl Into<String>,
        actor: impl Into<String>,
    ) -> TransitionOutcome {
        self.machine
            .request_transition(target.into(), TransitionTrigger::new(reason, actor))
            .await
    }

    pub async fn tick(&self) -> TickReport {
        self.machine.tick().await
    }

    /// Tick the state machine every `tick_interval` until the handle is
    /// aborted.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let machine = self.machine.clone();
        let period = self.config.tick_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Some(record) = machine.tick().await.committed() {
                    debug!(from = %record.from, to = %record.to, "ticker committed a transition");
                }
            }
        })
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<TransitionRecord> {
        self.machine.subscribe_changes()
    }

    // ── Behavior-loop contract ──

    pub fn current_mode(&self) -> ModeSnapshot {
        self.machine.current()
    }

    pub fn is_decision_engine_allowed(&self) -> bool {
        self.machine.is_decision_engine_allowed()
    }

    pub fn interrupt_requested(&self) -> Option<String> {
        self.machine.interrupt().requested()
    }

    pub fn clear_interrupt(&self) -> Option<String> {
        self.machine.interrupt().clear()
    }

    pub fn interrupt_signal(&self) -> InterruptSignal {
        self.machine.interrupt().clone()
    }

    // ── Accessors ──

    pub fn events(&self) -> &Arc<EventStore> {
        self.bus.store()
    }

    pub fn stream(&self) -> &EventStreamHub {
        self.bus.stream()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn machine(&self) -> &ModeStateMachine {
        &self.machine
    }

    /// The installed combat handler, for feeding it entity observations.
    pub fn combat(&self) -> Option<&Arc<CombatHandler>> {
        self.combat.as_ref()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> CoreDiagnostics {
        let interrupt = self.machine.interrupt();
        CoreDiagnostics {
            current_mode: self.machine.current(),
            decision_engine_allowed: self.machine.is_decision_engine_allowed(),
            interrupt_pending: interrupt.requested(),
            interrupt_raises: interrupt.raise_count(),
            stored_events: self.bus.store().len(),
            bus: self.bus.stats(),
            listeners: self.bus.listeners_info(),
            machine: self.machine.stats(),
            modes: self.machine.available_modes(),
            handlers: self.machine.handler_statuses(),
            history: self.machine.history(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmind_protocol::{EntityInfo, RejectReason};
    use serde_json::json;

    fn core() -> AgentCore {
        AgentCoreBuilder::new().build().unwrap()
    }

    #[tokio::test]
    async fn critical_health_enters_combat() {
        let core = core();
        let report = core
            .ingest(&json!({ "name": "health", "data": { "health": 4 } }))
            .await;
        assert!(report.is_clean());
        assert_eq!(report.listeners_run, 1);

        let current = core.current_mode();
        assert_eq!(current.name, ModeName::combat());
        assert!(!core.is_decision_engine_allowed());
        let reason = core.interrupt_requested().unwrap();
        assert!(reason.contains("health critical"), "{reason}");

        assert!(core.clear_interrupt().is_some());
        assert!(core.interrupt_requested().is_none());
    }

    #[tokio::test]
    async fn unknown_event_is_stored_as_fallback() {
        let core = core();
        let report = core
            .ingest(&json!({ "name": "futureEventXYZ", "data": {} }))
            .await;
        assert_eq!(report.tag, EventTag::Unknown);
        let recent = core.events().recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tag(), EventTag::Unknown);
        assert_eq!(core.current_mode().name, ModeName::main());
    }

    #[tokio::test]
    async fn forced_move_interrupts() {
        let core = core();
        core.ingest(&json!({
            "name": "forcedMove",
            "data": { "position": { "x": 1.0, "y": 70.0, "z": 2.0 } }
        }))
        .await;
        assert_eq!(core.interrupt_requested().as_deref(), Some("teleported"));
        assert_eq!(core.current_mode().name, ModeName::main());
    }

    #[tokio::test]
    async fn combat_handler_drives_mode_through_ticks() {
        let core = AgentCoreBuilder::new()
            .mode(
                "combat",
                ModeConfig::new("Combat", 100).blocking_decision_engine(),
            )
            .build()
            .unwrap();
        let combat = core.combat().cloned().unwrap();
        let zombie = EntityInfo {
            name: Some("zombie".into()),
            ..EntityInfo::default()
        };
        combat.observe_entities(&[zombie]);

        let report = core.tick().await;
        assert_eq!(report.committed().map(|r| r.to.clone()), Some(ModeName::combat()));
        assert!(combat.is_active());

        let outcome = core.request_mode("chest_gui", "loot", "test").await;
        assert!(matches!(
            outcome,
            TransitionOutcome::Rejected {
                reason: RejectReason::LowerPriority { .. }
            }
        ));

        combat.observe_threats(0);
        let outcome = core.request_mode("chest_gui", "loot", "test").await;
        assert!(outcome.is_committed(), "combat yields once threats are gone");
        assert!(!combat.is_active());
    }

    #[tokio::test]
    async fn builder_rejects_bad_config_and_capacity_is_enforced() {
        let err = AgentCoreBuilder::new().default_mode("idle").build().unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));

        let core = AgentCoreBuilder::new()
            .with_behaviors(false)
            .max_listeners(1)
            .build()
            .unwrap();
        core.subscribe_fn(Subscription::Any, "first", |_event| async { Ok(()) })
            .unwrap();
        let err = core
            .subscribe_fn(Subscription::Any, "second", |_event| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, CoreError::ListenerCapacity { limit: 1 }));
    }

    #[tokio::test]
    async fn equal_priority_requests_from_one_event_first_listener_wins() -> anyhow::Result<()> {
        let core = AgentCoreBuilder::new()
            .with_behaviors(false)
            .mode("alpha", ModeConfig::new("Alpha", 50))
            .mode("beta", ModeConfig::new("Beta", 50))
            .build()?;
        let outcomes = Arc::new(std::sync::Mutex::new(Vec::new()));
        for target in ["alpha", "beta"] {
            let (handle, outcomes) = (core.clone(), outcomes.clone());
            core.subscribe_fn(EventTag::Chat, target, move |_event| {
                let (core, outcomes) = (handle.clone(), outcomes.clone());
                async move {
                    let outcome = core.request_mode(target, "chat command", target).await;
                    if let Ok(mut outcomes) = outcomes.lock() {
                        outcomes.push((target, outcome));
                    }
                    Ok(())
                }
            })?;
        }

        let report = core
            .ingest(&json!({ "name": "chat", "data": { "username": "steve", "message": "go" } }))
            .await;
        assert_eq!(report.listeners_run, 2);
        assert!(report.is_clean());

        let history = core.machine().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to, ModeName::from("alpha"));
        assert_eq!(core.current_mode().name, ModeName::from("alpha"));

        let outcomes = outcomes.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.iter().filter(|(_, o)| o.is_committed()).count(), 1);
        let (_, beta) = outcomes
            .iter()
            .find(|(target, _)| *target == "beta")
            .ok_or_else(|| anyhow::anyhow!("beta listener did not run"))?;
        assert_eq!(*beta, TransitionOutcome::rejected(RejectReason::Superseded));
        assert_eq!(core.machine().stats().rejected, 1);
        Ok(())
    }

    #[tokio::test]
    async fn diagnostics_reflect_activity() -> anyhow::Result<()> {
        let core = core();
        core.ingest(&json!({ "name": "chat", "data": { "username": "steve", "message": "hi" } }))
            .await;
        core.request_mode("combat", "drill", "test").await;

        let diagnostics = core.diagnostics();
        assert_eq!(diagnostics.stored_events, 1);
        assert_eq!(diagnostics.bus.total_emitted, 1);
        assert_eq!(diagnostics.machine.committed, 1);
        assert_eq!(diagnostics.history.len(), 1);
        assert_eq!(diagnostics.interrupt_raises, 1);
        assert_eq!(diagnostics.listeners.len(), 4);
        assert!(diagnostics.handlers.contains_key(&ModeName::combat()));

        let value = serde_json::to_value(&diagnostics)?;
        assert_eq!(value["current_mode"]["name"], "combat");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_restores_default_mode() {
        let core = AgentCoreBuilder::new()
            .with_behaviors(false)
            .tick_interval(Duration::from_millis(100))
            .build()
            .unwrap();
        let mut changes = core.subscribe_changes();
        let ticker = core.spawn_ticker();

        core.request_mode("combat", "drill", "test").await;
        assert_eq!(changes.recv().await.unwrap().to, ModeName::combat());

        let restored = changes.recv().await.unwrap();
        assert_eq!(restored.to, ModeName::main());
        assert_eq!(restored.reason, "auto restore");
        ticker.abort();
    }
}

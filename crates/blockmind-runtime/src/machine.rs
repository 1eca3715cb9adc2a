//! The priority-driven mode state machine.
//!
//! The machine is the single authority over which mode is active. Every
//! change goes through the transition gate, so transitions are totally
//! ordered even when requests race. A committed transition runs the outgoing
//! handler's exit callback, swaps the state, runs the incoming handler's
//! enter callback and raises the interrupt when the behavior loop has to stop.
//! Callback failures are logged and counted; the transition still commits.
//!
//! Every commit advances the transition epoch. A request issued at an older
//! epoch (a listener reacting to an event emitted before the last commit)
//! does not displace an equal-priority mode: the first of two equal requests
//! raised by one event wins and the later one is `Superseded`.
//!
//! Timers (`max_duration`, `restore_delay`) are soft: they are evaluated on
//! [`ModeStateMachine::tick`].

use std::cmp::Reverse;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use blockmind_protocol::{
    CoreResult, EpochSource, ModeConfig, ModeHandler, ModeInfo, ModeName, ModeSnapshot, ModeState,
    ModeTransitionRequest, RejectReason, TransitionOutcome, TransitionRecord, TransitionTrigger,
    dispatch_epoch,
};
use chrono::Utc;
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::gate::TransitionGate;
use crate::handlers::HandlerRegistry;
use crate::interrupt::InterruptSignal;
use crate::registry::ModeRegistry;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Self-triggered restores outrank every configured priority.
const RESTORE_PRIORITY: i32 = i32::MAX;
const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub history_capacity: usize,
    pub change_buffer: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            change_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStats {
    pub committed: u64,
    pub rejected: u64,
    pub callback_failures: u64,
    pub interrupts_raised: u64,
    pub auto_restores: u64,
}

/// A handler proposal and what became of it during one tick.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalOutcome {
    pub proposed_by: ModeName,
    pub request: ModeTransitionRequest,
    pub outcome: TransitionOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Outcome of the auto-restore or expiry restore, when one was due.
    pub restore: Option<TransitionOutcome>,
    pub proposals: Vec<ProposalOutcome>,
}

impl TickReport {
    /// The transition this tick committed, if any.
    pub fn committed(&self) -> Option<&TransitionRecord> {
        self.restore
            .as_ref()
            .and_then(TransitionOutcome::record)
            .or_else(|| self.proposals.iter().find_map(|p| p.outcome.record()))
    }
}

#[derive(Debug)]
struct ActiveMode {
    state: ModeState,
    config: ModeConfig,
    entered: Instant,
    epoch: u64,
}

impl ActiveMode {
    fn expired(&self) -> bool {
        self.config
            .max_duration
            .is_some_and(|max| self.entered.elapsed() > max)
    }
}

#[derive(Debug, Clone, Copy)]
enum Admission {
    Priority,
    Restore,
}

struct MachineInner {
    config: MachineConfig,
    modes: RwLock<ModeRegistry>,
    handlers: HandlerRegistry,
    active: RwLock<ActiveMode>,
    history: Mutex<VecDeque<TransitionRecord>>,
    gate: TransitionGate,
    interrupt: InterruptSignal,
    changes: broadcast::Sender<TransitionRecord>,
    stats: Mutex<MachineStats>,
}

/// Cheaply cloneable handle to one state machine.
#[derive(Clone)]
pub struct ModeStateMachine {
    inner: Arc<MachineInner>,
}

impl std::fmt::Debug for ModeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeStateMachine")
            .field("current", &self.current().name)
            .field("handlers", &self.inner.handlers)
            .finish()
    }
}

impl ModeStateMachine {
    pub fn new(config: MachineConfig, modes: ModeRegistry, interrupt: InterruptSignal) -> Self {
        let default_mode = modes.default_mode().clone();
        let default_config = modes
            .get(&default_mode)
            .cloned()
            .unwrap_or_else(|| ModeConfig::new(default_mode.as_str(), 0));
        let (changes, _) = broadcast::channel(config.change_buffer.max(1));
        info!(mode = %default_mode, modes = modes.len(), "mode state machine initialised");
        Self {
            inner: Arc::new(MachineInner {
                history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
                config,
                modes: RwLock::new(modes),
                handlers: HandlerRegistry::new(),
                active: RwLock::new(ActiveMode {
                    state: ModeState::initial(default_mode),
                    config: default_config,
                    entered: Instant::now(),
                    epoch: 0,
                }),
                gate: TransitionGate::new(),
                interrupt,
                changes,
                stats: Mutex::new(MachineStats::default()),
            }),
        }
    }

    // ── Transitions ──

    /// Ask for a transition to `target`. Rejections are returned as values.
    ///
    /// A trigger without an issue epoch takes the epoch of the dispatch it
    /// runs in, when called from an event listener.
    #[instrument(
        skip(self, trigger),
        fields(target = %target, reason = %trigger.reason, triggered_by = %trigger.triggered_by)
    )]
    pub async fn request_transition(
        &self,
        target: ModeName,
        trigger: TransitionTrigger,
    ) -> TransitionOutcome {
        let trigger = match (trigger.issued_epoch, dispatch_epoch()) {
            (None, Some(epoch)) => trigger.issued_at(epoch),
            _ => trigger,
        };
        let Some(target_config) = self.inner.modes.read().get(&target).cloned() else {
            warn!("transition to unknown mode rejected");
            return self.reject(RejectReason::UnknownMode { mode: target });
        };
        if self.inner.active.read().state.mode == target {
            return TransitionOutcome::AlreadyActive;
        }
        let Some(_pass) = self.inner.gate.acquire(target_config.priority).await else {
            warn!("transition rejected: another transition is in flight");
            return self.reject(RejectReason::Busy);
        };
        self.admit_and_commit(target, target_config, trigger, Admission::Priority)
            .await
    }

    /// Apply a handler proposal on behalf of `actor`.
    pub async fn apply_request(
        &self,
        request: ModeTransitionRequest,
        actor: &str,
    ) -> TransitionOutcome {
        self.request_transition(
            request.target_mode,
            TransitionTrigger::new(request.condition_label, actor),
        )
        .await
    }

    /// Return to the default mode regardless of priority.
    pub async fn force_restore_default(&self, reason: impl Into<String>) -> TransitionOutcome {
        self.restore(TransitionTrigger::new(reason, SYSTEM_ACTOR))
            .await
    }

    /// Evaluate soft timers, then collect and resolve handler proposals.
    ///
    /// A due auto-restore or expiry restore runs first. Proposals from every
    /// registered handler are then stable-sorted by request priority (highest
    /// first, registration order among equals); the first one that commits
    /// wins and the rest are superseded.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut committed = false;

        if let Some(reason) = self.restore_due() {
            let outcome = self
                .restore(TransitionTrigger::new(reason, SYSTEM_ACTOR))
                .await;
            if outcome.is_committed() {
                committed = true;
                self.inner.stats.lock().auto_restores += 1;
            }
            report.restore = Some(outcome);
        }

        let mut proposals = Vec::new();
        for (mode, handler) in self.inner.handlers.all() {
            match AssertUnwindSafe(handler.check_transitions())
                .catch_unwind()
                .await
            {
                Ok(requests) => proposals.extend(requests.into_iter().map(|r| (mode.clone(), r))),
                Err(_) => {
                    error!(%mode, "check_transitions panicked");
                    self.inner.stats.lock().callback_failures += 1;
                }
            }
        }
        proposals.sort_by_key(|(_, request)| Reverse(request.request_priority));

        for (proposed_by, request) in proposals {
            let outcome = if committed {
                self.reject(RejectReason::Superseded)
            } else {
                self.apply_request(request.clone(), proposed_by.as_str())
                    .await
            };
            committed |= outcome.is_committed();
            report.proposals.push(ProposalOutcome {
                proposed_by,
                request,
                outcome,
            });
        }
        debug!(
            proposals = report.proposals.len(),
            committed, "mode machine ticked"
        );
        report
    }

    async fn restore(&self, trigger: TransitionTrigger) -> TransitionOutcome {
        let (default_mode, default_config) = {
            let modes = self.inner.modes.read();
            let default_mode = modes.default_mode().clone();
            let config = modes.get(&default_mode).cloned();
            (default_mode, config)
        };
        let Some(default_config) = default_config else {
            return self.reject(RejectReason::UnknownMode { mode: default_mode });
        };
        if self.inner.active.read().state.mode == default_mode {
            return TransitionOutcome::AlreadyActive;
        }
        let Some(_pass) = self.inner.gate.acquire(RESTORE_PRIORITY).await else {
            return self.reject(RejectReason::Busy);
        };
        self.admit_and_commit(default_mode, default_config, trigger, Admission::Restore)
            .await
    }

    fn restore_due(&self) -> Option<String> {
        let default_mode = self.inner.modes.read().default_mode().clone();
        let active = self.inner.active.read();
        if active.state.mode == default_mode {
            return None;
        }
        if active.expired() {
            return Some(format!("{} exceeded its max duration", active.state.mode));
        }
        let delay = active.config.restore_delay;
        if active.config.auto_restore && !delay.is_zero() && active.entered.elapsed() >= delay {
            return Some("auto restore".to_owned());
        }
        None
    }

    /// Must be called while holding the gate.
    async fn admit_and_commit(
        &self,
        target: ModeName,
        target_config: ModeConfig,
        trigger: TransitionTrigger,
        admission: Admission,
    ) -> TransitionOutcome {
        let (current, current_priority, expired, epoch) = {
            let active = self.inner.active.read();
            (
                active.state.mode.clone(),
                active.config.priority,
                active.expired(),
                active.epoch,
            )
        };
        if current == target {
            return TransitionOutcome::AlreadyActive;
        }
        if let Admission::Priority = admission
            && let Some(issued) = trigger.issued_epoch
            && issued < epoch
            && target_config.priority == current_priority
            && !expired
        {
            debug!(
                %current,
                issued,
                epoch,
                "equal-priority request superseded by a later commit"
            );
            return self.reject(RejectReason::Superseded);
        }
        if let Admission::Priority = admission
            && target_config.priority < current_priority
            && !expired
            && !self.handlers_consent(&current, &target)
        {
            warn!(
                %current,
                current_priority,
                requested = target_config.priority,
                "lower-priority transition rejected"
            );
            return self.reject(RejectReason::LowerPriority {
                current: current_priority,
                requested: target_config.priority,
            });
        }
        let record = self.commit(current, target, target_config, trigger).await;
        TransitionOutcome::committed(record)
    }

    /// The current mode's handler yields and the target's handler, when
    /// registered, accepts.
    fn handlers_consent(&self, current: &ModeName, target: &ModeName) -> bool {
        let Some(current_handler) = self.inner.handlers.get(current) else {
            return false;
        };
        if !current_handler.can_exit() {
            return false;
        }
        let target_accepts = self
            .inner
            .handlers
            .get(target)
            .is_none_or(|handler| handler.can_enter());
        if !target_accepts {
            debug!(%target, "target handler refused entry");
        }
        target_accepts
    }

    async fn commit(
        &self,
        from: ModeName,
        to: ModeName,
        to_config: ModeConfig,
        trigger: TransitionTrigger,
    ) -> TransitionRecord {
        let TransitionTrigger {
            reason,
            triggered_by,
            ..
        } = trigger;

        let exit = self
            .inner
            .handlers
            .call_exit(&from, &reason, &triggered_by)
            .await;

        let record = {
            let mut active = self.inner.active.write();
            let raise_interrupt =
                to_config.priority > active.config.priority || !to_config.allow_decision_engine;
            let state = ModeState {
                mode: to.clone(),
                entered_at: Utc::now(),
                reason: reason.clone(),
                triggered_by: triggered_by.clone(),
            };
            let record = TransitionRecord {
                from: from.clone(),
                to: to.clone(),
                at: state.entered_at,
                reason: reason.clone(),
                triggered_by: triggered_by.clone(),
                interrupt_raised: raise_interrupt,
            };
            *active = ActiveMode {
                state,
                config: to_config,
                entered: Instant::now(),
                epoch: active.epoch + 1,
            };
            record
        };
        self.push_history(record.clone());

        let enter = self
            .inner
            .handlers
            .call_enter(&to, &reason, &triggered_by)
            .await;

        if record.interrupt_raised {
            self.inner
                .interrupt
                .raise(format!("mode {from} -> {to}: {reason}"));
        }

        {
            let mut stats = self.inner.stats.lock();
            stats.committed += 1;
            stats.callback_failures += u64::from(exit.is_failure()) + u64::from(enter.is_failure());
            stats.interrupts_raised += u64::from(record.interrupt_raised);
        }
        let _ = self.inner.changes.send(record.clone());
        info!(
            %from,
            %to,
            %reason,
            %triggered_by,
            interrupt = record.interrupt_raised,
            "mode transition committed"
        );
        record
    }

    fn push_history(&self, record: TransitionRecord) {
        let capacity = self.inner.config.history_capacity.max(1);
        let mut history = self.inner.history.lock();
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn reject(&self, reason: RejectReason) -> TransitionOutcome {
        self.inner.stats.lock().rejected += 1;
        TransitionOutcome::rejected(reason)
    }

    // ── Registration ──

    pub fn register_handler(&self, handler: Arc<dyn ModeHandler>) {
        let mode = handler.mode_name();
        if !self.inner.modes.read().contains(&mode) {
            warn!(%mode, "handler registered for a mode with no config");
        }
        self.inner.handlers.register(handler);
    }

    pub fn unregister_handler(&self, mode: &ModeName) -> Option<Arc<dyn ModeHandler>> {
        self.inner.handlers.unregister(mode)
    }

    pub fn handler(&self, mode: &ModeName) -> Option<Arc<dyn ModeHandler>> {
        self.inner.handlers.get(mode)
    }

    pub fn add_mode(&self, name: ModeName, config: ModeConfig) -> CoreResult<()> {
        self.inner.modes.write().add(name.clone(), config)?;
        info!(mode = %name, "mode added");
        Ok(())
    }

    // ── Readers ──

    pub fn current(&self) -> ModeSnapshot {
        self.inner.active.read().state.snapshot()
    }

    pub fn current_mode(&self) -> ModeName {
        self.inner.active.read().state.mode.clone()
    }

    pub fn current_config(&self) -> ModeConfig {
        self.inner.active.read().config.clone()
    }

    /// Number of transitions committed so far.
    pub fn epoch(&self) -> u64 {
        self.inner.active.read().epoch
    }

    pub fn default_mode(&self) -> ModeName {
        self.inner.modes.read().default_mode().clone()
    }

    pub fn is_decision_engine_allowed(&self) -> bool {
        self.inner.active.read().config.allow_decision_engine
    }

    pub fn is_expired(&self) -> bool {
        self.inner.active.read().expired()
    }

    /// Time spent in the current mode.
    pub fn mode_duration(&self) -> Duration {
        self.inner.active.read().entered.elapsed()
    }

    pub fn mode_info(&self, mode: &ModeName) -> Option<ModeInfo> {
        let config = self.inner.modes.read().get(mode).cloned()?;
        let active = self.inner.active.read();
        let is_current = active.state.mode == *mode;
        Some(ModeInfo {
            name: mode.clone(),
            config,
            is_current,
            has_handler: self.inner.handlers.contains(mode),
            duration_secs: is_current.then(|| active.entered.elapsed().as_secs_f64()),
            expired: is_current && active.expired(),
        })
    }

    pub fn available_modes(&self) -> Vec<ModeInfo> {
        let names: Vec<ModeName> = self
            .inner
            .modes
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        names
            .iter()
            .filter_map(|name| self.mode_info(name))
            .collect()
    }

    pub fn shortest_restore_delay(&self) -> Option<Duration> {
        self.inner.modes.read().shortest_restore_delay()
    }

    /// Committed transitions, oldest first.
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
        info!("mode transition history cleared");
    }

    pub fn handler_statuses(&self) -> IndexMap<ModeName, serde_json::Value> {
        self.inner
            .handlers
            .all()
            .into_iter()
            .map(|(mode, handler)| (mode, handler.status()))
            .collect()
    }

    pub fn stats(&self) -> MachineStats {
        self.inner.stats.lock().clone()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<TransitionRecord> {
        self.inner.changes.subscribe()
    }

    pub fn interrupt(&self) -> &InterruptSignal {
        &self.inner.interrupt
    }
}

impl EpochSource for ModeStateMachine {
    fn current_epoch(&self) -> u64 {
        self.epoch()
    }
}

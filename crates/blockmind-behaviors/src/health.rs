use std::sync::Arc;

use async_trait::async_trait;
use blockmind_protocol::{
    BoxError, EventKind, EventListener, GameEvent, ModeName, TransitionOutcome, TransitionTrigger,
};
use blockmind_runtime::ModeStateMachine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_CRITICAL_HEALTH: f64 = 6.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// At or below this value the monitor asks for combat mode.
    pub critical_health: f64,
    pub interrupt_on_damage: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            critical_health: DEFAULT_CRITICAL_HEALTH,
            interrupt_on_damage: true,
        }
    }
}

/// Watches `health` events. Any drop interrupts the running behavior; a
/// critical value requests combat mode.
pub struct HealthMonitor {
    config: HealthConfig,
    machine: ModeStateMachine,
    last_health: Mutex<Option<f64>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, machine: ModeStateMachine) -> Self {
        Self {
            config,
            machine,
            last_health: Mutex::new(None),
        }
    }

    pub fn last_health(&self) -> Option<f64> {
        *self.last_health.lock()
    }
}

#[async_trait]
impl EventListener for HealthMonitor {
    async fn on_event(&self, event: Arc<GameEvent>) -> Result<(), BoxError> {
        let EventKind::Health {
            health: Some(health),
            ..
        } = event.kind
        else {
            return Ok(());
        };
        let previous = self.last_health.lock().replace(health);

        if let Some(previous) = previous
            && health < previous
            && self.config.interrupt_on_damage
        {
            let damage = previous - health;
            warn!(damage, health, "took damage");
            self.machine
                .interrupt()
                .raise(format!("took {damage} damage, health now {health}"));
        }

        if health <= self.config.critical_health {
            let outcome = self
                .machine
                .request_transition(
                    ModeName::combat(),
                    TransitionTrigger::new("health critical", self.label()),
                )
                .await;
            match outcome {
                TransitionOutcome::Committed { .. } => info!(health, "entered combat on critical health"),
                other => debug!(health, ?other, "combat request not committed"),
            }
        }
        Ok(())
    }

    fn label(&self) -> &str {
        "health-monitor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmind_runtime::{InterruptSignal, MachineConfig, ModeRegistry};

    fn machine() -> ModeStateMachine {
        ModeStateMachine::new(
            MachineConfig::default(),
            ModeRegistry::builtin(),
            InterruptSignal::new(),
        )
    }

    fn health(value: f64) -> Arc<GameEvent> {
        Arc::new(GameEvent::new(EventKind::Health {
            health: Some(value),
            food: Some(20.0),
            food_saturation: None,
        }))
    }

    #[tokio::test]
    async fn damage_raises_interrupt_without_mode_change() -> Result<(), BoxError> {
        let machine = machine();
        let monitor = HealthMonitor::new(HealthConfig::default(), machine.clone());

        monitor.on_event(health(20.0)).await?;
        assert!(!machine.interrupt().is_raised());

        monitor.on_event(health(18.0)).await?;
        assert_eq!(
            machine.interrupt().requested().as_deref(),
            Some("took 2 damage, health now 18")
        );
        assert_eq!(machine.current_mode(), ModeName::main());
        assert_eq!(monitor.last_health(), Some(18.0));
        Ok(())
    }

    #[tokio::test]
    async fn critical_health_requests_combat() -> Result<(), BoxError> {
        let machine = machine();
        let monitor = HealthMonitor::new(HealthConfig::default(), machine.clone());

        monitor.on_event(health(4.0)).await?;
        let current = machine.current();
        assert_eq!(current.name, ModeName::combat());
        assert_eq!(current.reason, "health critical");
        assert_eq!(current.triggered_by, "health-monitor");
        assert!(!machine.is_decision_engine_allowed());
        assert!(machine.interrupt().is_raised());
        Ok(())
    }

    #[tokio::test]
    async fn ignores_other_kinds_and_disabled_damage_interrupt() -> Result<(), BoxError> {
        let machine = machine();
        let config = HealthConfig {
            interrupt_on_damage: false,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(config, machine.clone());

        monitor
            .on_event(Arc::new(GameEvent::new(EventKind::Rain)))
            .await?;
        assert_eq!(monitor.last_health(), None);

        monitor.on_event(health(20.0)).await?;
        monitor.on_event(health(10.0)).await?;
        assert!(!machine.interrupt().is_raised());
        Ok(())
    }
}

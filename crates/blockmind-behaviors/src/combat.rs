//! Threat tracking and the `combat` mode handler.
//!
//! [`CombatHandler`] is both a [`ModeHandler`] for `combat` and an
//! [`EventListener`] for `entityHurt`/`entityDead`. The world poller feeds it
//! nearby entities through [`CombatHandler::observe_entities`]; on each tick it
//! proposes entering combat while hostiles are around and returning to the
//! default mode once things have been calm for long enough.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockmind_protocol::{
    BoxError, EntityInfo, EventKind, EventListener, GameEvent, ModeHandler, ModeName,
    ModeTransitionRequest,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

pub const HOSTILE_NEARBY: &str = "hostile_nearby";
pub const THREATS_CLEARED: &str = "threats_cleared";

const ENGAGE_PRIORITY: i32 = 100;
const DISENGAGE_PRIORITY: i32 = 0;

const HOSTILE_MOBS: &[&str] = &[
    "zombie",
    "skeleton",
    "creeper",
    "spider",
    "cave_spider",
    "enderman",
    "witch",
    "blaze",
    "ghast",
    "magma_cube",
    "slime",
    "guardian",
    "elder_guardian",
    "wither_skeleton",
    "stray",
    "husk",
    "drowned",
    "phantom",
    "zombie_villager",
    "evoker",
    "vindicator",
    "pillager",
    "ravager",
    "vex",
    "warden",
];

/// Whether an entity counts as a threat: typed `hostile` or a known mob name.
pub fn is_hostile(entity: &EntityInfo) -> bool {
    if entity.entity_type.as_deref() == Some("hostile") {
        return true;
    }
    entity
        .name
        .as_deref()
        .map(str::to_ascii_lowercase)
        .is_some_and(|name| HOSTILE_MOBS.contains(&name.as_str()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatConfig {
    pub enabled: bool,
    /// Seconds without threats before proposing a return to the default mode.
    pub calm_secs: f64,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            calm_secs: 5.0,
        }
    }
}

impl ThreatConfig {
    pub fn calm_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.calm_secs).unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Default)]
struct CombatState {
    threats: u32,
    active: bool,
    entered_at: Option<DateTime<Utc>>,
    calm_since: Option<Instant>,
    engagements: u64,
}

impl CombatState {
    fn set_threats(&mut self, count: u32) {
        if count == 0 && (self.threats > 0 || self.calm_since.is_none()) {
            self.calm_since = Some(Instant::now());
        } else if count > 0 {
            self.calm_since = None;
        }
        self.threats = count;
    }
}

pub struct CombatHandler {
    config: ThreatConfig,
    default_mode: ModeName,
    state: Mutex<CombatState>,
}

impl CombatHandler {
    pub fn new(config: ThreatConfig, default_mode: ModeName) -> Self {
        Self {
            config,
            default_mode,
            state: Mutex::new(CombatState::default()),
        }
    }

    /// Replace the threat count with a fresh observation.
    pub fn observe_threats(&self, count: u32) {
        let mut state = self.state.lock();
        if count != state.threats {
            debug!(previous = state.threats, count, "threat count changed");
        }
        state.set_threats(count);
    }

    /// Count hostiles among `entities` and record the result.
    pub fn observe_entities(&self, entities: &[EntityInfo]) -> u32 {
        let count = entities.iter().filter(|e| is_hostile(e)).count();
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        self.observe_threats(count);
        count
    }

    pub fn threat_count(&self) -> u32 {
        self.state.lock().threats
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }
}

#[async_trait]
impl ModeHandler for CombatHandler {
    fn mode_name(&self) -> ModeName {
        ModeName::combat()
    }

    async fn on_enter(&self, reason: &str, triggered_by: &str) -> Result<(), BoxError> {
        let mut state = self.state.lock();
        state.active = true;
        state.entered_at = Some(Utc::now());
        state.engagements += 1;
        if state.threats == 0 {
            state.calm_since = Some(Instant::now());
        }
        info!(threats = state.threats, %reason, %triggered_by, "combat engaged");
        Ok(())
    }

    async fn on_exit(&self, reason: &str, triggered_by: &str) -> Result<(), BoxError> {
        let mut state = self.state.lock();
        state.active = false;
        state.entered_at = None;
        info!(threats = state.threats, %reason, %triggered_by, "combat disengaged");
        Ok(())
    }

    fn can_exit(&self) -> bool {
        self.state.lock().threats == 0
    }

    fn status(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "enabled": self.config.enabled,
            "threats": state.threats,
            "active": state.active,
            "entered_at": state.entered_at,
            "engagements": state.engagements,
        })
    }

    async fn check_transitions(&self) -> Vec<ModeTransitionRequest> {
        if !self.config.enabled {
            return Vec::new();
        }
        let state = self.state.lock();
        if state.threats > 0 && !state.active {
            return vec![ModeTransitionRequest::new(
                ModeName::combat(),
                ENGAGE_PRIORITY,
                HOSTILE_NEARBY,
            )];
        }
        let calm = state
            .calm_since
            .is_some_and(|since| since.elapsed() >= self.config.calm_period());
        if state.active && state.threats == 0 && calm {
            return vec![ModeTransitionRequest::new(
                self.default_mode.clone(),
                DISENGAGE_PRIORITY,
                THREATS_CLEARED,
            )];
        }
        Vec::new()
    }
}

#[async_trait]
impl EventListener for CombatHandler {
    async fn on_event(&self, event: Arc<GameEvent>) -> Result<(), BoxError> {
        match &event.kind {
            EventKind::EntityHurt {
                source: Some(source),
                ..
            } if is_hostile(source) => {
                let mut state = self.state.lock();
                let count = state.threats.saturating_add(1);
                state.set_threats(count);
                debug!(source = source.label(), threats = count, "hostile attack observed");
            }
            EventKind::EntityDead {
                entity: Some(entity),
            } if is_hostile(entity) => {
                let mut state = self.state.lock();
                let count = state.threats.saturating_sub(1);
                state.set_threats(count);
                debug!(entity = entity.label(), threats = count, "hostile killed");
            }
            _ => {}
        }
        Ok(())
    }

    fn label(&self) -> &str {
        "combat-handler"
    }
}

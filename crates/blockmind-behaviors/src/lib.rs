//! Reference behaviors wired onto the core: a health monitor that interrupts
//! on damage and escalates to combat, the combat mode handler with its threat
//! tracking, and a watcher for server-forced moves.

pub mod combat;
pub mod health;
pub mod movement;

pub use combat::{CombatHandler, HOSTILE_NEARBY, THREATS_CLEARED, ThreatConfig, is_hostile};
pub use health::{DEFAULT_CRITICAL_HEALTH, HealthConfig, HealthMonitor};
pub use movement::{ForcedMoveWatcher, TELEPORTED};

//! Mode descriptors, state and transition results.
//!
//! A mode is a named behavioral state with a priority and a flag saying
//! whether the decision engine may drive the agent while it is active.
//! Higher priority preempts lower.

use crate::ids::ModeName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static descriptor of one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub allow_decision_engine: bool,
    /// Ceiling before the machine forces a return to the default mode.
    #[serde(
        rename = "max_duration_secs",
        default,
        with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_duration: Option<Duration>,
    #[serde(default)]
    pub auto_restore: bool,
    /// Idle time after entering before auto-restore kicks in.
    #[serde(rename = "restore_delay_secs", default, with = "secs")]
    pub restore_delay: Duration,
}

fn default_true() -> bool {
    true
}

impl ModeConfig {
    /// A mode that lets the decision engine run, with no timers.
    pub fn new(display_name: impl Into<String>, priority: i32) -> Self {
        Self {
            display_name: display_name.into(),
            description: String::new(),
            priority,
            allow_decision_engine: true,
            max_duration: None,
            auto_restore: false,
            restore_delay: Duration::ZERO,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn blocking_decision_engine(mut self) -> Self {
        self.allow_decision_engine = false;
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    pub fn with_auto_restore(mut self, delay: Duration) -> Self {
        self.auto_restore = true;
        self.restore_delay = delay;
        self
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The single piece of mutable mode state: which mode is active and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeState {
    pub mode: ModeName,
    pub entered_at: DateTime<Utc>,
    pub reason: String,
    pub triggered_by: String,
}

impl ModeState {
    pub fn initial(mode: ModeName) -> Self {
        Self {
            mode,
            entered_at: Utc::now(),
            reason: "initial".to_owned(),
            triggered_by: "system".to_owned(),
        }
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        ModeSnapshot {
            name: self.mode.clone(),
            entered_at: self.entered_at,
            reason: self.reason.clone(),
            triggered_by: self.triggered_by.clone(),
        }
    }
}

/// What behavior loops read as "the current mode".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSnapshot {
    pub name: ModeName,
    pub entered_at: DateTime<Utc>,
    pub reason: String,
    pub triggered_by: String,
}

/// Descriptive view of a configured mode, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeInfo {
    pub name: ModeName,
    pub config: ModeConfig,
    pub is_current: bool,
    pub has_handler: bool,
    /// Seconds spent in the mode so far; only set for the current mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub expired: bool,
}

/// Proposal emitted by a mode handler. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeTransitionRequest {
    pub target_mode: ModeName,
    pub request_priority: i32,
    pub condition_label: String,
}

impl ModeTransitionRequest {
    pub fn new(
        target_mode: ModeName,
        request_priority: i32,
        condition_label: impl Into<String>,
    ) -> Self {
        Self {
            target_mode,
            request_priority,
            condition_label: condition_label.into(),
        }
    }
}

/// Who asked for a transition and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionTrigger {
    pub reason: String,
    pub triggered_by: String,
    /// Transition epoch the requester observed when it decided to ask.
    /// Requests made from a listener inherit the epoch of their dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_epoch: Option<u64>,
}

impl TransitionTrigger {
    pub fn new(reason: impl Into<String>, triggered_by: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            triggered_by: triggered_by.into(),
            issued_epoch: None,
        }
    }

    pub fn issued_at(mut self, epoch: u64) -> Self {
        self.issued_epoch = Some(epoch);
        self
    }
}

/// One committed transition, as kept in history and broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ModeName,
    pub to: ModeName,
    pub at: DateTime<Utc>,
    pub reason: String,
    pub triggered_by: String,
    pub interrupt_raised: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownMode { mode: ModeName },
    LowerPriority { current: i32, requested: i32 },
    /// Another transition of equal or higher priority was in flight.
    Busy,
    /// Lost an equal-priority tie-break: another transition committed after
    /// this request was issued, or an earlier proposal won the same tick.
    Superseded,
}

/// Result of a transition request. Rejections are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Committed { record: TransitionRecord },
    AlreadyActive,
    Rejected { reason: RejectReason },
}

impl TransitionOutcome {
    pub fn committed(record: TransitionRecord) -> Self {
        Self::Committed { record }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self::Rejected { reason }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    pub fn record(&self) -> Option<&TransitionRecord> {
        match self {
            Self::Committed { record } => Some(record),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_config_serializes_seconds() {
        let cfg = ModeConfig::new("Combat", 100)
            .blocking_decision_engine()
            .with_max_duration(Duration::from_secs(300))
            .with_auto_restore(Duration::from_millis(10_500));
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["max_duration_secs"], 300.0);
        assert_eq!(json["restore_delay_secs"], 10.5);
        let back: ModeConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn mode_config_defaults_when_sparse() {
        let cfg: ModeConfig = serde_json::from_str(r#"{"display_name":"Chest"}"#).unwrap();
        assert_eq!(cfg.priority, 0);
        assert!(cfg.allow_decision_engine);
        assert!(cfg.max_duration.is_none());
        assert!(!cfg.auto_restore);
        assert_eq!(cfg.restore_delay, Duration::ZERO);
    }

    #[test]
    fn negative_seconds_are_rejected() {
        let err = serde_json::from_str::<ModeConfig>(
            r#"{"display_name":"x","restore_delay_secs":-1.0}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn outcome_helpers() {
        let record = TransitionRecord {
            from: ModeName::main(),
            to: ModeName::combat(),
            at: Utc::now(),
            reason: "hostile".into(),
            triggered_by: "test".into(),
            interrupt_raised: true,
        };
        let outcome = TransitionOutcome::committed(record.clone());
        assert!(outcome.is_committed());
        assert_eq!(outcome.record(), Some(&record));

        let rejected = TransitionOutcome::rejected(RejectReason::Busy);
        assert!(!rejected.is_committed());
        let json = serde_json::to_value(&rejected).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"]["kind"], "busy");
    }
}

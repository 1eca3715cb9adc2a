//! Core configuration: TOML file, environment overrides, validation.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use blockmind_behaviors::{HealthConfig, ThreatConfig};
use blockmind_events::{
    DEFAULT_MAX_CONCURRENT_LISTENERS, DEFAULT_MAX_LISTENERS, DEFAULT_MAX_LISTENERS_PER_SUBSCRIPTION,
    DEFAULT_STORE_CAPACITY,
};
use blockmind_protocol::{ModeConfig, ModeName};
use blockmind_runtime::{DEFAULT_HISTORY_CAPACITY, builtin_modes};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const ENV_MAX_LISTENERS: &str = "BLOCKMIND_MAX_LISTENERS";
pub const ENV_EVENT_STORE_CAPACITY: &str = "BLOCKMIND_EVENT_STORE_CAPACITY";
pub const ENV_TICK_INTERVAL_MS: &str = "BLOCKMIND_TICK_INTERVAL_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `path` is `None` for documents parsed from a string.
    #[error("failed to parse config{}: {source}", describe_origin(.path.as_deref()))]
    ParseToml {
        path: Option<PathBuf>,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for environment variable '{name}': {message}")]
    InvalidEnvVar { name: String, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

fn describe_origin(path: Option<&Path>) -> String {
    path.map(|path| format!(" file '{}'", path.display()))
        .unwrap_or_default()
}

/// Everything needed to assemble an [`AgentCore`](crate::AgentCore).
///
/// Every field has a default, so an empty file is a valid config. A `modes`
/// table, when present, replaces the built-in table entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Global ceiling on registered listeners, across all subscriptions.
    pub max_listeners: usize,
    pub max_listeners_per_subscription: usize,
    /// Listener calls of one event allowed to run at the same time.
    pub max_concurrent_listeners: usize,
    pub event_store_capacity: usize,
    pub history_capacity: usize,
    pub stream_buffer: usize,
    pub tick_interval_ms: u64,
    pub default_mode: ModeName,
    pub modes: IndexMap<ModeName, ModeConfig>,
    pub health: HealthConfig,
    pub threat: ThreatConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_listeners: DEFAULT_MAX_LISTENERS,
            max_listeners_per_subscription: DEFAULT_MAX_LISTENERS_PER_SUBSCRIPTION,
            max_concurrent_listeners: DEFAULT_MAX_CONCURRENT_LISTENERS,
            event_store_capacity: DEFAULT_STORE_CAPACITY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            stream_buffer: 256,
            tick_interval_ms: 500,
            default_mode: ModeName::main(),
            modes: builtin_modes(),
            health: HealthConfig::default(),
            threat: ThreatConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Parse and validate a TOML document. Environment is not consulted.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|source| ConfigError::ParseToml { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, apply `BLOCKMIND_*` environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseToml {
            path: Some(path.to_path_buf()),
            source,
        })?;
        config.apply_env_overrides()?;
        config.validate()?;
        debug!(path = %path.display(), modes = config.modes.len(), "config loaded");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_MAX_LISTENERS) {
            self.max_listeners = parse_env(ENV_MAX_LISTENERS, &value)?;
        }
        if let Some(value) = lookup(ENV_EVENT_STORE_CAPACITY) {
            self.event_store_capacity = parse_env(ENV_EVENT_STORE_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_TICK_INTERVAL_MS) {
            self.tick_interval_ms = parse_env(ENV_TICK_INTERVAL_MS, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modes.is_empty() {
            return Err(ConfigError::invalid("mode table is empty"));
        }
        if !self.modes.contains_key(&self.default_mode) {
            return Err(ConfigError::invalid(format!(
                "default mode '{}' is not in the mode table",
                self.default_mode
            )));
        }
        for (name, value) in [
            ("max_listeners", self.max_listeners),
            ("max_listeners_per_subscription", self.max_listeners_per_subscription),
            ("max_concurrent_listeners", self.max_concurrent_listeners),
            ("event_store_capacity", self.event_store_capacity),
            ("history_capacity", self.history_capacity),
            ("stream_buffer", self.stream_buffer),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(format!("{name} must be at least 1")));
            }
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("tick_interval_ms must be at least 1"));
        }
        if let Some(shortest) = self.shortest_restore_delay()
            && self.tick_interval() > shortest
        {
            return Err(ConfigError::invalid(format!(
                "tick_interval_ms {} is longer than the shortest restore delay ({:.3}s)",
                self.tick_interval_ms,
                shortest.as_secs_f64()
            )));
        }
        if !self.health.critical_health.is_finite() {
            return Err(ConfigError::invalid("health.critical_health must be finite"));
        }
        if !(self.threat.calm_secs.is_finite() && self.threat.calm_secs >= 0.0) {
            return Err(ConfigError::invalid("threat.calm_secs must be a non-negative number"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    fn shortest_restore_delay(&self) -> Option<Duration> {
        self.modes
            .values()
            .filter(|mode| mode.auto_restore && !mode.restore_delay.is_zero())
            .map(|mode| mode.restore_delay)
            .min()
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::InvalidEnvVar {
            name: name.to_owned(),
            message: err.to_string(),
        })
}

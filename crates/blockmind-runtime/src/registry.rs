use std::time::Duration;

use blockmind_protocol::{CoreError, CoreResult, ModeConfig, ModeName};
use indexmap::IndexMap;
use tracing::warn;

/// The built-in mode table: `main`, `combat`, `furnace_gui`, `chest_gui`.
pub fn builtin_modes() -> IndexMap<ModeName, ModeConfig> {
    let mut modes = IndexMap::new();
    modes.insert(
        ModeName::main(),
        ModeConfig::new("Main", 0)
            .with_description("normal decision-engine driven play"),
    );
    modes.insert(
        ModeName::combat(),
        ModeConfig::new("Combat", 100)
            .with_description("threat detected, fully program controlled")
            .blocking_decision_engine()
            .with_max_duration(Duration::from_secs(300))
            .with_auto_restore(Duration::from_secs(10)),
    );
    modes.insert(
        ModeName::from_string("furnace_gui"),
        ModeConfig::new("Furnace GUI", 10).with_description("operating a furnace"),
    );
    modes.insert(
        ModeName::from_string("chest_gui"),
        ModeConfig::new("Chest GUI", 10).with_description("operating a chest"),
    );
    modes
}

/// Exactly one [`ModeConfig`] per mode name, plus the designated default.
#[derive(Debug, Clone)]
pub struct ModeRegistry {
    modes: IndexMap<ModeName, ModeConfig>,
    default_mode: ModeName,
}

impl ModeRegistry {
    pub fn builtin() -> Self {
        Self {
            modes: builtin_modes(),
            default_mode: ModeName::main(),
        }
    }

    pub fn new(default_mode: ModeName, modes: IndexMap<ModeName, ModeConfig>) -> CoreResult<Self> {
        if modes.is_empty() {
            return Err(CoreError::InvalidConfig("mode table is empty".to_owned()));
        }
        if !modes.contains_key(&default_mode) {
            return Err(CoreError::UnknownMode(default_mode.to_string()));
        }
        Ok(Self {
            modes,
            default_mode,
        })
    }

    /// Insert or replace a mode. Returns the replaced config.
    pub fn insert(&mut self, name: ModeName, config: ModeConfig) -> Option<ModeConfig> {
        let previous = self.modes.insert(name.clone(), config);
        if previous.is_some() {
            warn!(mode = %name, "mode config replaced");
        }
        previous
    }

    /// Add a mode that must not exist yet.
    pub fn add(&mut self, name: ModeName, config: ModeConfig) -> CoreResult<()> {
        if self.modes.contains_key(&name) {
            return Err(CoreError::DuplicateMode(name.to_string()));
        }
        self.modes.insert(name, config);
        Ok(())
    }

    pub fn get(&self, name: &ModeName) -> Option<&ModeConfig> {
        self.modes.get(name)
    }

    pub fn contains(&self, name: &ModeName) -> bool {
        self.modes.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModeName, &ModeConfig)> {
        self.modes.iter()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn default_mode(&self) -> &ModeName {
        &self.default_mode
    }

    /// Smallest positive `restore_delay` among auto-restoring modes. The
    /// machine must be ticked at least this often.
    pub fn shortest_restore_delay(&self) -> Option<Duration> {
        self.modes
            .values()
            .filter(|config| config.auto_restore && !config.restore_delay.is_zero())
            .map(|config| config.restore_delay)
            .min()
    }

    pub fn to_map(&self) -> IndexMap<ModeName, ModeConfig> {
        self.modes.clone()
    }
}

impl Default for ModeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

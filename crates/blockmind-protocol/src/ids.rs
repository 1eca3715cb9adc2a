//! Canonical ID types for the core.
//!
//! IDs are opaque String wrappers (serde-transparent). Event and listener ids
//! are generated as UUID v4; mode names are chosen by configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }
    };
}

typed_id!(
    /// Unique identifier for a dispatched event.
    EventId
);
typed_id!(
    /// Unique identifier for a listener registration on the bus.
    ListenerId
);
typed_id!(
    /// Name of a configured mode. The default mode is "main".
    ModeName
);

generated_id!(EventId);
generated_id!(ListenerId);

impl ModeName {
    /// The default "main" mode, where the decision engine drives the agent.
    pub fn main() -> Self {
        Self("main".to_owned())
    }

    /// The built-in "combat" mode.
    pub fn combat() -> Self {
        Self("combat".to_owned())
    }
}

impl PartialEq<str> for ModeName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ModeName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_new_is_unique() {
        let a = EventId::new_uuid();
        let b = EventId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn mode_name_main() {
        let id = ModeName::main();
        assert_eq!(id.as_str(), "main");
        assert_eq!(id, "main");
    }

    #[test]
    fn mode_name_from_str_trait() {
        let id: ModeName = "chest_gui".into();
        assert_eq!(id.to_string(), "chest_gui");
    }

    #[test]
    fn typed_id_serde_is_transparent() {
        let id = ListenerId::from_string("L-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"L-1\"");
        let back: ListenerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn typed_id_hash_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ModeName::from_string("combat"));
        assert!(set.contains(&ModeName::combat()));
    }
}

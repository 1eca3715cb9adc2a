//! Canonical game event types.
//!
//! A [`GameEvent`] is an immutable record of something the world poller
//! observed. Its [`EventKind`] is a tagged union over the closed set of kinds
//! the core understands, plus an `Unknown` fallback that keeps the raw payload.
//!
//! Forward-compatible: unknown `"type"` tags deserialize into
//! `Unknown { name, data }` instead of failing.

use crate::ids::EventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

// ─── Tags ──────────────────────────────────────────────────────────

/// Discriminant of an [`EventKind`], used for subscriptions and store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventTag {
    Chat,
    PlayerJoined,
    PlayerLeft,
    Death,
    Spawn,
    SpawnReset,
    Rain,
    Kicked,
    Health,
    Breath,
    EntityHurt,
    EntityDead,
    PlayerCollect,
    ItemDrop,
    ForcedMove,
    /// Fallback for payloads whose name is not in the taxonomy.
    Unknown,
}

impl EventTag {
    /// Every known tag, in taxonomy order. `Unknown` is not included.
    pub const ALL: [EventTag; 15] = [
        EventTag::Chat,
        EventTag::PlayerJoined,
        EventTag::PlayerLeft,
        EventTag::Death,
        EventTag::Spawn,
        EventTag::SpawnReset,
        EventTag::Rain,
        EventTag::Kicked,
        EventTag::Health,
        EventTag::Breath,
        EventTag::EntityHurt,
        EventTag::EntityDead,
        EventTag::PlayerCollect,
        EventTag::ItemDrop,
        EventTag::ForcedMove,
    ];

    /// Wire name of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::PlayerJoined => "playerJoined",
            Self::PlayerLeft => "playerLeft",
            Self::Death => "death",
            Self::Spawn => "spawn",
            Self::SpawnReset => "spawnReset",
            Self::Rain => "rain",
            Self::Kicked => "kicked",
            Self::Health => "health",
            Self::Breath => "breath",
            Self::EntityHurt => "entityHurt",
            Self::EntityDead => "entityDead",
            Self::PlayerCollect => "playerCollect",
            Self::ItemDrop => "itemDrop",
            Self::ForcedMove => "forcedMove",
            Self::Unknown => "unknown",
        }
    }

    /// Parse an exact wire name. Returns `None` for names outside the taxonomy.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == name)
    }

    /// Whether the tag belongs to the "things happening in the world" category
    /// surfaced to the decision engine (as opposed to chat and self-status).
    pub fn is_world_event(self) -> bool {
        matches!(
            self,
            Self::Death
                | Self::EntityDead
                | Self::EntityHurt
                | Self::ItemDrop
                | Self::PlayerCollect
                | Self::PlayerJoined
                | Self::PlayerLeft
                | Self::Rain
                | Self::Spawn
                | Self::SpawnReset
        )
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Payload value types ───────────────────────────────────────────

/// A block-space position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1})", self.x, self.y, self.z)
    }
}

/// Player identity as reported by the game client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamemode: Option<i64>,
}

/// An entity (mob, player, item) involved in an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl EntityInfo {
    /// Best human-readable label: username, then name, then "entity".
    pub fn label(&self) -> &str {
        self.username
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("entity")
    }
}

/// One stack of items in an `itemDrop` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DroppedItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

// ─── EventKind ─────────────────────────────────────────────────────

/// Discriminated union of all game event kinds.
///
/// Every payload field is optional: the factory fills what it can validate
/// and leaves the rest absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventKind {
    Chat {
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    PlayerJoined {
        #[serde(skip_serializing_if = "Option::is_none")]
        player: Option<PlayerInfo>,
    },
    PlayerLeft {
        #[serde(skip_serializing_if = "Option::is_none")]
        player: Option<PlayerInfo>,
    },
    Death,
    Spawn,
    SpawnReset,
    Rain,
    Kicked {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        logged_in: Option<bool>,
    },
    Health {
        #[serde(skip_serializing_if = "Option::is_none")]
        health: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        food: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        food_saturation: Option<f64>,
    },
    Breath {
        #[serde(skip_serializing_if = "Option::is_none")]
        oxygen_level: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        health: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        food: Option<f64>,
    },
    EntityHurt {
        #[serde(skip_serializing_if = "Option::is_none")]
        entity: Option<EntityInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<EntityInfo>,
    },
    EntityDead {
        #[serde(skip_serializing_if = "Option::is_none")]
        entity: Option<EntityInfo>,
    },
    PlayerCollect {
        #[serde(skip_serializing_if = "Option::is_none")]
        collector: Option<EntityInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_count: Option<u32>,
    },
    ItemDrop {
        dropped: Vec<DroppedItem>,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
    },
    ForcedMove {
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
    },
    /// Fallback preserving a payload the taxonomy does not know.
    Unknown { name: String, data: serde_json::Value },
}

impl EventKind {
    pub fn tag(&self) -> EventTag {
        match self {
            Self::Chat { .. } => EventTag::Chat,
            Self::PlayerJoined { .. } => EventTag::PlayerJoined,
            Self::PlayerLeft { .. } => EventTag::PlayerLeft,
            Self::Death => EventTag::Death,
            Self::Spawn => EventTag::Spawn,
            Self::SpawnReset => EventTag::SpawnReset,
            Self::Rain => EventTag::Rain,
            Self::Kicked { .. } => EventTag::Kicked,
            Self::Health { .. } => EventTag::Health,
            Self::Breath { .. } => EventTag::Breath,
            Self::EntityHurt { .. } => EventTag::EntityHurt,
            Self::EntityDead { .. } => EventTag::EntityDead,
            Self::PlayerCollect { .. } => EventTag::PlayerCollect,
            Self::ItemDrop { .. } => EventTag::ItemDrop,
            Self::ForcedMove { .. } => EventTag::ForcedMove,
            Self::Unknown { .. } => EventTag::Unknown,
        }
    }
}

// ─── GameEvent ─────────────────────────────────────────────────────

/// Wall-clock plus monotonic time of an event.
///
/// Store windows are computed from `mono`; `wall` is what gets serialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventTimestamp {
    pub wall: DateTime<Utc>,
    #[serde(skip, default = "Instant::now")]
    pub mono: Instant,
}

impl EventTimestamp {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    /// A timestamp `age` in the past on both clocks. Saturates at "now" when
    /// the monotonic clock cannot go back that far.
    pub fn ago(age: Duration) -> Self {
        let now = Self::now();
        let wall = chrono::Duration::from_std(age)
            .ok()
            .and_then(|d| now.wall.checked_sub_signed(d))
            .unwrap_or(now.wall);
        let mono = now.mono.checked_sub(age).unwrap_or(now.mono);
        Self { wall, mono }
    }

    /// Time elapsed between this timestamp and `now` on the monotonic clock.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.mono)
    }
}

/// The immutable event record dispatched by the bus and kept by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub event_id: EventId,
    pub kind: EventKind,
    pub timestamp: EventTimestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_tick: Option<u64>,
}

impl GameEvent {
    /// Create an event of `kind` stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_id: EventId::default(),
            kind,
            timestamp: EventTimestamp::now(),
            game_tick: None,
        }
    }

    pub fn with_game_tick(mut self, tick: u64) -> Self {
        self.game_tick = Some(tick);
        self
    }

    pub fn with_timestamp(mut self, timestamp: EventTimestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn tag(&self) -> EventTag {
        self.kind.tag()
    }

    /// The kind's fields as a JSON object, without the `type` discriminant.
    /// For `Unknown` events this is the preserved raw payload.
    pub fn payload(&self) -> serde_json::Value {
        if let EventKind::Unknown { data, .. } = &self.kind {
            return data.clone();
        }
        let mut value = serde_json::to_value(&self.kind)
            .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
        if let Some(obj) = value.as_object_mut() {
            obj.remove("type");
        }
        value
    }

    /// One-line English description used as decision-engine context.
    pub fn describe(&self) -> String {
        let body = match &self.kind {
            EventKind::Chat { username, message } => format!(
                "{} said: {}",
                username.as_deref().unwrap_or("someone"),
                message.as_deref().unwrap_or("")
            ),
            EventKind::PlayerJoined { player } => format!(
                "{} joined the game",
                player
                    .as_ref()
                    .and_then(|p| p.username.as_deref())
                    .unwrap_or("a player")
            ),
            EventKind::PlayerLeft { player } => format!(
                "{} left the game",
                player
                    .as_ref()
                    .and_then(|p| p.username.as_deref())
                    .unwrap_or("a player")
            ),
            EventKind::Death => "you died".to_owned(),
            EventKind::Spawn => "you spawned".to_owned(),
            EventKind::SpawnReset => "your spawn point was reset".to_owned(),
            EventKind::Rain => "it started raining".to_owned(),
            EventKind::Kicked { reason, .. } => match reason {
                Some(reason) => format!("you were kicked: {reason}"),
                None => "you were kicked".to_owned(),
            },
            EventKind::Health {
                health,
                food,
                food_saturation,
            } => status_line(
                "status update",
                &[
                    ("health", *health),
                    ("food", *food),
                    ("saturation", *food_saturation),
                ],
            ),
            EventKind::Breath {
                oxygen_level,
                health,
                food,
            } => status_line(
                "breath update",
                &[
                    ("oxygen", *oxygen_level),
                    ("health", *health),
                    ("food", *food),
                ],
            ),
            EventKind::EntityHurt { entity, source } => match entity {
                Some(entity) => {
                    let mut line = format!("{} was hurt", entity.label());
                    if let Some(source) = source {
                        line.push_str(&format!(" by {}", source.label()));
                    }
                    if let Some(health) = entity.health {
                        line.push_str(&format!(", health now {health}"));
                    }
                    line
                }
                None => "an entity was hurt".to_owned(),
            },
            EventKind::EntityDead { entity } => format!(
                "{} died",
                entity.as_ref().map(EntityInfo::label).unwrap_or("an entity")
            ),
            EventKind::PlayerCollect {
                collector,
                item_type,
                item_count,
            } => {
                let who = collector.as_ref().map(EntityInfo::label).unwrap_or("someone");
                match (item_type, item_count) {
                    (Some(item), Some(count)) => format!("{who} collected {item} x{count}"),
                    (Some(item), None) => format!("{who} collected {item}"),
                    _ => format!("{who} collected an item"),
                }
            }
            EventKind::ItemDrop { dropped, position } => {
                let items = if dropped.is_empty() {
                    "items".to_owned()
                } else {
                    dropped
                        .iter()
                        .map(|item| {
                            let name = item
                                .display_name
                                .as_deref()
                                .or(item.name.as_deref())
                                .unwrap_or("unknown item");
                            match item.count {
                                Some(count) if count > 1 => format!("{name} x{count}"),
                                _ => name.to_owned(),
                            }
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                match position {
                    Some(pos) => format!("{items} dropped at {pos}"),
                    None => format!("{items} dropped"),
                }
            }
            EventKind::ForcedMove { position } => match position {
                Some(pos) => format!("you were moved (e.g. teleported) to {pos}"),
                None => "you were moved".to_owned(),
            },
            EventKind::Unknown { name, .. } => format!("unrecognised event '{name}'"),
        };
        format!("[{}] {}", self.tag(), body)
    }
}

fn status_line(title: &str, parts: &[(&str, Option<f64>)]) -> String {
    let present: Vec<String> = parts
        .iter()
        .filter_map(|(label, value)| value.map(|v| format!("{label} {v}")))
        .collect();
    if present.is_empty() {
        title.to_owned()
    } else {
        format!("{title}: {}", present.join(", "))
    }
}

// ─── Forward-compatible deserializer ───────────────────────────────

/// Internal helper enum for the forward-compatible deserializer.
/// Mirrors EventKind exactly but derives Deserialize.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum EventKindKnown {
    Chat {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    PlayerJoined {
        #[serde(default)]
        player: Option<PlayerInfo>,
    },
    PlayerLeft {
        #[serde(default)]
        player: Option<PlayerInfo>,
    },
    Death,
    Spawn,
    SpawnReset,
    Rain,
    Kicked {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        logged_in: Option<bool>,
    },
    Health {
        #[serde(default)]
        health: Option<f64>,
        #[serde(default)]
        food: Option<f64>,
        #[serde(default)]
        food_saturation: Option<f64>,
    },
    Breath {
        #[serde(default)]
        oxygen_level: Option<f64>,
        #[serde(default)]
        health: Option<f64>,
        #[serde(default)]
        food: Option<f64>,
    },
    EntityHurt {
        #[serde(default)]
        entity: Option<EntityInfo>,
        #[serde(default)]
        source: Option<EntityInfo>,
    },
    EntityDead {
        #[serde(default)]
        entity: Option<EntityInfo>,
    },
    PlayerCollect {
        #[serde(default)]
        collector: Option<EntityInfo>,
        #[serde(default)]
        item_type: Option<String>,
        #[serde(default)]
        item_count: Option<u32>,
    },
    ItemDrop {
        #[serde(default)]
        dropped: Vec<DroppedItem>,
        #[serde(default)]
        position: Option<Position>,
    },
    ForcedMove {
        #[serde(default)]
        position: Option<Position>,
    },
    Unknown {
        name: String,
        data: serde_json::Value,
    },
}

/// Forward-compatible deserializer: unknown variants become `Unknown`.
impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match serde_json::from_value::<EventKindKnown>(raw.clone()) {
            Ok(known) => Ok(known.into()),
            Err(_) => {
                let name = raw
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let mut data = raw;
                if let Some(obj) = data.as_object_mut() {
                    obj.remove("type");
                }
                Ok(EventKind::Unknown { name, data })
            }
        }
    }
}

impl From<EventKindKnown> for EventKind {
    fn from(k: EventKindKnown) -> Self {
        match k {
            EventKindKnown::Chat { username, message } => Self::Chat { username, message },
            EventKindKnown::PlayerJoined { player } => Self::PlayerJoined { player },
            EventKindKnown::PlayerLeft { player } => Self::PlayerLeft { player },
            EventKindKnown::Death => Self::Death,
            EventKindKnown::Spawn => Self::Spawn,
            EventKindKnown::SpawnReset => Self::SpawnReset,
            EventKindKnown::Rain => Self::Rain,
            EventKindKnown::Kicked { reason, logged_in } => Self::Kicked { reason, logged_in },
            EventKindKnown::Health {
                health,
                food,
                food_saturation,
            } => Self::Health {
                health,
                food,
                food_saturation,
            },
            EventKindKnown::Breath {
                oxygen_level,
                health,
                food,
            } => Self::Breath {
                oxygen_level,
                health,
                food,
            },
            EventKindKnown::EntityHurt { entity, source } => Self::EntityHurt { entity, source },
            EventKindKnown::EntityDead { entity } => Self::EntityDead { entity },
            EventKindKnown::PlayerCollect {
                collector,
                item_type,
                item_count,
            } => Self::PlayerCollect {
                collector,
                item_type,
                item_count,
            },
            EventKindKnown::ItemDrop { dropped, position } => Self::ItemDrop { dropped, position },
            EventKindKnown::ForcedMove { position } => Self::ForcedMove { position },
            EventKindKnown::Unknown { name, data } => Self::Unknown { name, data },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_wire_names_parse_back() {
        for tag in EventTag::ALL {
            assert_eq!(EventTag::parse(tag.as_str()), Some(tag));
            let json = serde_json::to_string(&tag).unwrap();
            assert_eq!(json, format!("\"{}\"", tag.as_str()));
        }
        assert_eq!(EventTag::parse("unknown"), None);
        assert_eq!(EventTag::parse("Chat"), None);
    }

    #[test]
    fn world_event_category() {
        assert!(EventTag::EntityHurt.is_world_event());
        assert!(EventTag::Rain.is_world_event());
        assert!(!EventTag::Chat.is_world_event());
        assert!(!EventTag::Health.is_world_event());
        assert!(!EventTag::ForcedMove.is_world_event());
    }

    #[test]
    fn health_kind_serializes_camel_case() {
        let kind = EventKind::Health {
            health: Some(4.0),
            food: Some(18.0),
            food_saturation: None,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "health");
        assert_eq!(json["health"], 4.0);
        assert!(json.get("foodSaturation").is_none());
        let back: EventKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn unit_kind_roundtrip() {
        let json = serde_json::to_string(&EventKind::Rain).unwrap();
        assert_eq!(json, r#"{"type":"rain"}"#);
        let back: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventKind::Rain);
    }

    #[test]
    fn unknown_variant_becomes_unknown() {
        let json = r#"{"type":"futureEventXYZ","key":"value","num":42}"#;
        let kind: EventKind = serde_json::from_str(json).unwrap();
        if let EventKind::Unknown { name, data } = kind {
            assert_eq!(name, "futureEventXYZ");
            assert_eq!(data["key"], "value");
            assert_eq!(data["num"], 42);
            assert!(data.get("type").is_none());
        } else {
            panic!("should be Unknown");
        }
    }

    #[test]
    fn game_event_roundtrip_keeps_fields() {
        let event = GameEvent::new(EventKind::ForcedMove {
            position: Some(Position {
                x: 1.0,
                y: 64.0,
                z: -3.5,
            }),
        })
        .with_game_tick(1200);
        let json = serde_json::to_string(&event).unwrap();
        let back: GameEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.kind, event.kind);
        assert_eq!(back.timestamp.wall, event.timestamp.wall);
        assert_eq!(back.game_tick, Some(1200));
    }

    #[test]
    fn payload_strips_type() {
        let event = GameEvent::new(EventKind::Chat {
            username: Some("steve".into()),
            message: Some("hi".into()),
        });
        let payload = event.payload();
        assert_eq!(payload["username"], "steve");
        assert!(payload.get("type").is_none());
    }

    #[test]
    fn describe_mentions_tag_and_fields() {
        let event = GameEvent::new(EventKind::Health {
            health: Some(4.0),
            food: None,
            food_saturation: None,
        });
        assert_eq!(event.describe(), "[health] status update: health 4");

        let drop = GameEvent::new(EventKind::ItemDrop {
            dropped: vec![DroppedItem {
                display_name: Some("Cobblestone".into()),
                count: Some(3),
                ..Default::default()
            }],
            position: None,
        });
        assert_eq!(drop.describe(), "[itemDrop] Cobblestone x3 dropped");
    }

    #[test]
    fn timestamp_ago_is_older() {
        let ts = EventTimestamp::ago(Duration::from_millis(50));
        let age = ts.age_at(Instant::now());
        assert!(age >= Duration::from_millis(50));
        assert!(ts.wall <= Utc::now());
    }
}

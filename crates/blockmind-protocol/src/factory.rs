//! Raw poller payload → [`GameEvent`] normalization.
//!
//! The factory never fails. A payload whose name is missing or not in the
//! taxonomy, or that is not an object at all, becomes `EventKind::Unknown`
//! carrying the raw input. Known kinds are validated field by field, so a
//! missing or mistyped field is simply absent on the resulting event.

use crate::event::{
    DroppedItem, EntityInfo, EventKind, EventTag, GameEvent, PlayerInfo, Position,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

type Validator = fn(&Map<String, Value>) -> EventKind;

/// Static tag → validator table. Order is taxonomy order.
static REGISTRY: &[(EventTag, Validator)] = &[
    (EventTag::Chat, chat),
    (EventTag::PlayerJoined, player_joined),
    (EventTag::PlayerLeft, player_left),
    (EventTag::Death, death),
    (EventTag::Spawn, spawn),
    (EventTag::SpawnReset, spawn_reset),
    (EventTag::Rain, rain),
    (EventTag::Kicked, kicked),
    (EventTag::Health, health),
    (EventTag::Breath, breath),
    (EventTag::EntityHurt, entity_hurt),
    (EventTag::EntityDead, entity_dead),
    (EventTag::PlayerCollect, player_collect),
    (EventTag::ItemDrop, item_drop),
    (EventTag::ForcedMove, forced_move),
];

/// Builds typed events from untyped poller payloads.
pub struct EventFactory;

impl EventFactory {
    /// Normalize a raw payload of the shape
    /// `{"name"|"type": "...", "gameTick": n, "data": {...}}`.
    pub fn from_raw(raw: &Value) -> GameEvent {
        let kind = Self::kind_from_raw(raw);
        let mut event = GameEvent::new(kind);
        if let Some(tick) = raw
            .get("gameTick")
            .or_else(|| raw.get("game_tick"))
            .and_then(Value::as_u64)
        {
            event = event.with_game_tick(tick);
        }
        event
    }

    /// Tags the factory can build, in registry order.
    pub fn registered_tags() -> Vec<EventTag> {
        REGISTRY.iter().map(|(tag, _)| *tag).collect()
    }

    fn kind_from_raw(raw: &Value) -> EventKind {
        let Some(obj) = raw.as_object() else {
            return unknown("unknown", raw);
        };
        let Some(name) = obj
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| obj.get("type").and_then(Value::as_str))
            .filter(|name| !name.is_empty())
        else {
            return unknown("unknown", raw);
        };

        let normalized = normalize_name(name);
        let validator = EventTag::parse(&normalized).and_then(|tag| {
            REGISTRY
                .iter()
                .find(|(registered, _)| *registered == tag)
                .map(|(_, validator)| *validator)
        });
        match validator {
            Some(validator) => {
                let empty = Map::new();
                let data = obj.get("data").and_then(Value::as_object).unwrap_or(&empty);
                validator(data)
            }
            None => unknown(name, raw),
        }
    }
}

fn unknown(name: &str, raw: &Value) -> EventKind {
    EventKind::Unknown {
        name: name.to_owned(),
        data: raw.clone(),
    }
}

/// Legacy producers send snake_case names (`player_joined`); the taxonomy
/// uses camelCase (`playerJoined`).
fn normalize_name(name: &str) -> String {
    if !name.contains('_') {
        return name.to_owned();
    }
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

// ─── Field extraction ──────────────────────────────────────────────

fn field<T: DeserializeOwned>(data: &Map<String, Value>, key: &str) -> Option<T> {
    data.get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn field_any<T: DeserializeOwned>(data: &Map<String, Value>, keys: &[&str]) -> Option<T> {
    keys.iter().find_map(|key| field(data, key))
}

fn string(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
}

fn number(data: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| data.get(*key).and_then(Value::as_f64))
}

// ─── Validators ────────────────────────────────────────────────────

fn chat(data: &Map<String, Value>) -> EventKind {
    EventKind::Chat {
        username: string(data, &["username", "player_name"]),
        message: string(data, &["message", "chat_text"]),
    }
}

fn player(data: &Map<String, Value>) -> Option<PlayerInfo> {
    field::<PlayerInfo>(data, "player").or_else(|| {
        string(data, &["username"]).map(|username| PlayerInfo {
            username: Some(username),
            ..Default::default()
        })
    })
}

fn player_joined(data: &Map<String, Value>) -> EventKind {
    EventKind::PlayerJoined {
        player: player(data),
    }
}

fn player_left(data: &Map<String, Value>) -> EventKind {
    EventKind::PlayerLeft {
        player: player(data),
    }
}

fn death(_: &Map<String, Value>) -> EventKind {
    EventKind::Death
}

fn spawn(_: &Map<String, Value>) -> EventKind {
    EventKind::Spawn
}

fn spawn_reset(_: &Map<String, Value>) -> EventKind {
    EventKind::SpawnReset
}

fn rain(_: &Map<String, Value>) -> EventKind {
    EventKind::Rain
}

fn kicked(data: &Map<String, Value>) -> EventKind {
    EventKind::Kicked {
        reason: string(data, &["reason"]),
        logged_in: data.get("loggedIn").and_then(Value::as_bool),
    }
}

fn health(data: &Map<String, Value>) -> EventKind {
    EventKind::Health {
        health: number(data, &["health"]),
        food: number(data, &["food"]),
        food_saturation: number(data, &["foodSaturation", "food_saturation"]),
    }
}

fn breath(data: &Map<String, Value>) -> EventKind {
    EventKind::Breath {
        oxygen_level: number(data, &["oxygenLevel", "oxygen_level"]),
        health: number(data, &["health"]),
        food: number(data, &["food"]),
    }
}

fn entity_hurt(data: &Map<String, Value>) -> EventKind {
    EventKind::EntityHurt {
        entity: field::<EntityInfo>(data, "entity"),
        source: field::<EntityInfo>(data, "source"),
    }
}

fn entity_dead(data: &Map<String, Value>) -> EventKind {
    EventKind::EntityDead {
        entity: field::<EntityInfo>(data, "entity"),
    }
}

fn player_collect(data: &Map<String, Value>) -> EventKind {
    EventKind::PlayerCollect {
        collector: field::<EntityInfo>(data, "collector"),
        item_type: string(data, &["itemType", "item_type"]),
        item_count: field_any(data, &["itemCount", "item_count"]),
    }
}

fn item_drop(data: &Map<String, Value>) -> EventKind {
    let dropped = data
        .get("dropped")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<DroppedItem>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    EventKind::ItemDrop {
        dropped,
        position: field::<Position>(data, "position"),
    }
}

fn forced_move(data: &Map<String, Value>) -> EventKind {
    EventKind::ForcedMove {
        position: field::<Position>(data, "position"),
    }
}

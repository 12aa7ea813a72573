// Snapshot Module - Decoding device state pushes and encoding channel intents
//
// The device pushes two shapes over /index_data: a full snapshot right after
// connecting and small partial updates (state + level per channel) whenever a
// level settles. Newer firmware may tag them with "kind"; older firmware only
// differs by whether the channel entries carry "enabled".
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{BUTTON_COUNT, CHANNEL_COUNT};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot must be a JSON object")]
    NotAnObject,
    #[error("unknown snapshot kind {0}")]
    UnknownKind(String),
    #[error("expected {expected} {what} entries, got {got}")]
    WrongLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("full snapshot is missing configuration for channel slot {0}")]
    MissingChannelConfig(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Full,
    Partial,
}

/// Per-channel configuration, only present in full snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(deserialize_with = "truthy")]
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub channel: u16,
    #[serde(default)]
    pub min: u8,
    #[serde(default)]
    pub max: u8,
    #[serde(default)]
    pub dimming_speed: u32,
    #[serde(default)]
    pub auto_dimming_speed: u32,
    #[serde(default)]
    pub hold_period: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub on: bool,
    pub level: u8,
    pub config: Option<ChannelConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ButtonSnapshot {
    #[serde(default, deserialize_with = "truthy")]
    pub enabled: bool,
    #[serde(default)]
    pub channel: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub kind: SnapshotKind,
    pub channels: Option<Vec<ChannelSnapshot>>,
    pub buttons: Option<Vec<ButtonSnapshot>>,
    /// Every remaining top-level key, applied through the binding table
    pub fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    #[serde(default, deserialize_with = "state_on")]
    state: bool,
    #[serde(default)]
    level: u8,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl DeviceSnapshot {
    pub fn decode(text: &str) -> Result<Self, SnapshotError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, SnapshotError> {
        let Value::Object(mut map) = value else {
            return Err(SnapshotError::NotAnObject);
        };

        let tagged = match map.remove("kind") {
            None => None,
            Some(Value::String(kind)) => match kind.as_str() {
                "full" => Some(SnapshotKind::Full),
                "partial" => Some(SnapshotKind::Partial),
                _ => return Err(SnapshotError::UnknownKind(kind)),
            },
            Some(other) => return Err(SnapshotError::UnknownKind(other.to_string())),
        };

        let raw_channels: Option<Vec<RawChannel>> = map
            .remove("channels")
            .map(serde_json::from_value)
            .transpose()?;
        if let Some(channels) = &raw_channels {
            check_len("channel", CHANNEL_COUNT, channels.len())?;
        }

        let buttons: Option<Vec<ButtonSnapshot>> = map
            .remove("buttons")
            .map(serde_json::from_value)
            .transpose()?;
        if let Some(buttons) = &buttons {
            check_len("button", BUTTON_COUNT, buttons.len())?;
        }

        // Untagged pushes fall back to the legacy rule: "enabled" only ships with full snapshots
        let kind = tagged.unwrap_or_else(|| {
            let has_config = raw_channels
                .iter()
                .flatten()
                .any(|c| c.rest.contains_key("enabled"));
            if has_config {
                SnapshotKind::Full
            } else {
                SnapshotKind::Partial
            }
        });

        let channels = raw_channels
            .map(|raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(slot, c)| decode_channel(slot, c, kind, tagged.is_some()))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        Ok(DeviceSnapshot {
            kind,
            channels,
            buttons,
            fields: map,
        })
    }

    pub fn is_full(&self) -> bool {
        self.kind == SnapshotKind::Full
    }
}

fn decode_channel(
    slot: usize,
    raw: RawChannel,
    kind: SnapshotKind,
    tagged: bool,
) -> Result<ChannelSnapshot, SnapshotError> {
    let has_config = raw.rest.contains_key("enabled");
    let config = match kind {
        SnapshotKind::Partial => None,
        SnapshotKind::Full if has_config => {
            Some(serde_json::from_value(Value::Object(raw.rest))?)
        }
        SnapshotKind::Full if tagged => return Err(SnapshotError::MissingChannelConfig(slot)),
        SnapshotKind::Full => None,
    };
    Ok(ChannelSnapshot {
        on: raw.state,
        level: raw.level,
        config,
    })
}

fn check_len(what: &'static str, expected: usize, got: usize) -> Result<(), SnapshotError> {
    if got != expected {
        return Err(SnapshotError::WrongLength {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

/// Loose truthiness as the device emits it: 0/1 integers, booleans, or strings
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
        Value::Null => false,
    }
}

// A channel counts as on only when its state equals 1
fn is_on(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => s.trim().parse::<f64>().ok() == Some(1.0),
        _ => false,
    }
}

fn truthy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(is_truthy(&Value::deserialize(deserializer)?))
}

fn state_on<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(is_on(&Value::deserialize(deserializer)?))
}

/// Text form of a scalar as an input element would hold it
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The only message the client ever sends to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelControlIntent {
    pub channel: u16,
    pub value: u8,
}

impl ChannelControlIntent {
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

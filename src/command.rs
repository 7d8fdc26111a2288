/*!
 # Command payload parsing

 Turns raw payloads from the command topics into typed commands. Nothing here
 touches state; every malformed payload becomes [`Error::InvalidCommand`] or
 [`Error::InvalidOverride`].
*/

use serde_json::Value;

use crate::color::{color_from_json, json_integer, parse_color_string, percent_to_byte, Rgb};
use crate::control::{Override, OverrideKind};
use crate::{Error, Result};

/// Parses `ON`/`OFF` (case-insensitive, `true`/`false` and `1`/`0` accepted)
pub fn parse_power(payload: &str) -> Result<bool> {
    let text = payload.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        if let Some(Value::String(state)) = map.get("state") {
            return parse_power(state);
        }
    }
    match text.to_ascii_uppercase().as_str() {
        "ON" | "TRUE" | "1" => Ok(true),
        "OFF" | "FALSE" | "0" => Ok(false),
        _ => Err(Error::InvalidCommand(format!(
            "power payload must be ON or OFF, got '{text}'"
        ))),
    }
}

/// A command from the RGB topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorCommand {
    pub color: Option<Rgb>,
    /// Requested brightness before clamping
    pub brightness: Option<i64>,
    /// Power state carried alongside (JSON `state` key)
    pub state: Option<bool>,
}

impl ColorCommand {
    /// Only a power state, no color or brightness
    pub fn is_state_only(&self) -> bool {
        self.color.is_none() && self.brightness.is_none()
    }
}

pub fn parse_color_command(payload: &str) -> Result<ColorCommand> {
    let text = payload.trim();
    if text.is_empty() {
        return Err(Error::InvalidCommand("empty color payload".into()));
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => {
            let json = Value::Object(map);
            let state = match json.get("state") {
                Some(Value::String(state)) => Some(parse_power(state)?),
                Some(other) => {
                    return Err(Error::InvalidCommand(format!("invalid state value {other}")))
                }
                None => None,
            };
            let brightness = match (json.get("brightness"), json.get("brightness_pct")) {
                (Some(value), _) => Some(brightness_value(value)?),
                (None, Some(pct)) => {
                    let pct = pct.as_f64().ok_or_else(|| {
                        Error::InvalidCommand(format!("invalid brightness_pct {pct}"))
                    })?;
                    Some(i64::from(percent_to_byte(pct)))
                }
                (None, None) => None,
            };
            let command = ColorCommand {
                color: color_from_json(&json),
                brightness,
                state,
            };
            if command.is_state_only() && command.state.is_none() {
                return Err(Error::InvalidCommand(format!(
                    "no color, brightness or state in '{text}'"
                )));
            }
            Ok(command)
        }
        _ => Ok(ColorCommand {
            color: Some(parse_color_string(text)?),
            ..ColorCommand::default()
        }),
    }
}

/// Parses a brightness payload: a bare integer or `{"brightness": n}`, 0..=255
pub fn parse_brightness(payload: &str) -> Result<u8> {
    let text = payload.trim();
    if text.is_empty() {
        return Err(Error::InvalidCommand("empty brightness payload".into()));
    }
    let value = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map
            .get("brightness")
            .cloned()
            .ok_or_else(|| Error::InvalidCommand(format!("no brightness in '{text}'")))?,
        Ok(other) => other,
        Err(_) => Value::String(text.to_string()),
    };
    let brightness = brightness_value(&value)?;
    Ok(brightness as u8)
}

fn brightness_value(value: &Value) -> Result<i64> {
    let brightness = json_integer(value)
        .ok_or_else(|| Error::InvalidCommand(format!("brightness must be an integer, got {value}")))?;
    if !(0..=255).contains(&brightness) {
        return Err(Error::InvalidCommand(format!(
            "brightness {brightness} outside 0..=255"
        )));
    }
    Ok(brightness)
}

/// Target of a mode command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeCommand {
    Pilot,
    Logi,
}

impl ModeCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ModeCommand::Pilot => "pilot",
            ModeCommand::Logi => "logi",
        }
    }
}

/// `pilot`/`ON` take control, `logi`/`OFF`/`auto` hand it back
pub fn parse_mode(payload: &str) -> Result<ModeCommand> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "pilot" | "on" => Ok(ModeCommand::Pilot),
        "logi" | "off" | "auto" => Ok(ModeCommand::Logi),
        other => Err(Error::InvalidCommand(format!(
            "mode must be pilot or logi, got '{other}'"
        ))),
    }
}

/// A validated override request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverrideCommand {
    pub kind: OverrideKind,
    pub duration_seconds: i64,
}

/// Parses an override payload received on the topic bound to `topic_kind`.
///
/// An empty payload uses `default_duration`. A bare integer is a duration in
/// seconds, quoted or not. JSON objects may carry `duration` and `type`; a `type` that
/// disagrees with the topic wins.
pub fn parse_override(
    payload: &str,
    topic_kind: OverrideKind,
    default_duration: u32,
) -> Result<OverrideCommand> {
    let text = payload.trim();
    let mut kind = topic_kind;
    let duration = if text.is_empty() {
        i64::from(default_duration)
    } else {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => {
                if let Some(name) = map.get("type").or_else(|| map.get("kind")) {
                    let name = name.as_str().ok_or_else(|| {
                        Error::InvalidOverride(format!("override type must be a string, got {name}"))
                    })?;
                    kind = name.parse()?;
                }
                match map.get("duration") {
                    Some(value) => json_integer(value).ok_or_else(|| {
                        Error::InvalidOverride(format!("invalid duration {value}"))
                    })?,
                    None => i64::from(default_duration),
                }
            }
            Ok(Value::Number(number)) => number
                .as_i64()
                .ok_or_else(|| Error::InvalidOverride(format!("invalid duration '{text}'")))?,
            Ok(quoted @ Value::String(_)) => json_integer(&quoted)
                .ok_or_else(|| Error::InvalidOverride(format!("invalid duration {quoted}")))?,
            _ => text
                .parse()
                .map_err(|_| Error::InvalidOverride(format!("invalid override payload '{text}'")))?,
        }
    };
    Override::validate_duration(duration)?;
    Ok(OverrideCommand {
        kind,
        duration_seconds: duration,
    })
}

/*!
 # Color and brightness arithmetic

 Pure helpers shared by the state machine, the dispatcher and the device layer:
 channel clamping, brightness scaling and parsing of the textual color encodings
 accepted on the command topics.
*/

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// An RGB triple, one byte per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    /// Red component (0-255)
    pub r: u8,
    /// Green component (0-255)
    pub g: u8,
    /// Blue component (0-255)
    pub b: u8,
}

impl Rgb {
    /// All channels off
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Builds a color from arbitrary integers, clamping each channel
    pub fn clamped(r: i64, g: i64, b: i64) -> Self {
        Self::new(clamp_channel(r), clamp_channel(g), clamp_channel(b))
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// Parses a strict `#RRGGBB` value
    pub fn from_hex(value: &str) -> Result<Self> {
        let hex = value.trim().strip_prefix('#').ok_or_else(|| {
            Error::InvalidCommand(format!("expected #RRGGBB, got '{value}'"))
        })?;
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(Error::InvalidCommand(format!(
                "expected #RRGGBB, got '{value}'"
            )));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16)
                .map_err(|_| Error::InvalidCommand(format!("invalid hex color '{value}'")))
        };
        Ok(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl FromStr for Rgb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_color_string(s)
    }
}

/// Clamps any integer into a channel byte
pub fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

/// Scales every channel by `brightness / 255`, rounding down.
/// Full brightness returns the color untouched.
pub fn apply_brightness(color: Rgb, brightness: u8) -> Rgb {
    if brightness == u8::MAX {
        return color;
    }
    let scale = |channel: u8| (u16::from(channel) * u16::from(brightness) / 255) as u8;
    Rgb::new(scale(color.r), scale(color.g), scale(color.b))
}

/// Converts a 0-100 percentage to a brightness byte
pub fn percent_to_byte(percent: f64) -> u8 {
    let percent = percent.clamp(0.0, 100.0);
    (percent / 100.0 * 255.0).round() as u8
}

/// Converts a brightness byte to a 0-100 percentage
pub fn byte_to_percent(value: u8) -> u8 {
    (f64::from(value) / 255.0 * 100.0).round() as u8
}

/// Parses a color from any of the accepted textual encodings:
/// `#RRGGBB`, `R,G,B`, `R G B`, a JSON `[r, g, b]` list or a JSON object
/// (see [`color_from_json`]).
pub fn parse_color_string(value: &str) -> Result<Rgb> {
    let text = value.trim();
    if text.is_empty() {
        return Err(Error::InvalidCommand("empty color".into()));
    }

    if let Ok(json) = serde_json::from_str::<Value>(text) {
        if let Some(color) = color_from_json(&json) {
            return Ok(color);
        }
    }

    if text.starts_with('#') {
        return Rgb::from_hex(text);
    }

    let separator = if text.contains(',') { ',' } else { ' ' };
    let parts: Vec<&str> = text
        .split(separator)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.len() == 3 {
        let mut channels = [0i64; 3];
        for (slot, part) in channels.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| {
                Error::InvalidCommand(format!("invalid color channel '{part}' in '{text}'"))
            })?;
        }
        return Ok(Rgb::clamped(channels[0], channels[1], channels[2]));
    }

    Err(Error::InvalidCommand(format!(
        "cannot read color '{text}' (expected #RRGGBB or R,G,B)"
    )))
}

/// Extracts a color from a decoded JSON payload.
///
/// Recognises `[r, g, b]`, `{"r":..,"g":..,"b":..}`, `{"color": {"r":..}}` and
/// `{"rgb_color": [r, g, b]}`. Channels are clamped.
pub fn color_from_json(value: &Value) -> Option<Rgb> {
    match value {
        Value::Array(items) => color_from_list(items),
        Value::Object(map) => {
            if let Some(section) = map.get("color").and_then(Value::as_object) {
                if let Some(color) = color_from_channels(section) {
                    return Some(color);
                }
            }
            if let Some(color) = color_from_channels(map) {
                return Some(color);
            }
            map.get("rgb_color")
                .and_then(Value::as_array)
                .and_then(|items| color_from_list(items))
        }
        _ => None,
    }
}

fn color_from_list(items: &[Value]) -> Option<Rgb> {
    match items {
        [r, g, b] => Some(Rgb::clamped(
            json_integer(r)?,
            json_integer(g)?,
            json_integer(b)?,
        )),
        _ => None,
    }
}

fn color_from_channels(map: &serde_json::Map<String, Value>) -> Option<Rgb> {
    let r = json_integer(map.get("r")?)?;
    let g = json_integer(map.get("g")?)?;
    let b = json_integer(map.get("b")?)?;
    Some(Rgb::clamped(r, g, b))
}

/// Reads an integer out of a JSON number or numeric string
pub(crate) fn json_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/*!
 # Configuration profile

 The service reads a TOML file, substitutes `${VAR}` references from the
 environment in string values, and validates the result into an immutable
 [`Profile`]. Every section is optional except `mqtt.host`.

 ```toml
 [mqtt]
 host = "broker.local"
 password = "${MQTT_PASSWORD}"

 [topics]
 base = "office/keyboard"

 [palettes.warning]
 max_duration_ms = 300
 frames = [
     { color = "#FFFF00", duration_ms = 200 },
     { color = "#000000", duration_ms = 200 },
 ]
 ```
*/

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::color::Rgb;
use crate::control::{OverrideKind, MAX_OVERRIDE_SECONDS, MIN_OVERRIDE_SECONDS};
use crate::effects::{frame_ceiling_ms, Palette, PaletteFrame, Palettes};
use crate::{Error, Result};

pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "LIGHTSPEED_CONFIG";
pub const DEFAULT_TOPIC_BASE: &str = "lightspeed/alerts";
pub const DEFAULT_OVERRIDE_SECONDS: u32 = 10;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Keep-alive interval in seconds
    pub keepalive: u64,
}

/// Every topic the bridge reads or writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMap {
    pub base: String,
    /// Retained status snapshot
    pub state: String,
    /// Power ON/OFF
    pub command: String,
    pub rgb: String,
    pub brightness: String,
    /// pilot/logi ownership switch
    pub mode: String,
    pub alert: String,
    pub warn: String,
    pub info: String,
    /// online/offline, also the last will
    pub availability: String,
}

impl TopicMap {
    fn derive(base: &str, raw: RawTopics) -> Self {
        let pick = |value: Option<String>, suffix: &str| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| format!("{base}/{suffix}"))
        };
        Self {
            base: base.to_string(),
            state: pick(raw.state, "status"),
            command: pick(raw.command, "switch"),
            rgb: pick(raw.rgb, "rgb/set"),
            brightness: pick(raw.brightness, "brightness/set"),
            mode: pick(raw.mode, "mode/set"),
            alert: pick(raw.alert, "alert"),
            warn: pick(raw.warn, "warn"),
            info: pick(raw.info, "info"),
            availability: pick(raw.availability, "availability"),
        }
    }

    /// Topics the service subscribes to
    pub fn subscriptions(&self) -> [&str; 7] {
        [
            &self.command,
            &self.rgb,
            &self.brightness,
            &self.mode,
            &self.alert,
            &self.warn,
            &self.info,
        ]
    }

    /// Override kind bound to a topic, if it is one of the override topics
    pub fn override_kind(&self, topic: &str) -> Option<OverrideKind> {
        if topic == self.alert {
            Some(OverrideKind::Alert)
        } else if topic == self.warn {
            Some(OverrideKind::Warning)
        } else if topic == self.info {
            Some(OverrideKind::Info)
        } else {
            None
        }
    }

    fn all(&self) -> [&str; 10] {
        [
            &self.base,
            &self.state,
            &self.command,
            &self.rgb,
            &self.brightness,
            &self.mode,
            &self.alert,
            &self.warn,
            &self.info,
            &self.availability,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeAssistantSettings {
    pub device_id: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub area: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightingSettings {
    pub default_color: Rgb,
    pub lock_file: PathBuf,
    pub min_write_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectSettings {
    /// Used when an override command carries no duration
    pub override_duration_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilitySettings {
    pub health_topic: String,
    /// Lowercase tracing level name
    pub log_level: String,
}

/// Validated configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub source_path: PathBuf,
    pub mqtt: MqttSettings,
    pub topics: TopicMap,
    pub home_assistant: HomeAssistantSettings,
    pub lighting: LightingSettings,
    pub effects: EffectSettings,
    pub palettes: Palettes,
    pub observability: ObservabilitySettings,
}

impl Profile {
    /// Parses and validates TOML text. `env` resolves `${VAR}` references.
    pub fn from_toml_str(
        text: &str,
        source_path: impl Into<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let source_path = source_path.into();
        let mut value: toml::Value = toml::from_str(text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", source_path.display())))?;

        let mut missing = BTreeSet::new();
        substitute_env(&mut value, &env, &mut missing);
        if !missing.is_empty() {
            warn!(
                "Missing environment variables in {}: {}",
                source_path.display(),
                missing.into_iter().collect::<Vec<_>>().join(", ")
            );
        }

        let raw = value
            .try_into::<RawConfig>()
            .map_err(|e| Error::Config(format!("invalid {}: {e}", source_path.display())))?;
        raw.validate(source_path)
    }

    /// Stable fingerprint of the configuration schema
    pub fn schema_revision(&self) -> String {
        const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        format!("{:08x}", CRC.checksum(SCHEMA_BLUEPRINT.as_bytes()))
    }
}

const SCHEMA_BLUEPRINT: &str = concat!(
    "mqtt:host,port,username,password,client_id,keepalive;",
    "topics:base,state,command,rgb,brightness,mode,alert,warn,info,availability;",
    "home_assistant:device_id,device_name,manufacturer,model,area;",
    "lighting:default_color,lock_file,min_write_interval_ms;",
    "effects:override_duration_seconds;",
    "palettes:alert,warning,info(max_duration_ms,frames(color,duration_ms));",
    "observability:health_topic,log_level",
);

/// Loads a profile from disk using the process environment
pub fn load_config(path: impl AsRef<Path>) -> Result<Profile> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read configuration {}: {e}", path.display()))
    })?;
    debug!("Loaded configuration text from {}", path.display());
    Profile::from_toml_str(&text, path, |key| std::env::var(key).ok())
}

fn substitute_env(
    value: &mut toml::Value,
    env: &impl Fn(&str) -> Option<String>,
    missing: &mut BTreeSet<String>,
) {
    match value {
        toml::Value::String(text) => *text = expand(text, env, missing),
        toml::Value::Array(items) => {
            for item in items {
                substitute_env(item, env, missing);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute_env(item, env, missing);
            }
        }
        _ => {}
    }
}

/// Replaces `${NAME}` (NAME made of `A-Z`, `0-9`, `_`); unknown names become ""
fn expand(
    text: &str,
    env: &impl Fn(&str) -> Option<String>,
    missing: &mut BTreeSet<String>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'))
            .unwrap_or(after.len());
        if name_len > 0 && after[name_len..].starts_with('}') {
            let name = &after[..name_len];
            match env(name) {
                Some(found) => out.push_str(&found),
                None => {
                    missing.insert(name.to_string());
                }
            }
            rest = &after[name_len + 1..];
        } else {
            out.push_str("${");
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    mqtt: RawMqtt,
    topics: RawTopics,
    home_assistant: RawHomeAssistant,
    lighting: RawLighting,
    effects: RawEffects,
    palettes: RawPalettes,
    observability: RawObservability,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMqtt {
    host: Option<String>,
    port: Option<i64>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    keepalive: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTopics {
    base: Option<String>,
    state: Option<String>,
    command: Option<String>,
    rgb: Option<String>,
    brightness: Option<String>,
    mode: Option<String>,
    alert: Option<String>,
    warn: Option<String>,
    info: Option<String>,
    availability: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawHomeAssistant {
    device_id: Option<String>,
    device_name: Option<String>,
    manufacturer: Option<String>,
    model: Option<String>,
    area: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLighting {
    default_color: Option<String>,
    lock_file: Option<String>,
    min_write_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEffects {
    override_duration_seconds: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPalettes {
    alert: Option<RawPalette>,
    warning: Option<RawPalette>,
    info: Option<RawPalette>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPalette {
    max_duration_ms: Option<i64>,
    frames: Vec<RawFrame>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    color: String,
    duration_ms: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawObservability {
    health_topic: Option<String>,
    log_level: Option<String>,
}

/// Trimmed value, or `default` when absent or blank
fn text_or(value: Option<String>, default: &str) -> String {
    optional_text(value).unwrap_or_else(|| default.to_string())
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RawConfig {
    fn validate(self, source_path: PathBuf) -> Result<Profile> {
        let host = optional_text(self.mqtt.host)
            .ok_or_else(|| Error::Config("missing required key mqtt.host".into()))?;
        let port = self.mqtt.port.unwrap_or(1883);
        if !(1..=65535).contains(&port) {
            return Err(Error::Config(format!("mqtt.port {port} must be within 1..=65535")));
        }
        let keepalive = self.mqtt.keepalive.unwrap_or(60);
        if keepalive <= 0 {
            return Err(Error::Config("mqtt.keepalive must be positive".into()));
        }
        let mqtt = MqttSettings {
            host,
            port: port as u16,
            username: optional_text(self.mqtt.username),
            password: optional_text(self.mqtt.password),
            client_id: text_or(self.mqtt.client_id, "lightspeed-led"),
            keepalive: keepalive as u64,
        };

        let base = text_or(self.topics.base.clone(), DEFAULT_TOPIC_BASE);
        let topics = TopicMap::derive(&base, self.topics);
        for topic in topics.all() {
            validate_topic(topic)?;
        }

        let home_assistant = HomeAssistantSettings {
            device_id: text_or(self.home_assistant.device_id, "lightspeed-alerts"),
            device_name: text_or(self.home_assistant.device_name, "Lightspeed Alerts"),
            manufacturer: text_or(self.home_assistant.manufacturer, "Logitech"),
            model: text_or(self.home_assistant.model, "LED Middleware"),
            area: optional_text(self.home_assistant.area),
        };

        let default_color = Rgb::from_hex(&text_or(self.lighting.default_color, "#00FF80"))
            .map_err(|e| Error::Config(format!("lighting.default_color: {e}")))?;
        let lighting = LightingSettings {
            default_color,
            lock_file: PathBuf::from(text_or(self.lighting.lock_file, "lightspeed.lock")),
            min_write_interval_ms: self.lighting.min_write_interval_ms.unwrap_or(0),
        };

        let duration = self
            .effects
            .override_duration_seconds
            .unwrap_or(i64::from(DEFAULT_OVERRIDE_SECONDS));
        if !(MIN_OVERRIDE_SECONDS..=MAX_OVERRIDE_SECONDS).contains(&duration) {
            return Err(Error::Config(format!(
                "effects.override_duration_seconds {duration} must be within {MIN_OVERRIDE_SECONDS}..={MAX_OVERRIDE_SECONDS}"
            )));
        }
        let effects = EffectSettings {
            override_duration_seconds: duration as u32,
        };

        let palettes = Palettes {
            alert: build_palette(OverrideKind::Alert, self.palettes.alert)?,
            warning: build_palette(OverrideKind::Warning, self.palettes.warning)?,
            info: build_palette(OverrideKind::Info, self.palettes.info)?,
        };

        let health_topic = text_or(self.observability.health_topic, &format!("{base}/health"));
        validate_topic(&health_topic)?;
        let log_level = normalize_log_level(&text_or(self.observability.log_level, "info"))?;

        Ok(Profile {
            source_path,
            mqtt,
            topics,
            home_assistant,
            lighting,
            effects,
            palettes,
            observability: ObservabilitySettings {
                health_topic,
                log_level,
            },
        })
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains(char::is_whitespace) {
        return Err(Error::Config(format!(
            "topic '{topic}' must be non-empty and contain no spaces"
        )));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::Config(format!("topic '{topic}' must not contain wildcards")));
    }
    Ok(())
}

fn normalize_log_level(level: &str) -> Result<String> {
    let lowered = level.trim().to_ascii_lowercase();
    let lowered = match lowered.as_str() {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        _ => lowered,
    };
    if LOG_LEVELS.contains(&lowered.as_str()) {
        Ok(lowered)
    } else {
        Err(Error::Config(format!(
            "invalid log level '{level}', expected one of {}",
            LOG_LEVELS.join(", ")
        )))
    }
}

fn build_palette(kind: OverrideKind, raw: Option<RawPalette>) -> Result<Palette> {
    let Some(raw) = raw else {
        return Ok(Palette::builtin(kind));
    };
    let ceiling = frame_ceiling_ms(kind);
    let max_duration = raw.max_duration_ms.unwrap_or(i64::from(ceiling));
    if !(1..=i64::from(ceiling)).contains(&max_duration) {
        return Err(Error::Config(format!(
            "{kind} max_duration_ms ({max_duration}) exceeds the {ceiling}ms limit"
        )));
    }
    if raw.frames.is_empty() {
        let builtin = Palette::builtin(kind);
        return Palette::new(kind, max_duration as u32, builtin.palette_frames().to_vec());
    }

    let mut frames = Vec::with_capacity(raw.frames.len());
    for frame in raw.frames {
        if !(1..=max_duration).contains(&frame.duration_ms) {
            return Err(Error::Config(format!(
                "{kind} frame lasts {}ms, expected 1..={max_duration}ms",
                frame.duration_ms
            )));
        }
        let color = Rgb::from_hex(&frame.color)
            .map_err(|e| Error::Config(format!("{kind} frame color: {e}")))?;
        frames.push(PaletteFrame {
            color,
            duration_ms: frame.duration_ms as u32,
        });
    }
    Palette::new(kind, max_duration as u32, frames)
}

/*!
 # Control-mode state machine

 [`ControlState`] is an immutable value describing who owns the light (this
 program or the vendor application), whether the managed light is on, the last
 commanded color and brightness, and the override currently playing if any.
 Every transition returns a new instance stamped with the transition time.
*/

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::color::Rgb;
use crate::scheduler::TimerHandle;
use crate::{Error, Result};

/// Shortest override accepted, in seconds
pub const MIN_OVERRIDE_SECONDS: i64 = 1;
/// Longest override accepted, in seconds
pub const MAX_OVERRIDE_SECONDS: i64 = 300;

/// Brightness used by [`ControlState::bootstrap`]
pub const DEFAULT_BRIGHTNESS: u8 = 255;

/// The visual overrides that can temporarily take over the light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    Alert,
    Warning,
    Info,
}

impl OverrideKind {
    pub const ALL: [OverrideKind; 3] = [OverrideKind::Alert, OverrideKind::Warning, OverrideKind::Info];

    pub fn as_str(self) -> &'static str {
        match self {
            OverrideKind::Alert => "alert",
            OverrideKind::Warning => "warning",
            OverrideKind::Info => "info",
        }
    }

    /// The derived mode while this override is active
    pub fn mode(self) -> Mode {
        match self {
            OverrideKind::Alert => Mode::OverrideAlert,
            OverrideKind::Warning => Mode::OverrideWarning,
            OverrideKind::Info => Mode::OverrideInfo,
        }
    }
}

impl fmt::Display for OverrideKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverrideKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alert" => Ok(OverrideKind::Alert),
            "warning" | "warn" => Ok(OverrideKind::Warning),
            "info" => Ok(OverrideKind::Info),
            other => Err(Error::InvalidOverride(format!(
                "unknown override kind '{other}' (expected alert, warning or info)"
            ))),
        }
    }
}

/// Derived control mode. Never stored, always computed from a [`ControlState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// This program drives the light
    Pilot,
    /// Control is ceded to the vendor application
    Logi,
    OverrideAlert,
    OverrideWarning,
    OverrideInfo,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Pilot => "pilot",
            Mode::Logi => "logi",
            Mode::OverrideAlert => "override_alert",
            Mode::OverrideWarning => "override_warning",
            Mode::OverrideInfo => "override_info",
        }
    }

    pub fn is_override(self) -> bool {
        matches!(
            self,
            Mode::OverrideAlert | Mode::OverrideWarning | Mode::OverrideInfo
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `ON`/`OFF` as published on the status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnOff {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl OnOff {
    pub fn as_str(self) -> &'static str {
        match self {
            OnOff::On => "ON",
            OnOff::Off => "OFF",
        }
    }
}

impl From<bool> for OnOff {
    fn from(on: bool) -> Self {
        if on {
            OnOff::On
        } else {
            OnOff::Off
        }
    }
}

/// A timed visual override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    kind: OverrideKind,
    duration_seconds: u32,
    started_at: DateTime<Utc>,
    timer: TimerHandle,
}

impl Override {
    pub fn new(
        kind: OverrideKind,
        duration_seconds: i64,
        started_at: DateTime<Utc>,
        timer: TimerHandle,
    ) -> Result<Self> {
        let duration_seconds = Self::validate_duration(duration_seconds)?;
        Ok(Self {
            kind,
            duration_seconds,
            started_at,
            timer,
        })
    }

    /// Checks a requested duration against the accepted override window
    pub fn validate_duration(duration_seconds: i64) -> Result<u32> {
        if !(MIN_OVERRIDE_SECONDS..=MAX_OVERRIDE_SECONDS).contains(&duration_seconds) {
            return Err(Error::InvalidOverride(format!(
                "duration {duration_seconds}s outside {MIN_OVERRIDE_SECONDS}..={MAX_OVERRIDE_SECONDS}s"
            )));
        }
        Ok(duration_seconds as u32)
    }

    pub fn kind(&self) -> OverrideKind {
        self.kind
    }

    pub fn duration_seconds(&self) -> u32 {
        self.duration_seconds
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.started_at + Duration::seconds(i64::from(self.duration_seconds))
    }

    pub fn timer(&self) -> &TimerHandle {
        &self.timer
    }

    pub fn to_payload(&self) -> OverridePayload {
        OverridePayload {
            kind: self.kind,
            duration_seconds: self.duration_seconds,
            started_at: self.started_at,
            expires_at: self.expires_at(),
        }
    }
}

/// Serializable view of an [`Override`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverridePayload {
    pub kind: OverrideKind,
    pub duration_seconds: u32,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Deterministic serializable view of a [`ControlState`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub state: OnOff,
    pub color: Rgb,
    pub brightness: u8,
    pub mode: Mode,
    pub pilot_switch: OnOff,
    pub light_state: OnOff,
    pub last_color: [u8; 3],
    pub last_brightness: u8,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "override", skip_serializing_if = "Option::is_none")]
    pub active_override: Option<OverridePayload>,
}

/// Values recovered from a previously retained status publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetainedState {
    pub pilot_switch: Option<bool>,
    pub light_on: Option<bool>,
    pub last_color: Option<Rgb>,
    pub last_brightness: Option<u8>,
}

/// Immutable control state; see the module docs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    pilot_switch: bool,
    light_on: bool,
    last_color: Rgb,
    last_brightness: u8,
    active_override: Option<Override>,
    updated_at: DateTime<Utc>,
}

impl ControlState {
    /// Initial state: pilot owns the light, light on, full brightness
    pub fn bootstrap(default_color: Rgb) -> Self {
        Self {
            pilot_switch: true,
            light_on: true,
            last_color: default_color,
            last_brightness: DEFAULT_BRIGHTNESS,
            active_override: None,
            updated_at: Utc::now(),
        }
    }

    /// Bootstrap, then overlay whatever a retained status carried
    pub fn from_retained(default_color: Rgb, retained: &RetainedState) -> Self {
        let base = Self::bootstrap(default_color);
        Self {
            pilot_switch: retained.pilot_switch.unwrap_or(base.pilot_switch),
            light_on: retained.light_on.unwrap_or(base.light_on),
            last_color: retained.last_color.unwrap_or(base.last_color),
            last_brightness: retained.last_brightness.unwrap_or(base.last_brightness),
            ..base
        }
    }

    pub fn pilot_switch(&self) -> bool {
        self.pilot_switch
    }

    pub fn light_on(&self) -> bool {
        self.light_on
    }

    pub fn last_color(&self) -> Rgb {
        self.last_color
    }

    pub fn last_brightness(&self) -> u8 {
        self.last_brightness
    }

    pub fn active_override(&self) -> Option<&Override> {
        self.active_override.as_ref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Override presence always wins; otherwise ownership decides
    pub fn mode(&self) -> Mode {
        match &self.active_override {
            Some(active) => active.kind.mode(),
            None if self.pilot_switch => Mode::Pilot,
            None => Mode::Logi,
        }
    }

    /// Records a color command. `None` brightness keeps the previous value.
    /// The active override is left alone; callers decide whether the device sees it.
    pub fn record_color_command(&self, base_color: Rgb, brightness: Option<i64>) -> Self {
        let brightness = brightness
            .map(clamp_brightness)
            .unwrap_or(self.last_brightness);
        self.evolve(|next| {
            next.last_color = base_color;
            next.last_brightness = brightness;
            next.light_on = true;
        })
    }

    pub fn set_pilot_switch(&self, enabled: bool) -> Self {
        self.evolve(|next| next.pilot_switch = enabled)
    }

    pub fn set_light_state(&self, on: bool) -> Self {
        self.evolve(|next| next.light_on = on)
    }

    /// Installs an override, replacing any previous one in the value.
    /// Cancelling the previous timer is the scheduler's job.
    pub fn start_override(
        &self,
        kind: OverrideKind,
        duration_seconds: i64,
        timer: TimerHandle,
    ) -> Result<Self> {
        let started_at = Utc::now();
        let active = Override::new(kind, duration_seconds, started_at, timer)?;
        let mut next = self.evolve(|next| next.active_override = Some(active));
        next.updated_at = started_at;
        Ok(next)
    }

    pub fn clear_override(&self) -> Self {
        self.evolve(|next| next.active_override = None)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.light_on.into(),
            color: self.last_color,
            brightness: self.last_brightness,
            mode: self.mode(),
            pilot_switch: self.pilot_switch.into(),
            light_state: self.light_on.into(),
            last_color: self.last_color.to_array(),
            last_brightness: self.last_brightness,
            updated_at: self.updated_at,
            active_override: self.active_override.as_ref().map(Override::to_payload),
        }
    }

    fn evolve(&self, change: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        change(&mut next);
        next.updated_at = Utc::now();
        next
    }
}

fn clamp_brightness(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

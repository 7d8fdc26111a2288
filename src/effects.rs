/*!
 # Override palettes

 Each override kind plays a palette: a looping sequence of colors, each held for
 a fixed time. This module defines the frame types, the per-kind duration
 ceilings and the built-in palettes used when the profile does not supply one.
*/

use std::time::Duration;

use crate::color::Rgb;
use crate::control::OverrideKind;
use crate::{Error, Result};

/// Shortest time the pattern driver sleeps between two writes
pub const MIN_FRAME_SLEEP: Duration = Duration::from_millis(50);

/// Upper bound for one full palette cycle
pub const MAX_CYCLE_MS: u32 = 10_000;

/// One step of a running pattern, as handed to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternFrame {
    /// Color written at the start of the frame
    pub color: Rgb,
    /// How long the color is held
    pub duration: Duration,
}

impl PatternFrame {
    pub fn new(color: Rgb, duration: Duration) -> Self {
        Self { color, duration }
    }

    /// Hold time with the driver's minimum floor applied
    pub fn hold(&self) -> Duration {
        self.duration.max(MIN_FRAME_SLEEP)
    }
}

/// One configured palette entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteFrame {
    pub color: Rgb,
    pub duration_ms: u32,
}

/// Per-frame ceiling for each kind, in milliseconds
pub const fn frame_ceiling_ms(kind: OverrideKind) -> u32 {
    match kind {
        OverrideKind::Alert => 500,
        OverrideKind::Warning => 350,
        OverrideKind::Info => 500,
    }
}

/// A validated palette for one override kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    kind: OverrideKind,
    max_duration_ms: u32,
    frames: Vec<PaletteFrame>,
}

impl Palette {
    /// Validates frames against the kind's ceiling and the cycle limit
    pub fn new(kind: OverrideKind, max_duration_ms: u32, frames: Vec<PaletteFrame>) -> Result<Self> {
        let ceiling = frame_ceiling_ms(kind);
        if max_duration_ms == 0 || max_duration_ms > ceiling {
            return Err(Error::Config(format!(
                "{kind} palette max_duration_ms {max_duration_ms} must be within 1..={ceiling}"
            )));
        }
        if frames.is_empty() {
            return Err(Error::Config(format!("{kind} palette needs at least one frame")));
        }
        for frame in &frames {
            if frame.duration_ms == 0 || frame.duration_ms > max_duration_ms {
                return Err(Error::Config(format!(
                    "{kind} frame {} lasts {}ms, expected 1..={max_duration_ms}ms",
                    frame.color, frame.duration_ms
                )));
            }
        }
        let cycle: u32 = frames.iter().map(|frame| frame.duration_ms).sum();
        if cycle > MAX_CYCLE_MS {
            return Err(Error::Config(format!(
                "{kind} palette cycle lasts {cycle}ms, limit is {MAX_CYCLE_MS}ms"
            )));
        }
        Ok(Self {
            kind,
            max_duration_ms,
            frames,
        })
    }

    /// The built-in palette for a kind
    pub fn builtin(kind: OverrideKind) -> Self {
        let frames = match kind {
            OverrideKind::Alert => vec![
                PaletteFrame { color: Rgb::new(255, 0, 0), duration_ms: 150 },
                PaletteFrame { color: Rgb::new(255, 255, 255), duration_ms: 150 },
                PaletteFrame { color: Rgb::BLACK, duration_ms: 150 },
            ],
            OverrideKind::Warning => vec![
                PaletteFrame { color: Rgb::new(255, 140, 0), duration_ms: 200 },
                PaletteFrame { color: Rgb::BLACK, duration_ms: 200 },
            ],
            OverrideKind::Info => vec![
                PaletteFrame { color: Rgb::new(0, 128, 255), duration_ms: 400 },
                PaletteFrame { color: Rgb::new(0, 32, 64), duration_ms: 400 },
            ],
        };
        Self {
            kind,
            max_duration_ms: frame_ceiling_ms(kind),
            frames,
        }
    }

    pub fn kind(&self) -> OverrideKind {
        self.kind
    }

    pub fn max_duration_ms(&self) -> u32 {
        self.max_duration_ms
    }

    pub fn palette_frames(&self) -> &[PaletteFrame] {
        &self.frames
    }

    /// Frames ready for [`crate::device::LightDevice::start_pattern`]
    pub fn frames(&self) -> Vec<PatternFrame> {
        self.frames
            .iter()
            .map(|frame| {
                PatternFrame::new(frame.color, Duration::from_millis(u64::from(frame.duration_ms)))
            })
            .collect()
    }
}

/// The three override palettes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palettes {
    pub alert: Palette,
    pub warning: Palette,
    pub info: Palette,
}

impl Palettes {
    pub fn get(&self, kind: OverrideKind) -> &Palette {
        match kind {
            OverrideKind::Alert => &self.alert,
            OverrideKind::Warning => &self.warning,
            OverrideKind::Info => &self.info,
        }
    }
}

impl Default for Palettes {
    fn default() -> Self {
        Self {
            alert: Palette::builtin(OverrideKind::Alert),
            warning: Palette::builtin(OverrideKind::Warning),
            info: Palette::builtin(OverrideKind::Info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_palettes_are_valid() {
        for kind in OverrideKind::ALL {
            let builtin = Palette::builtin(kind);
            let rebuilt = Palette::new(kind, builtin.max_duration_ms(), builtin.palette_frames().to_vec());
            assert_eq!(rebuilt.unwrap(), builtin);
        }
    }

    #[test]
    fn frame_over_ceiling_is_rejected() {
        let frames = vec![PaletteFrame { color: Rgb::BLACK, duration_ms: 300 }];
        assert!(Palette::new(OverrideKind::Warning, 400, frames.clone()).is_err());
        assert!(Palette::new(OverrideKind::Warning, 250, frames.clone()).is_err());
        assert!(Palette::new(OverrideKind::Warning, 350, frames).is_ok());
    }

    #[test]
    fn empty_and_zero_frames_are_rejected() {
        assert!(Palette::new(OverrideKind::Alert, 500, Vec::new()).is_err());
        let zero = vec![PaletteFrame { color: Rgb::BLACK, duration_ms: 0 }];
        assert!(Palette::new(OverrideKind::Alert, 500, zero).is_err());
    }

    #[test]
    fn long_cycle_is_rejected() {
        let frames = vec![PaletteFrame { color: Rgb::BLACK, duration_ms: 500 }; 21];
        assert!(matches!(
            Palette::new(OverrideKind::Alert, 500, frames),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn pattern_frames_apply_floor() {
        let frame = PatternFrame::new(Rgb::BLACK, Duration::from_millis(10));
        assert_eq!(frame.hold(), MIN_FRAME_SLEEP);

        let frames = Palette::builtin(OverrideKind::Alert).frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].duration, Duration::from_millis(150));
    }
}

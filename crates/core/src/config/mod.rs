use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{AudioError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub reactions: ReactionConfig,
}

impl AppConfig {
    /// Parses a JSON document. Missing sections and fields keep their
    /// defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            AudioError::Config(format!("cannot read `{}`: {err}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.buffer_size < 2 {
            return Err(AudioError::Config(
                "engine.buffer_size must hold at least two samples".to_string(),
            ));
        }
        if self.reactions.frequency_ceiling.is_nan() || self.reactions.frequency_ceiling <= 0.0 {
            return Err(AudioError::Config(
                "reactions.frequency_ceiling must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration specific to the playback engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Samples per processed frame; also the FFT length.
    pub buffer_size: usize,
    /// Gain (dB) below which a sound is treated as silent. Volume steps are
    /// laid out between this floor and the device maximum.
    pub silence_floor_db: f32,
    /// Upper bound on how long the idle loop sleeps before re-checking the
    /// transport flags.
    pub idle_poll_ms: u64,
    pub window: WindowFunction,
    /// Queue length of each frame-event subscriber.
    pub frame_event_capacity: usize,
}

impl EngineConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            silence_floor_db: -15.0,
            idle_poll_ms: 20,
            window: WindowFunction::Rectangular,
            frame_event_capacity: 64,
        }
    }
}

/// Window applied to each frame before the FFT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    #[default]
    Rectangular,
    Hann,
}

/// Policy knobs for the consuming reaction layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactionConfig {
    /// Band energy is clamped to this ceiling before being normalised to
    /// `[0, 1]`. Tuned by ear against typical music spectra.
    pub frequency_ceiling: f64,
}

impl Default for ReactionConfig {
    fn default() -> Self {
        Self {
            frequency_ceiling: 70.0,
        }
    }
}

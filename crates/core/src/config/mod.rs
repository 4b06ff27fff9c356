use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub audio: AudioConfig,
}

impl AppConfig {
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persists the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// Configuration specific to the audio pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Preferred capture sample rate; the device may negotiate another.
    pub sample_rate: u32,
    /// Analysis window length in samples. Must be a power of two.
    pub fft_size: usize,
    /// Temporal smoothing factor applied to spectrum magnitudes, [0, 1).
    pub smoothing: f32,
    /// User gain multiplier, 1-10 with 5 as neutral.
    pub sensitivity: u8,
    /// Minimum interval between reported beat onsets.
    pub min_beat_interval_ms: u64,
    #[serde(default)]
    pub bands: BandPlan,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            fft_size: 1024,
            smoothing: 0.8,
            sensitivity: 5,
            min_beat_interval_ms: 300,
            bands: BandPlan::default(),
        }
    }
}

impl AudioConfig {
    /// Returns a copy with every field forced into its valid range.
    pub fn sanitized(&self) -> Self {
        let mut config = self.clone();
        config.fft_size = config.fft_size.max(32).next_power_of_two();
        config.smoothing = config.smoothing.clamp(0.0, 0.99);
        config.sensitivity = clamp_sensitivity(config.sensitivity);
        config.min_beat_interval_ms = config.min_beat_interval_ms.max(1);
        config
    }
}

/// Forces a sensitivity value into the supported 1-10 range.
pub fn clamp_sensitivity(value: u8) -> u8 {
    value.clamp(1, 10)
}

/// A single named frequency range, inclusive of `low_hz`, exclusive of
/// `high_hz`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandRange {
    pub low_hz: f32,
    pub high_hz: f32,
}

impl BandRange {
    pub const fn new(low_hz: f32, high_hz: f32) -> Self {
        Self { low_hz, high_hz }
    }

    pub fn contains(&self, hz: f32) -> bool {
        hz >= self.low_hz && hz < self.high_hz
    }
}

/// The five ranges the pipeline reports energy for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandPlan {
    pub bass: BandRange,
    pub low_mid: BandRange,
    pub mid: BandRange,
    pub treble: BandRange,
    pub high: BandRange,
}

impl Default for BandPlan {
    fn default() -> Self {
        Self {
            bass: BandRange::new(20.0, 250.0),
            low_mid: BandRange::new(250.0, 500.0),
            mid: BandRange::new(500.0, 2000.0),
            treble: BandRange::new(2000.0, 8000.0),
            high: BandRange::new(8000.0, 16_000.0),
        }
    }
}

//! Core library for the Session Visuals application.
//!
//! The crate implements the audio side of the visualiser: microphone
//! acquisition with constraint fallback, a per-frame feature pipeline
//! (volume, band energies, dominant pitch, beat onsets), observer fan-out
//! and bounded automatic recovery from capture loss. Rendering lives with
//! the consumers; they receive one [`AudioSnapshot`] per frame and nothing
//! else.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod processor;

pub use analysis::{
    pitch_for_frequency, AudioSnapshot, BandEnergies, FeatureExtractor, Pitch, SpectrumAnalyser,
};
pub use capture::{list_input_devices, CaptureSession, StreamEvent};
pub use config::{clamp_sensitivity, AppConfig, AudioConfig, BandPlan, BandRange};
pub use diagnostics::{DiagnosticsSink, TracingSink};
pub use error::{AcquisitionError, Result, SessionVizError};
pub use processor::{AudioFeatureProcessor, LinkState, ObserverId};

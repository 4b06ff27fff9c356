use std::{
    f32::consts::PI,
    sync::Arc,
    time::{Duration, Instant},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{config::BandPlan, Result};

/// Decibel range mapped onto the 0-255 byte spectrum. Magnitudes at or
/// below the floor become 0, magnitudes at or above the ceiling become 255.
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Dominant-frequency search window. Restricting the scan keeps sub-bass
/// rumble and ultrasonic noise from being reported as the lead pitch.
const DOMINANT_MIN_HZ: f32 = 80.0;
const DOMINANT_MAX_HZ: f32 = 4000.0;

/// Bass fraction a frame must exceed (scaled by sensitivity) to count as a
/// beat onset.
const BEAT_BASS_THRESHOLD: f32 = 0.3;

/// Sensitivity value at which the gain multiplier is exactly 1.0.
const NEUTRAL_SENSITIVITY: f32 = 5.0;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Feature set published to observers once per analysis frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioSnapshot {
    /// Loudness over the full analysed spectrum, 0-100.
    pub volume: f32,
    /// Average energy per configured frequency range, each 0-100.
    pub bands: BandEnergies,
    /// Frequency of the strongest bin within the musically relevant window,
    /// in Hz. Zero while that window is silent.
    pub dominant_frequency: f32,
    /// Nearest equal-tempered pitch for `dominant_frequency`.
    pub dominant_note: Option<Pitch>,
    /// True only on the single frame a beat onset is recognised.
    pub beat_detected: bool,
    /// Full byte-scaled spectrum, length = FFT size / 2.
    pub raw_frequency_data: Vec<u8>,
    /// The analysed time-domain block, for waveform display.
    pub raw_time_domain_data: Vec<f32>,
    /// The clamped user gain the frame was produced with.
    pub sensitivity: u8,
}

/// Per-range energies, 0-100 each.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BandEnergies {
    pub bass: f32,
    pub low_mid: f32,
    pub mid: f32,
    pub treble: f32,
    pub high: f32,
}

/// An equal-tempered pitch name with its octave, reference A4 = 440 Hz.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pitch {
    pub note: String,
    pub octave: i32,
}

/// Maps a frequency to the nearest equal-tempered pitch.
///
/// Returns `None` for non-positive frequencies (the silence case) and for
/// frequencies below the C0 reference.
pub fn pitch_for_frequency(hz: f32) -> Option<Pitch> {
    if hz <= 0.0 {
        return None;
    }

    let c0 = 440.0 * 2.0_f32.powf(-4.75);
    let semitones = (12.0 * (hz / c0).log2()).round() as i32;
    if semitones < 0 {
        return None;
    }

    Some(Pitch {
        note: NOTE_NAMES[(semitones % 12) as usize].to_string(),
        octave: semitones / 12,
    })
}

/// Fixed-size forward FFT over the most recent capture block, reproducing
/// the analyser-node contract the visualisations were written against:
/// Hann window, temporal smoothing across frames, and a byte spectrum on
/// the [-100 dB, -30 dB] range.
pub struct SpectrumAnalyser {
    sample_rate: u32,
    fft_size: usize,
    smoothing: f32,
    fft: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    window: Vec<f32>,
    window_sum: f32,
    smoothed: Vec<f32>,
    waveform: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(sample_rate: u32, fft_size: usize, smoothing: f32) -> Self {
        let mut planner = RealFftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();
        let window: Vec<f32> = (0..fft_size).map(|i| hann_value(i, fft_size)).collect();
        let window_sum: f32 = window.iter().sum();

        Self {
            sample_rate,
            fft_size,
            smoothing: smoothing.clamp(0.0, 0.99),
            fft,
            input,
            spectrum,
            scratch,
            window,
            window_sum,
            smoothed: vec![0.0; fft_size / 2],
            waveform: vec![0.0; fft_size],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of frequency bins exposed to consumers.
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Width of one bin in Hz.
    pub fn bin_width(&self) -> f32 {
        self.sample_rate as f32 / self.fft_size as f32
    }

    /// Feeds the latest capture block and updates the smoothed spectrum.
    ///
    /// Blocks shorter than the FFT size are left-padded with zeros; longer
    /// blocks contribute their most recent samples.
    pub fn push_block(&mut self, samples: &[f32]) -> Result<()> {
        self.waveform.fill(0.0);
        let take = samples.len().min(self.fft_size);
        let dst = self.fft_size - take;
        let src = samples.len() - take;
        self.waveform[dst..].copy_from_slice(&samples[src..]);

        for (i, value) in self.waveform.iter().enumerate() {
            self.input[i] = value * self.window[i];
        }
        self.fft
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)?;

        // Coherent-gain normalisation puts a full-scale sine at ~1.0, then
        // each bin decays toward the new magnitude at the smoothing rate.
        let norm = 2.0 / self.window_sum.max(f32::EPSILON);
        for (slot, bin) in self.smoothed.iter_mut().zip(self.spectrum.iter()) {
            let magnitude = bin.norm() * norm;
            *slot = self.smoothing * *slot + (1.0 - self.smoothing) * magnitude;
        }

        Ok(())
    }

    /// Returns the smoothed spectrum scaled to bytes.
    pub fn byte_spectrum(&self) -> Vec<u8> {
        self.smoothed
            .iter()
            .map(|&magnitude| {
                if magnitude <= 0.0 {
                    return 0;
                }
                let db = 20.0 * magnitude.log10();
                let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
                scaled.clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// The most recent time-domain block, unwindowed.
    pub fn waveform(&self) -> &[f32] {
        &self.waveform
    }
}

impl std::fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("sample_rate", &self.sample_rate)
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .finish()
    }
}

/// Turns byte spectra into the per-frame feature set, carrying the beat
/// debounce clock across frames.
#[derive(Debug)]
pub struct FeatureExtractor {
    bands: BandPlan,
    min_beat_interval: Duration,
    last_beat: Option<Instant>,
}

impl FeatureExtractor {
    pub fn new(bands: BandPlan, min_beat_interval: Duration) -> Self {
        Self {
            bands,
            min_beat_interval,
            last_beat: None,
        }
    }

    /// Replaces the band table; takes effect on the next frame.
    pub fn set_bands(&mut self, bands: BandPlan) {
        self.bands = bands;
    }

    /// Clears the beat debounce clock.
    pub fn reset(&mut self) {
        self.last_beat = None;
    }

    pub fn bands(&self) -> &BandPlan {
        &self.bands
    }

    /// Computes one frame's features from the analyser outputs.
    pub fn extract(
        &mut self,
        spectrum: &[u8],
        waveform: &[f32],
        sample_rate: u32,
        sensitivity: u8,
        now: Instant,
    ) -> AudioSnapshot {
        let gain = sensitivity as f32 / NEUTRAL_SENSITIVITY;

        let volume = if spectrum.is_empty() {
            0.0
        } else {
            let mean = spectrum.iter().map(|&b| b as f32).sum::<f32>() / spectrum.len() as f32;
            (mean / 255.0 * 100.0 * gain).clamp(0.0, 100.0)
        };

        let dominant_frequency = dominant_frequency(spectrum, sample_rate);
        let dominant_note = pitch_for_frequency(dominant_frequency);

        let bands = BandEnergies {
            bass: band_energy(spectrum, sample_rate, self.bands.bass.low_hz, self.bands.bass.high_hz),
            low_mid: band_energy(
                spectrum,
                sample_rate,
                self.bands.low_mid.low_hz,
                self.bands.low_mid.high_hz,
            ),
            mid: band_energy(spectrum, sample_rate, self.bands.mid.low_hz, self.bands.mid.high_hz),
            treble: band_energy(
                spectrum,
                sample_rate,
                self.bands.treble.low_hz,
                self.bands.treble.high_hz,
            ),
            high: band_energy(spectrum, sample_rate, self.bands.high.low_hz, self.bands.high.high_hz),
        };

        let beat_detected = self.update_beat(bands.bass / 100.0, gain, now);

        AudioSnapshot {
            volume,
            bands,
            dominant_frequency,
            dominant_note,
            beat_detected,
            raw_frequency_data: spectrum.to_vec(),
            raw_time_domain_data: waveform.to_vec(),
            sensitivity,
        }
    }

    /// Edge-triggered onset detection on the bass fraction, debounced by
    /// the configured minimum inter-beat interval.
    fn update_beat(&mut self, bass_fraction: f32, gain: f32, now: Instant) -> bool {
        let threshold = BEAT_BASS_THRESHOLD * gain;
        if bass_fraction <= threshold {
            return false;
        }

        let elapsed_ok = self
            .last_beat
            .map(|last| now.duration_since(last) >= self.min_beat_interval)
            .unwrap_or(true);
        if elapsed_ok {
            self.last_beat = Some(now);
        }
        elapsed_ok
    }
}

/// Centre frequency of a spectrum bin.
fn bin_frequency(bin: usize, sample_rate: u32, bin_count: usize) -> f32 {
    bin as f32 * sample_rate as f32 / (2.0 * bin_count as f32)
}

/// Strongest bin within the 80-4000 Hz window, converted to Hz. Returns
/// 0.0 when every bin in the window is silent.
fn dominant_frequency(spectrum: &[u8], sample_rate: u32) -> f32 {
    let bin_count = spectrum.len();
    let mut peak_bin = 0usize;
    let mut peak_magnitude = 0u8;
    for (bin, &magnitude) in spectrum.iter().enumerate() {
        let hz = bin_frequency(bin, sample_rate, bin_count);
        if hz < DOMINANT_MIN_HZ || hz > DOMINANT_MAX_HZ {
            continue;
        }
        if magnitude > peak_magnitude {
            peak_magnitude = magnitude;
            peak_bin = bin;
        }
    }

    if peak_magnitude == 0 {
        0.0
    } else {
        bin_frequency(peak_bin, sample_rate, bin_count)
    }
}

/// Average byte magnitude over the bins of a Hz range, scaled to 0-100.
fn band_energy(spectrum: &[u8], sample_rate: u32, low_hz: f32, high_hz: f32) -> f32 {
    let bin_count = spectrum.len();
    let mut sum = 0.0f32;
    let mut bins = 0usize;
    for (bin, &magnitude) in spectrum.iter().enumerate() {
        let hz = bin_frequency(bin, sample_rate, bin_count);
        if hz >= low_hz && hz < high_hz {
            sum += magnitude as f32;
            bins += 1;
        }
    }

    if bins == 0 {
        0.0
    } else {
        (sum / bins as f32 / 255.0 * 100.0).clamp(0.0, 100.0)
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

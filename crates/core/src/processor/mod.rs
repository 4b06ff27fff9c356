use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analysis::{AudioSnapshot, FeatureExtractor, SpectrumAnalyser};
use crate::capture::{CaptureSession, StreamEvent};
use crate::config::{clamp_sensitivity, AppConfig, AudioConfig, BandPlan};
use crate::diagnostics::{DiagnosticsSink, TracingSink};
use crate::error::AcquisitionError;

/// Reconnection attempts before the link is declared dead.
const MAX_RECOVERY_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 10_000;

/// Consecutive frames of digital silence before the input is considered
/// muted (~0.75 s at 60 fps).
const MUTE_FRAMES: u32 = 45;
const SILENCE_PEAK: f32 = 1e-4;

/// Where the capture link currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session has been acquired yet (or `stop` released it).
    Idle,
    /// Capture is live and frames are being analysed.
    Active,
    /// The stream ended; waiting out the backoff before reacquisition
    /// attempt `attempt`.
    Recovering { attempt: u32, retry_at: Instant },
    /// Automatic recovery is exhausted; a manual restart is required.
    Failed,
}

/// Handle returned by [`AudioFeatureProcessor::add_observer`], used to
/// unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&AudioSnapshot)>;

/// The audio feature pipeline: owns the capture session, derives one
/// [`AudioSnapshot`] per frame tick, fans it out to observers, and runs the
/// bounded reconnection machine when the microphone disappears.
///
/// The host drives it by calling [`process_frame`](Self::process_frame)
/// once per display frame; nothing here blocks or spawns threads beyond
/// the platform's own capture callback.
pub struct AudioFeatureProcessor {
    audio: AudioConfig,
    device_name: Option<String>,
    sensitivity: u8,
    diagnostics: Arc<dyn DiagnosticsSink>,
    extractor: FeatureExtractor,
    analyser: Option<SpectrumAnalyser>,
    session: Option<CaptureSession>,
    state: LinkState,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
    track_failures: u32,
    is_muted: bool,
    silent_frames: u32,
    frame_scratch: Vec<f32>,
}

impl AudioFeatureProcessor {
    pub fn new(config: AppConfig) -> Self {
        Self::with_diagnostics(config, Arc::new(TracingSink))
    }

    pub fn with_diagnostics(config: AppConfig, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        let audio = config.audio.sanitized();
        let extractor = FeatureExtractor::new(
            audio.bands,
            Duration::from_millis(audio.min_beat_interval_ms),
        );
        let frame_scratch = vec![0.0; audio.fft_size];
        let sensitivity = audio.sensitivity;

        Self {
            audio,
            device_name: None,
            sensitivity,
            diagnostics,
            extractor,
            analyser: None,
            session: None,
            state: LinkState::Idle,
            observers: Vec::new(),
            next_observer: 0,
            track_failures: 0,
            is_muted: false,
            silent_frames: 0,
            frame_scratch,
        }
    }

    /// Selects a capture device by name for the next acquisition; `None`
    /// uses the platform default.
    pub fn set_device(&mut self, device_name: Option<String>) {
        self.device_name = device_name;
    }

    /// Acquires the microphone and arms the per-frame analysis.
    ///
    /// Any previous session is fully released first, so at most one
    /// capture session exists at a time.
    pub fn initialize(&mut self) -> Result<(), AcquisitionError> {
        self.release_session();

        let session = CaptureSession::open(
            self.device_name.as_deref(),
            self.audio.sample_rate,
            self.diagnostics.as_ref(),
        )?;
        self.install_session(session);
        Ok(())
    }

    /// Ensures the pipeline is running; a no-op while a session is live or
    /// recovering, otherwise equivalent to [`initialize`](Self::initialize).
    pub fn start(&mut self) -> Result<(), AcquisitionError> {
        match self.state {
            LinkState::Active | LinkState::Recovering { .. } => Ok(()),
            LinkState::Idle | LinkState::Failed => self.initialize(),
        }
    }

    /// Releases the session and resets all rolling state. Idempotent and
    /// valid in every state; a pending recovery wait is cancelled.
    pub fn stop(&mut self) {
        self.release_session();
        self.state = LinkState::Idle;
        self.track_failures = 0;
        self.is_muted = false;
        self.silent_frames = 0;
        self.extractor.reset();
    }

    /// Clamps to 1-10 and applies from the next frame.
    pub fn set_sensitivity(&mut self, value: u8) {
        self.sensitivity = clamp_sensitivity(value);
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity
    }

    /// Replaces the band table; applies from the next frame.
    pub fn set_bands(&mut self, bands: BandPlan) {
        self.extractor.set_bands(bands);
    }

    /// Registers an observer invoked once per analysed frame, in
    /// registration order. A panicking observer is contained and logged;
    /// it never halts the pipeline or starves later observers.
    pub fn add_observer<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&AudioSnapshot) + 'static,
    {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Unregisters an observer. Returns false if the id is unknown.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, LinkState::Active)
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    /// Stream terminations observed since the last successful (re)start.
    pub fn failure_count(&self) -> u32 {
        self.track_failures
    }

    pub fn link_state(&self) -> LinkState {
        self.state
    }

    /// The per-frame tick. Call once per display frame.
    ///
    /// While the link is active this analyses the latest capture block,
    /// publishes exactly one snapshot to every observer and returns it.
    /// While recovering it only advances the reconnection machine.
    pub fn process_frame(&mut self) -> Option<AudioSnapshot> {
        self.advance(Instant::now())
    }

    fn advance(&mut self, now: Instant) -> Option<AudioSnapshot> {
        match self.state {
            LinkState::Idle | LinkState::Failed => return None,
            LinkState::Recovering { attempt, retry_at } => {
                if now >= retry_at {
                    self.try_reacquire(attempt, now);
                }
                return None;
            }
            LinkState::Active => {}
        }

        self.drain_stream_events(now);
        if !matches!(self.state, LinkState::Active) {
            return None;
        }

        let snapshot = self.analyse_frame(now)?;
        self.notify_observers(&snapshot);
        Some(snapshot)
    }

    /// Consumes pending stream events: termination enters recovery, faults
    /// are advisory.
    fn drain_stream_events(&mut self, now: Instant) {
        loop {
            let event = match self.session.as_ref().and_then(CaptureSession::poll_event) {
                Some(event) => event,
                None => return,
            };

            match event {
                StreamEvent::Ended => {
                    self.track_failures += 1;
                    self.diagnostics
                        .warning("microphone stream ended; attempting to reconnect");
                    self.release_session();
                    self.state = LinkState::Recovering {
                        attempt: 1,
                        retry_at: now + backoff_delay(1),
                    };
                    return;
                }
                StreamEvent::Fault(message) => {
                    self.diagnostics
                        .warning(&format!("capture stream fault: {message}"));
                }
            }
        }
    }

    fn try_reacquire(&mut self, attempt: u32, now: Instant) {
        match CaptureSession::open(
            self.device_name.as_deref(),
            self.audio.sample_rate,
            self.diagnostics.as_ref(),
        ) {
            Ok(session) => {
                self.install_session(session);
                self.diagnostics.clear_warning();
                tracing::info!(attempt, "microphone reconnected");
            }
            Err(err) => {
                tracing::warn!(attempt, %err, "reacquisition attempt failed");
                self.state = next_recovery_state(attempt, now);
                if matches!(self.state, LinkState::Failed) {
                    self.diagnostics.error(&format!(
                        "microphone could not be reacquired after {MAX_RECOVERY_ATTEMPTS} attempts; restart capture manually"
                    ));
                }
            }
        }
    }

    /// Wires a freshly opened session in: the analyser is rebuilt for the
    /// negotiated sample rate, the extractor's beat clock carries over.
    fn install_session(&mut self, session: CaptureSession) {
        self.analyser = Some(SpectrumAnalyser::new(
            session.sample_rate(),
            self.audio.fft_size,
            self.audio.smoothing,
        ));
        tracing::info!(
            device = %session.device_name(),
            sample_rate = session.sample_rate(),
            "capture session active"
        );
        self.session = Some(session);
        self.state = LinkState::Active;
        self.track_failures = 0;
        self.is_muted = false;
        self.silent_frames = 0;
    }

    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.analyser = None;
    }

    fn analyse_frame(&mut self, now: Instant) -> Option<AudioSnapshot> {
        self.frame_scratch.fill(0.0);
        self.session.as_ref()?.read_latest(&mut self.frame_scratch);
        self.update_mute_state();

        let analyser = self.analyser.as_mut()?;
        if let Err(err) = analyser.push_block(&self.frame_scratch) {
            tracing::error!(%err, "spectrum update failed");
            return None;
        }

        let spectrum = analyser.byte_spectrum();
        Some(self.extractor.extract(
            &spectrum,
            analyser.waveform(),
            analyser.sample_rate(),
            self.sensitivity,
            now,
        ))
    }

    /// Silence watchdog standing in for per-track mute notifications:
    /// sustained digital silence flips the flag, any signal clears it.
    fn update_mute_state(&mut self) {
        let peak = self
            .frame_scratch
            .iter()
            .fold(0.0f32, |acc, &sample| acc.max(sample.abs()));

        if peak < SILENCE_PEAK {
            self.silent_frames = self.silent_frames.saturating_add(1);
            if self.silent_frames == MUTE_FRAMES {
                self.is_muted = true;
                self.diagnostics
                    .warning("microphone appears muted: no signal received");
            }
        } else {
            if self.is_muted {
                self.is_muted = false;
                self.diagnostics.clear_warning();
            }
            self.silent_frames = 0;
        }
    }

    fn notify_observers(&mut self, snapshot: &AudioSnapshot) {
        for (id, observer) in self.observers.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| observer(snapshot))).is_err() {
                tracing::error!(observer = id.0, "observer panicked while handling a frame");
            }
        }
    }
}

impl std::fmt::Debug for AudioFeatureProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFeatureProcessor")
            .field("state", &self.state)
            .field("sensitivity", &self.sensitivity)
            .field("observers", &self.observers.len())
            .field("track_failures", &self.track_failures)
            .field("is_muted", &self.is_muted)
            .finish()
    }
}

/// Backoff before reacquisition attempt `attempt`:
/// `min(1000 * 2^(n-1), 10000)` milliseconds.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    Duration::from_millis((BASE_BACKOFF_MS << exponent).min(MAX_BACKOFF_MS))
}

/// State following a failed reacquisition attempt.
fn next_recovery_state(failed_attempt: u32, now: Instant) -> LinkState {
    if failed_attempt >= MAX_RECOVERY_ATTEMPTS {
        LinkState::Failed
    } else {
        let next = failed_attempt + 1;
        LinkState::Recovering {
            attempt: next,
            retry_at: now + backoff_delay(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        warnings: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl DiagnosticsSink for RecordingSink {
        fn warning(&self, message: &str) {
            self.warnings.lock().unwrap().push(message.to_string());
        }

        fn error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    fn processor_with_sink() -> (AudioFeatureProcessor, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let processor =
            AudioFeatureProcessor::with_diagnostics(AppConfig::live_defaults(), sink.clone());
        (processor, sink)
    }

    #[test]
    fn backoff_doubles_and_caps_at_ten_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(6), Duration::from_millis(10_000));
    }

    #[test]
    fn failed_attempts_escalate_until_terminal() {
        let now = Instant::now();

        match next_recovery_state(1, now) {
            LinkState::Recovering { attempt, retry_at } => {
                assert_eq!(attempt, 2);
                assert_eq!(retry_at, now + Duration::from_millis(2_000));
            }
            other => panic!("expected recovering, got {other:?}"),
        }

        assert_eq!(next_recovery_state(3, now), LinkState::Failed);
    }

    #[test]
    fn exhausted_recovery_reaches_failed_and_stays_there() {
        let (mut processor, sink) = processor_with_sink();
        // A name no host will ever report, so every reacquisition fails.
        processor.set_device(Some("session-visuals-nonexistent-input".into()));

        let t0 = Instant::now();
        processor.state = LinkState::Recovering {
            attempt: 1,
            retry_at: t0 + backoff_delay(1),
        };

        // Before the deadline nothing happens.
        assert!(processor.advance(t0).is_none());
        assert!(matches!(
            processor.link_state(),
            LinkState::Recovering { attempt: 1, .. }
        ));

        let mut tick = t0;
        for expected_next in [2u32, 3] {
            tick += Duration::from_secs(20);
            assert!(processor.advance(tick).is_none());
            match processor.link_state() {
                LinkState::Recovering { attempt, .. } => assert_eq!(attempt, expected_next),
                other => panic!("expected recovering, got {other:?}"),
            }
        }

        tick += Duration::from_secs(20);
        assert!(processor.advance(tick).is_none());
        assert_eq!(processor.link_state(), LinkState::Failed);
        assert_eq!(sink.errors.lock().unwrap().len(), 1);

        // Terminal: further ticks never retry again.
        assert!(processor.advance(tick + Duration::from_secs(60)).is_none());
        assert_eq!(processor.link_state(), LinkState::Failed);
        assert_eq!(sink.errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_cancels_recovery() {
        let (mut processor, _sink) = processor_with_sink();
        processor.state = LinkState::Recovering {
            attempt: 2,
            retry_at: Instant::now(),
        };
        processor.track_failures = 2;

        processor.stop();
        processor.stop();

        assert_eq!(processor.link_state(), LinkState::Idle);
        assert_eq!(processor.failure_count(), 0);
        assert!(!processor.is_muted());
        assert!(processor.process_frame().is_none());
    }

    #[test]
    fn sensitivity_is_clamped_on_the_way_in() {
        let (mut processor, _sink) = processor_with_sink();
        processor.set_sensitivity(0);
        assert_eq!(processor.sensitivity(), 1);
        processor.set_sensitivity(42);
        assert_eq!(processor.sensitivity(), 10);
        processor.set_sensitivity(7);
        assert_eq!(processor.sensitivity(), 7);
    }

    #[test]
    fn observers_run_in_registration_order_and_survive_a_panicking_peer() {
        let (mut processor, _sink) = processor_with_sink();
        let seen: Rc<RefCell<Vec<u32>>> = Rc::default();

        let first = seen.clone();
        processor.add_observer(move |_| first.borrow_mut().push(1));
        processor.add_observer(|_| panic!("renderer bug"));
        let third = seen.clone();
        processor.add_observer(move |_| third.borrow_mut().push(3));

        let snapshot = AudioSnapshot::default();
        processor.notify_observers(&snapshot);
        processor.notify_observers(&snapshot);

        assert_eq!(*seen.borrow(), vec![1, 3, 1, 3]);
    }

    #[test]
    fn removed_observers_stop_receiving_frames() {
        let (mut processor, _sink) = processor_with_sink();
        let seen: Rc<RefCell<Vec<&'static str>>> = Rc::default();

        let a = seen.clone();
        let first = processor.add_observer(move |_| a.borrow_mut().push("first"));
        let b = seen.clone();
        processor.add_observer(move |_| b.borrow_mut().push("second"));

        assert!(processor.remove_observer(first));
        assert!(!processor.remove_observer(first));

        processor.notify_observers(&AudioSnapshot::default());
        assert_eq!(*seen.borrow(), vec!["second"]);
    }

    #[test]
    fn band_table_mutation_reaches_the_extractor() {
        let (mut processor, _sink) = processor_with_sink();
        let mut bands = BandPlan::default();
        bands.bass.high_hz = 300.0;
        processor.set_bands(bands);
        assert_eq!(processor.extractor.bands().bass.high_hz, 300.0);
    }

    #[test]
    fn idle_processor_produces_no_frames() {
        let (mut processor, _sink) = processor_with_sink();
        assert!(processor.process_frame().is_none());
        assert!(!processor.is_active());
    }
}

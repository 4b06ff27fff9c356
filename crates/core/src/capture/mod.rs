use std::sync::{mpsc, Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, BuildStreamError, Device, Host, SampleFormat, SampleRate, StreamConfig};

use crate::diagnostics::DiagnosticsSink;
use crate::error::AcquisitionError;

/// Lifecycle notifications emitted by the platform stream, drained by the
/// processor once per frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream terminated (device unplugged or claimed by another
    /// application). The session is unusable afterwards.
    Ended,
    /// A non-fatal backend fault; the stream keeps running.
    Fault(String),
}

/// Names of every input device the default host exposes.
pub fn list_input_devices() -> Result<Vec<String>, AcquisitionError> {
    if cpal::available_hosts().is_empty() {
        return Err(AcquisitionError::UnsupportedPlatform);
    }

    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|err| AcquisitionError::Unknown(err.to_string()))?;
    Ok(devices.filter_map(|device| device.name().ok()).collect())
}

/// An exclusive microphone capture session: the cpal stream plus the mono
/// sample ring its callback fills. Dropping (or [`close`](Self::close)-ing)
/// the session releases the device.
pub struct CaptureSession {
    stream: cpal::Stream,
    device_name: String,
    sample_rate: u32,
    ring: Arc<Mutex<SampleRing>>,
    events: mpsc::Receiver<StreamEvent>,
}

impl CaptureSession {
    /// Acquires the microphone.
    ///
    /// Tries a mono stream at the preferred sample rate first; if the
    /// device rejects that configuration the request is retried once with
    /// the device's own default configuration before giving up.
    pub fn open(
        device_name: Option<&str>,
        preferred_sample_rate: u32,
        diagnostics: &dyn DiagnosticsSink,
    ) -> Result<Self, AcquisitionError> {
        if cpal::available_hosts().is_empty() {
            return Err(AcquisitionError::UnsupportedPlatform);
        }

        let host = cpal::default_host();
        log_device_inventory(&host, diagnostics);

        let device = resolve_device(&host, device_name)?;
        let resolved_name = device
            .name()
            .unwrap_or_else(|_| String::from("<unnamed input>"));

        let (event_tx, event_rx) = mpsc::channel();
        // One second of headroom keeps the analyser fed even if a frame
        // tick is delayed.
        let ring = Arc::new(Mutex::new(SampleRing::new(
            preferred_sample_rate.max(8_000) as usize,
        )));

        let preferred = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(preferred_sample_rate),
            buffer_size: BufferSize::Default,
        };

        let (stream, sample_rate) =
            match build_stream::<f32>(&device, &preferred, ring.clone(), event_tx.clone()) {
                Ok(stream) => (stream, preferred_sample_rate),
                Err(err) if constraint_rejected(&err) => {
                    tracing::warn!(%err, "preferred capture config rejected, falling back to device default");
                    open_with_default_config(&device, ring.clone(), event_tx)?
                }
                Err(err) => return Err(map_build_error(err)),
            };

        stream.play().map_err(map_play_error)?;
        tracing::info!(device = %resolved_name, sample_rate, "capture stream started");

        Ok(Self {
            stream,
            device_name: resolved_name,
            sample_rate,
            ring,
            events: event_rx,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Copies the most recent samples into the tail of `out`, returning how
    /// many were available. The caller is expected to pre-zero `out`.
    pub fn read_latest(&self, out: &mut [f32]) -> usize {
        match self.ring.lock() {
            Ok(ring) => ring.latest_into(out),
            Err(_) => 0,
        }
    }

    /// Next pending stream event, if any.
    pub fn poll_event(&self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Stops and releases the device.
    pub fn close(self) {
        let _ = self.stream.pause();
        tracing::debug!(device = %self.device_name, "capture stream released");
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device_name", &self.device_name)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Logs the input inventory for diagnostics. Failures here never abort
/// acquisition.
fn log_device_inventory(host: &Host, diagnostics: &dyn DiagnosticsSink) {
    let names = match host.input_devices() {
        Ok(devices) => devices
            .filter_map(|device| device.name().ok())
            .collect::<Vec<_>>(),
        Err(err) => {
            tracing::warn!(%err, "could not enumerate input devices");
            return;
        }
    };

    for name in &names {
        tracing::debug!(device = %name, "input device present");
    }

    if !names.is_empty() && host.default_input_device().is_none() {
        diagnostics.warning(
            "input devices exist but none is the default; capture will likely be refused",
        );
    }
}

fn resolve_device(host: &Host, device_name: Option<&str>) -> Result<Device, AcquisitionError> {
    match device_name {
        Some(wanted) => host
            .input_devices()
            .map_err(|err| AcquisitionError::Unknown(err.to_string()))?
            .find(|device| device.name().map(|name| name == wanted).unwrap_or(false))
            .ok_or(AcquisitionError::NoDeviceFound),
        None => host
            .default_input_device()
            .ok_or(AcquisitionError::NoDeviceFound),
    }
}

/// Whether a build failure means the requested configuration was rejected
/// (worth retrying with defaults) rather than the device being gone.
fn constraint_rejected(err: &BuildStreamError) -> bool {
    !matches!(err, BuildStreamError::DeviceNotAvailable)
}

fn open_with_default_config(
    device: &Device,
    ring: Arc<Mutex<SampleRing>>,
    events: mpsc::Sender<StreamEvent>,
) -> Result<(cpal::Stream, u32), AcquisitionError> {
    let supported = device.default_input_config().map_err(|err| match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => AcquisitionError::DeviceBusy,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            AcquisitionError::ConstraintsUnsupported(err.to_string())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            AcquisitionError::from_backend_description(&err.description)
        }
    })?;

    let sample_rate = supported.sample_rate().0;
    let config: StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(device, &config, ring, events),
        SampleFormat::I16 => build_stream::<i16>(device, &config, ring, events),
        SampleFormat::U16 => build_stream::<u16>(device, &config, ring, events),
        other => {
            return Err(AcquisitionError::ConstraintsUnsupported(format!(
                "unsupported sample format {other:?}"
            )))
        }
    }
    .map_err(map_build_error)?;

    Ok((stream, sample_rate))
}

/// Builds an input stream for one sample type, downmixing interleaved
/// frames to mono before buffering.
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    ring: Arc<Mutex<SampleRing>>,
    events: mpsc::Sender<StreamEvent>,
) -> Result<cpal::Stream, BuildStreamError>
where
    T: cpal::Sample + cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = (config.channels as usize).max(1);

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mut ring = match ring.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            for frame in data.chunks(channels) {
                let sum: f32 = frame
                    .iter()
                    .map(|sample| {
                        let value: f32 = cpal::Sample::from_sample(*sample);
                        value
                    })
                    .sum();
                ring.push(sum / channels as f32);
            }
        },
        move |err| {
            let event = match err {
                cpal::StreamError::DeviceNotAvailable => StreamEvent::Ended,
                other => StreamEvent::Fault(other.to_string()),
            };
            let _ = events.send(event);
        },
        None,
    )
}

fn map_build_error(err: BuildStreamError) -> AcquisitionError {
    match err {
        BuildStreamError::DeviceNotAvailable => AcquisitionError::DeviceBusy,
        BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
            AcquisitionError::ConstraintsUnsupported(err.to_string())
        }
        BuildStreamError::BackendSpecific { err } => {
            AcquisitionError::from_backend_description(&err.description)
        }
        other => AcquisitionError::Unknown(other.to_string()),
    }
}

fn map_play_error(err: cpal::PlayStreamError) -> AcquisitionError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => AcquisitionError::DeviceBusy,
        cpal::PlayStreamError::BackendSpecific { err } => {
            AcquisitionError::from_backend_description(&err.description)
        }
    }
}

/// Fixed-capacity ring the capture callback writes mono samples into.
struct SampleRing {
    samples: Vec<f32>,
    write_pos: usize,
    filled: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            write_pos: 0,
            filled: 0,
        }
    }

    fn push(&mut self, sample: f32) {
        self.samples[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.filled = (self.filled + 1).min(self.samples.len());
    }

    /// Copies the newest available samples, oldest first, into the tail of
    /// `out`. Returns the number of samples written.
    fn latest_into(&self, out: &mut [f32]) -> usize {
        let capacity = self.samples.len();
        let count = out.len().min(self.filled);
        let dst_start = out.len() - count;
        let src_start = (self.write_pos + capacity - count) % capacity;

        for (offset, slot) in out[dst_start..].iter_mut().enumerate() {
            *slot = self.samples[(src_start + offset) % capacity];
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_returns_recent_samples_in_order() {
        let mut ring = SampleRing::new(8);
        for sample in [1.0, 2.0, 3.0, 4.0] {
            ring.push(sample);
        }

        let mut out = [0.0; 3];
        assert_eq!(ring.latest_into(&mut out), 3);
        assert_eq!(out, [2.0, 3.0, 4.0]);
    }

    #[test]
    fn ring_wraps_and_preserves_time_order() {
        let mut ring = SampleRing::new(5);
        for sample in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0] {
            ring.push(sample);
        }

        let mut out = [0.0; 5];
        assert_eq!(ring.latest_into(&mut out), 5);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn ring_reports_partial_fills_and_pads_the_head() {
        let ring = {
            let mut ring = SampleRing::new(8);
            ring.push(7.0);
            ring.push(8.0);
            ring
        };

        let mut out = [0.0; 4];
        assert_eq!(ring.latest_into(&mut out), 2);
        assert_eq!(out, [0.0, 0.0, 7.0, 8.0]);
    }

    #[test]
    fn constraint_rejection_drives_the_fallback_policy() {
        assert!(constraint_rejected(&BuildStreamError::StreamConfigNotSupported));
        assert!(constraint_rejected(&BuildStreamError::InvalidArgument));
        assert!(!constraint_rejected(&BuildStreamError::DeviceNotAvailable));
    }

    #[test]
    fn build_errors_map_onto_the_acquisition_taxonomy() {
        assert!(matches!(
            map_build_error(BuildStreamError::DeviceNotAvailable),
            AcquisitionError::DeviceBusy
        ));
        assert!(matches!(
            map_build_error(BuildStreamError::StreamConfigNotSupported),
            AcquisitionError::ConstraintsUnsupported(_)
        ));
    }
}

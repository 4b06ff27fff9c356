/// Result alias that carries the custom [`SessionVizError`] type.
pub type Result<T> = std::result::Result<T, SessionVizError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SessionVizError {
    /// Microphone acquisition failed before the pipeline could start.
    #[error("audio capture unavailable: {0}")]
    Acquisition(#[from] AcquisitionError),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration files are JSON; malformed input surfaces here.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// Forward FFT processing failed (mismatched buffer lengths).
    #[error("fft processing failed: {0}")]
    Fft(#[from] realfft::FftError),
    /// Free-form error for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
}

impl SessionVizError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for SessionVizError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SessionVizError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Why a capture session could not be acquired.
///
/// Each variant maps to a distinct remediation the UI layer can present;
/// the pipeline itself never retries acquisition failures automatically.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("microphone permission was denied")]
    PermissionDenied,

    #[error("no capture device is available")]
    NoDeviceFound,

    #[error("the capture device is busy or was disconnected")]
    DeviceBusy,

    #[error("no supported capture configuration: {0}")]
    ConstraintsUnsupported(String),

    #[error("this platform exposes no audio capture capability")]
    UnsupportedPlatform,

    #[error("{0}")]
    Unknown(String),
}

impl AcquisitionError {
    /// Classifies a backend-specific error description into the taxonomy.
    ///
    /// cpal folds platform errors into free-form strings; permission and
    /// device-contention failures are only recognisable by their text.
    pub(crate) fn from_backend_description(description: &str) -> Self {
        let lower = description.to_ascii_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("access") {
            Self::PermissionDenied
        } else if lower.contains("busy") || lower.contains("in use") {
            Self::DeviceBusy
        } else {
            Self::Unknown(description.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_descriptions_classify_by_text() {
        assert!(matches!(
            AcquisitionError::from_backend_description("Operation not permitted: access denied"),
            AcquisitionError::PermissionDenied
        ));
        assert!(matches!(
            AcquisitionError::from_backend_description("Device or resource busy"),
            AcquisitionError::DeviceBusy
        ));
        assert!(matches!(
            AcquisitionError::from_backend_description("snd_pcm_open failed"),
            AcquisitionError::Unknown(_)
        ));
    }

    #[test]
    fn acquisition_errors_convert_into_crate_error() {
        let err: SessionVizError = AcquisitionError::NoDeviceFound.into();
        assert!(format!("{err}").contains("no capture device"));
    }
}

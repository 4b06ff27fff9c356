/// Capability for surfacing advisory warnings and terminal errors to the
/// embedding application.
///
/// The pipeline never reaches for a global to report problems; whoever
/// constructs it supplies this sink (a UI layer typically wires its status
/// banner here). [`TracingSink`] is the default for headless use.
pub trait DiagnosticsSink {
    /// A non-fatal condition the user may want to know about (mute,
    /// reconnection in progress, degraded configuration).
    fn warning(&self, message: &str);

    /// A terminal condition requiring manual intervention.
    fn error(&self, message: &str);

    /// The condition behind the last warning has resolved itself; a UI can
    /// dismiss whatever it surfaced.
    fn clear_warning(&self) {}
}

/// Default sink that routes both channels to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn warning(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }

    fn clear_warning(&self) {
        tracing::debug!("previous warning cleared");
    }
}

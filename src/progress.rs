//! Progress reporting surface for the core. The engine has no I/O to a
//! terminal; callers supply an observer that receives progress events and
//! non-fatal warnings instead.

/// One phase of a package-build or extraction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    HeaderReserved,
    StreamingNca,
    StreamingMeta,
    StreamingAux,
    HeaderFinalized,
}

/// A progress update, emitted at most once per streamed block.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Estimated seconds remaining, if the observer wants to display one.
    pub eta_hint: Option<f64>,
}

/// Receives progress events and non-fatal warnings from the core.
///
/// A default no-op implementation is provided so callers that don't care
/// about progress can pass `&NullObserver`.
pub trait ProgressObserver {
    fn on_progress(&self, _event: ProgressEvent) {}
    fn on_warning(&self, _message: &str) {}
}

/// An observer that discards everything.
pub struct NullObserver;
impl ProgressObserver for NullObserver {}

/// An observer that forwards everything to `tracing`, used by the CLI.
pub struct TracingObserver;
impl ProgressObserver for TracingObserver {
    fn on_progress(&self, event: ProgressEvent) {
        tracing::info!(
            phase = ?event.phase,
            bytes_done = event.bytes_done,
            bytes_total = event.bytes_total,
            eta_hint = event.eta_hint,
            "progress"
        );
    }

    fn on_warning(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}

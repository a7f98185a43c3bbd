//! Backend subsystems.
//!
//! Only the DRM/KMS backend lives here for now; the event type is shared
//! so further backends (headless, nested) can reuse it.

pub mod drm;

use crate::output::{OutputId, PresentEvent};

/// Notifications surfaced to the library consumer, drained with
/// [`drm::DrmBackend::poll_event`].
#[derive(Debug)]
pub enum BackendEvent {
    /// A connector lit up. The consumer should create the output's
    /// swapchain and start rendering.
    NewOutput(OutputId),
    /// The output wants a new frame.
    Frame(OutputId),
    /// A page flip completed.
    Present {
        output: OutputId,
        info: PresentEvent,
    },
    /// A commit was executed on the output.
    Commit(OutputId),
    /// The output is gone; consumers must drop all state derived from it.
    OutputDestroyed { output: OutputId, name: String },
}

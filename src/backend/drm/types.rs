//! Shared types for the DRM backend.

use std::rc::Rc;

use drm::control::{self, crtc, property, PageFlipFlags};

use super::fb::DrmFramebuffer;

/// Device capabilities read once at init, immutable afterwards.
///
/// PRIME import, per-CRTC vblank events, monotonic timestamps and
/// universal planes are hard requirements; a device missing any of them is
/// rejected during init, so only the optional capabilities appear here.
#[derive(Debug, Clone, Copy)]
pub struct DrmCaps {
    /// Cursor plane dimensions; the kernel default of 64x64 applies when
    /// the driver declines to answer.
    pub cursor_size: (u32, u32),
    /// Immediate (tearing) page flips are available.
    pub supports_async_commit: bool,
    /// Framebuffers can be created with explicit format modifiers.
    pub supports_addfb2_modifiers: bool,
}

/// Property handles cached per CRTC at init.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct CrtcProps {
    pub mode_id: Option<property::Handle>,
    pub vrr_enabled: Option<property::Handle>,
}

/// A scan-out engine.
///
/// Plane associations are indices into the backend's plane table; the
/// backend owns all three resource collections and never links records
/// with strong references.
pub(super) struct Crtc {
    pub handle: crtc::Handle,
    pub props: CrtcProps,
    /// Size of the legacy gamma ramp. Unused until gamma management
    /// grows a consumer-facing surface, but read at init like the rest
    /// of the CRTC state.
    #[allow(dead_code)]
    pub gamma_size: u32,
    pub primary: Option<usize>,
    pub cursor: Option<usize>,
    /// Refresh rate of the currently programmed mode, in mHz.
    pub refresh_millihz: i32,
}

/// Per-connector page-flip tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum FlipState {
    #[default]
    Idle,
    FlipPending,
}

/// Everything the low-level commit implementation needs to execute one
/// state transition. Built per commit and discarded afterwards.
pub(super) struct CommitData {
    pub main_fb: Option<Rc<DrmFramebuffer>>,
    /// Reserved for the cursor plane; never populated until cursor
    /// commits are implemented.
    pub cursor_fb: Option<Rc<DrmFramebuffer>>,
    /// Timing block for the target mode. `None` for buffer-only flips.
    pub mode_info: Option<control::Mode>,
    pub flags: PageFlipFlags,
    pub modeset: bool,
    pub blocking: bool,
    pub test: bool,
    pub enable: bool,
    /// Adaptive-sync change to apply, when committed.
    pub vrr: Option<bool>,
}

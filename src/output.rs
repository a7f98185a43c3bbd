//! Consumer-facing output facade.
//!
//! An [`Output`] exists while its connector is connected. Consumers mutate
//! the pending [`OutputState`] and apply it through
//! [`commit`](crate::backend::drm::DrmBackend::commit); the state tracks
//! which fields changed since the last commit so the backend can tell
//! modesets from plain page flips.

use std::rc::Rc;
use std::time::Duration;

use bitflags::bitflags;
use drm::buffer::DrmFourcc;
use drm::control;

use crate::buffer::Buffer;

/// Stable identifier of an output: the kernel object id of its connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub u32);

/// A display mode advertised by a connector, or synthesised for a custom
/// resolution.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub pixel_size: (u16, u16),
    /// Vertical refresh rate in millihertz.
    pub refresh_millihz: i32,
    pub preferred: bool,
    /// Kernel timing block. Absent for custom modes; the backend derives
    /// CVT timings at commit time.
    pub info: Option<control::Mode>,
}

impl PartialEq for OutputMode {
    fn eq(&self, other: &Self) -> bool {
        self.pixel_size == other.pixel_size && self.refresh_millihz == other.refresh_millihz
    }
}

/// How presentation is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentationMode {
    /// Flips happen at vblank.
    #[default]
    Vsync,
    /// Flips happen as soon as possible, tearing allowed.
    Immediate,
}

/// Physical subpixel layout of the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subpixel {
    #[default]
    Unknown,
    None,
    HorizontalRgb,
    HorizontalBgr,
    VerticalRgb,
    VerticalBgr,
}

impl From<control::connector::SubPixel> for Subpixel {
    fn from(value: control::connector::SubPixel) -> Self {
        use control::connector::SubPixel;
        match value {
            SubPixel::None => Self::None,
            SubPixel::HorizontalRgb => Self::HorizontalRgb,
            SubPixel::HorizontalBgr => Self::HorizontalBgr,
            SubPixel::VerticalRgb => Self::VerticalRgb,
            SubPixel::VerticalBgr => Self::VerticalBgr,
            _ => Self::Unknown,
        }
    }
}

bitflags! {
    /// Which parts of an [`OutputState`] changed since the last commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFields: u32 {
        const ENABLED = 1 << 0;
        const MODE = 1 << 1;
        const FORMAT = 1 << 2;
        const BUFFER = 1 << 3;
        const ADAPTIVE_SYNC = 1 << 4;
        const PRESENTATION_MODE = 1 << 5;
    }
}

impl Default for StateFields {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// How a frame reached the screen.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PresentFlags: u32 {
        const VSYNC = 1 << 0;
        const HW_CLOCK = 1 << 1;
        const HW_COMPLETION = 1 << 2;
        const ZEROCOPY = 1 << 3;
    }
}

/// Payload of a present notification, derived from the kernel's page-flip
/// event.
#[derive(Debug, Clone, Copy)]
pub struct PresentEvent {
    /// False when the flip completed while the session was inactive.
    pub presented: bool,
    /// Flip timestamp on the monotonic clock.
    pub when: Duration,
    /// Vblank sequence number.
    pub seq: u32,
    /// Nominal refresh interval of the active mode, in nanoseconds.
    pub refresh_ns: u32,
    pub flags: PresentFlags,
}

/// Pending state of an output.
///
/// Setters record the touched field; the set is consumed when the backend
/// commits. Values persist across commits, only the change tracking is
/// reset.
#[derive(Default)]
pub struct OutputState {
    committed: StateFields,
    enabled: bool,
    mode: Option<OutputMode>,
    custom_mode: Option<OutputMode>,
    format: Option<DrmFourcc>,
    buffer: Option<Rc<dyn Buffer>>,
    adaptive_sync: bool,
    presentation_mode: PresentationMode,
}

impl OutputState {
    pub fn committed(&self) -> StateFields {
        self.committed
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.committed |= StateFields::ENABLED;
    }

    pub fn mode(&self) -> Option<OutputMode> {
        self.mode
    }

    pub fn set_mode(&mut self, mode: OutputMode) {
        self.mode = Some(mode);
        self.custom_mode = None;
        self.committed |= StateFields::MODE;
    }

    pub fn custom_mode(&self) -> Option<OutputMode> {
        self.custom_mode
    }

    /// Request a mode the connector does not advertise. Timings are
    /// synthesised with CVT when the commit executes.
    pub fn set_custom_mode(&mut self, mode: OutputMode) {
        self.custom_mode = Some(mode);
        self.mode = None;
        self.committed |= StateFields::MODE;
    }

    pub fn format(&self) -> Option<DrmFourcc> {
        self.format
    }

    pub fn set_format(&mut self, format: DrmFourcc) {
        self.format = Some(format);
        self.committed |= StateFields::FORMAT;
    }

    pub fn buffer(&self) -> Option<&Rc<dyn Buffer>> {
        self.buffer.as_ref()
    }

    pub fn set_buffer(&mut self, buffer: Rc<dyn Buffer>) {
        self.buffer = Some(buffer);
        self.committed |= StateFields::BUFFER;
    }

    pub fn adaptive_sync(&self) -> bool {
        self.adaptive_sync
    }

    pub fn set_adaptive_sync(&mut self, enabled: bool) {
        self.adaptive_sync = enabled;
        self.committed |= StateFields::ADAPTIVE_SYNC;
    }

    pub fn presentation_mode(&self) -> PresentationMode {
        self.presentation_mode
    }

    pub fn set_presentation_mode(&mut self, mode: PresentationMode) {
        self.presentation_mode = mode;
        self.committed |= StateFields::PRESENTATION_MODE;
    }

    /// Called by the backend once a commit was executed.
    pub(crate) fn finish_commit(&mut self) {
        self.committed = StateFields::empty();
    }
}

/// A lit connector, as seen by the library consumer.
pub struct Output {
    pub(crate) id: OutputId,
    pub(crate) name: String,
    pub state: OutputState,
    pub(crate) modes: Vec<OutputMode>,
    pub(crate) physical_size_mm: (u32, u32),
    pub(crate) subpixel: Subpixel,
    pub(crate) make: Option<String>,
    pub(crate) model: Option<String>,
    pub(crate) serial: Option<String>,
    pub(crate) description: String,
    pub(crate) non_desktop: bool,
    pub(crate) vrr_capable: bool,
    /// Bounds of the connector's "max bpc" property, if it has one.
    pub(crate) max_bpc: Option<(u64, u64)>,
    /// Raw EDID blob; parsing beyond identity is left to the consumer.
    pub(crate) edid: Vec<u8>,
    pub(crate) needs_frame: bool,
}

impl Output {
    pub(crate) fn new(id: OutputId, name: String) -> Self {
        Self {
            id,
            name,
            state: OutputState::default(),
            modes: Vec::new(),
            physical_size_mm: (0, 0),
            subpixel: Subpixel::Unknown,
            make: None,
            model: None,
            serial: None,
            description: String::new(),
            non_desktop: false,
            vrr_capable: false,
            max_bpc: None,
            edid: Vec::new(),
            needs_frame: false,
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    /// Connector name, e.g. `DP-1`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn modes(&self) -> &[OutputMode] {
        &self.modes
    }

    pub fn current_mode(&self) -> Option<OutputMode> {
        self.state.mode().or(self.state.custom_mode())
    }

    pub fn preferred_mode(&self) -> Option<OutputMode> {
        self.modes.iter().copied().find(|m| m.preferred)
    }

    /// Physical size in millimeters, `(0, 0)` when unknown.
    pub fn physical_size_mm(&self) -> (u32, u32) {
        self.physical_size_mm
    }

    pub fn subpixel(&self) -> Subpixel {
        self.subpixel
    }

    pub fn make(&self) -> Option<&str> {
        self.make.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Displays such as VR headsets that are not meant for desktop use.
    pub fn non_desktop(&self) -> bool {
        self.non_desktop
    }

    pub fn vrr_capable(&self) -> bool {
        self.vrr_capable
    }

    pub fn max_bpc_bounds(&self) -> Option<(u64, u64)> {
        self.max_bpc
    }

    pub fn edid(&self) -> &[u8] {
        &self.edid
    }

    /// Whether the consumer should render and commit a new frame.
    pub fn needs_frame(&self) -> bool {
        self.needs_frame
    }
}

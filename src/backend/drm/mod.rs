//! DRM/KMS backend.
//!
//! This module uses a flat-ownership layout:
//! - `DrmBackend` owns the GPU handle and the three resource tables
//!   (CRTCs, planes, connectors); records reference each other by table
//!   index, never by strong link.
//! - `connector.rs` owns the connect/disconnect lifecycle and the output
//!   facade, `plane.rs` the format negotiation, `fb.rs` the DMA-BUF
//!   import, `commit.rs` the commit engine and `legacy.rs` the low-level
//!   commit execution.
//!
//! The host drives the backend: it registers [`DrmBackend::poll_fd`] with
//! its event loop, calls [`DrmBackend::dispatch_events`] when readable and
//! forwards session/udev signals through the `notify_*` methods.

mod commit;
mod connector;
mod fb;
mod helpers;
mod legacy;
mod plane;
mod types;

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use drm::control::{self, connector as drm_connector, crtc, Device as ControlDevice, PageFlipFlags, PlaneType};
use drm::{ClientCapability, Device, DriverCapability};
use tracing::{debug, error, info, trace, warn};

use crate::backend::BackendEvent;
use crate::buffer::Buffer;
use crate::format::DrmFormat;
use crate::output::{Output, OutputId, PresentEvent, PresentFlags};
use crate::session::{DrmDeviceFd, Session};

pub use types::DrmCaps;

use connector::{Connector, ConnectorProbe};
use legacy::{KmsImpl, LegacyImpl};
use plane::{assign_plane_roles, Plane};
use types::{CommitData, Crtc, CrtcProps, FlipState};

const SESSION_ACTIVATE_TIMEOUT: Duration = Duration::from_secs(5);
const SESSION_ACTIVATE_POLL: Duration = Duration::from_millis(250);

/// The possible-crtcs bitmasks are 32-bit; more CRTCs cannot be modelled.
const MAX_CRTCS: usize = 32;

/// Work queued to run after event dispatch, outside any handler.
enum IdleTask {
    Frame(OutputId),
}

/// DRM/KMS backend for one GPU.
pub struct DrmBackend {
    device: DrmDeviceFd,
    driver_name: String,
    caps: DrmCaps,
    crtcs: Vec<Crtc>,
    planes: Vec<Plane>,
    connectors: Vec<Connector>,
    imp: Box<dyn KmsImpl>,
    session_active: bool,
    ready: bool,
    gpu_removed: bool,
    events: VecDeque<BackendEvent>,
    idle: VecDeque<IdleTask>,
}

impl DrmBackend {
    /// Discover, open and initialise the first suitable GPU.
    ///
    /// Fatal conditions (no active session, no GPUs, missing required
    /// device capabilities, resource query failures) surface as errors.
    pub fn attempt(session: &mut dyn Session) -> Result<Self> {
        wait_for_session_activation(session)?;

        let mut gpus = scan_gpus(session)?;
        ensure!(!gpus.is_empty(), "found no GPUs to use");
        debug!("found {} GPUs", gpus.len());

        // Multi-GPU setups are not aggregated; the boot-VGA-preferred
        // device wins and the rest are ignored.
        let device = gpus.remove(0);

        let driver = device.get_driver().context("error getting the driver")?;
        let driver_name = driver.name().to_string_lossy().into_owned();
        info!(
            "starting backend for {:?} with driver {driver_name}",
            device.path()
        );

        let caps = query_caps(&device)?;
        let (crtcs, planes) = init_resources(&device, &caps)?;

        let mut backend = Self {
            device,
            driver_name,
            caps,
            crtcs,
            planes,
            connectors: Vec::new(),
            imp: Box::new(LegacyImpl),
            session_active: true,
            ready: false,
            gpu_removed: false,
            events: VecDeque::new(),
            idle: VecDeque::new(),
        };

        backend.scan_connectors();

        Ok(backend)
    }

    /// The GPU fd to register with the host's event loop; call
    /// [`dispatch_events`](Self::dispatch_events) when it turns readable.
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }

    /// Drain kernel events and run queued idle work. Failures are logged;
    /// the loop must go on.
    pub fn dispatch_events(&mut self) {
        match self.device.receive_events() {
            Ok(events) => {
                for event in events {
                    if let control::Event::PageFlip(flip) = event {
                        self.page_flipped(flip.crtc, flip.frame, flip.duration);
                    }
                }
            }
            Err(err) => {
                error!(
                    "failed to handle events on {:?}: {err:?}",
                    self.device.path()
                );
            }
        }

        // Idle callbacks run FIFO once the kernel events are drained, so
        // a frame never nests inside a flip handler.
        while let Some(task) = self.idle.pop_front() {
            match task {
                IdleTask::Frame(id) => {
                    let alive = self
                        .connector_index(id)
                        .is_some_and(|i| self.connectors[i].output.is_some());
                    if alive {
                        self.events.push_back(BackendEvent::Frame(id));
                    }
                }
            }
        }
    }

    /// Next queued notification, if any.
    pub fn poll_event(&mut self) -> Option<BackendEvent> {
        self.events.pop_front()
    }

    /// Forwarded by the host from the device's udev change event.
    pub fn notify_hotplug(&mut self) {
        debug!("got a hotplug event for {:?}", self.device.path());
        self.scan_connectors();
    }

    /// Forwarded by the host from the session's activity signal. Regaining
    /// the VT rescans connectors and reasserts every lit output's mode.
    pub fn notify_session_active(&mut self, active: bool) {
        self.session_active = active;
        if active {
            self.restore_after_vt();
        }
    }

    /// The session reported the GPU gone. There is no recovery: every
    /// output dies and all further commits are refused.
    pub fn notify_gpu_removed(&mut self) {
        error!(
            "GPU {:?} was removed; refusing all further commits",
            self.device.path()
        );
        self.gpu_removed = true;

        for idx in 0..self.connectors.len() {
            self.connector_disconnected(idx);
            self.connectors[idx].status = drm_connector::State::Disconnected;
        }
    }

    /// The consumer's allocator became available: flag every connected
    /// output and announce it so swapchains can be created.
    pub fn on_ready(&mut self) {
        self.ready = true;

        let mut ids = Vec::new();
        for conn in &mut self.connectors {
            if let Some(output) = &mut conn.output {
                debug!("ready: announcing output {}", output.name());
                output.needs_frame = true;
                ids.push(output.id());
            }
        }

        for id in ids {
            self.events.push_back(BackendEvent::NewOutput(id));
        }
    }

    /// Scanout formats of the first primary plane; what renderers should
    /// target for main framebuffers.
    pub fn render_formats(&self) -> Vec<DrmFormat> {
        self.planes
            .iter()
            .find(|p| p.kind == PlaneType::Primary)
            .map(|p| p.formats.clone())
            .unwrap_or_default()
    }

    /// Scanout formats of the first cursor plane.
    pub fn cursor_formats(&self) -> Vec<DrmFormat> {
        self.planes
            .iter()
            .find(|p| p.kind == PlaneType::Cursor)
            .map(|p| p.formats.clone())
            .unwrap_or_default()
    }

    pub fn caps(&self) -> DrmCaps {
        self.caps
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn max_cursor_size(&self) -> (u32, u32) {
        self.caps.cursor_size
    }

    /// Cursor planes are not driven yet; commits reserve the slots.
    pub fn set_cursor(
        &mut self,
        _output: OutputId,
        _buffer: Option<Rc<dyn Buffer>>,
        _hotspot: (i32, i32),
    ) -> bool {
        false
    }

    /// Cursor planes are not driven yet.
    pub fn move_cursor(&mut self, _output: OutputId, _position: (i32, i32)) {}

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.connectors.iter().filter_map(|c| c.output.as_ref())
    }

    pub fn output(&self, id: OutputId) -> Option<&Output> {
        self.connectors
            .iter()
            .find_map(|c| c.output.as_ref().filter(|o| o.id() == id))
    }

    pub fn output_mut(&mut self, id: OutputId) -> Option<&mut Output> {
        self.connectors
            .iter_mut()
            .find_map(|c| c.output.as_mut().filter(|o| o.id() == id))
    }

    /// Ask for a frame event once dispatch goes idle. Dropped when a page
    /// flip is still in flight; its completion requests the frame instead.
    pub fn schedule_frame(&mut self, id: OutputId) {
        let Some(idx) = self.connector_index(id) else {
            return;
        };
        if self.connectors[idx].flip_state == FlipState::FlipPending {
            return;
        }
        self.idle.push_back(IdleTask::Frame(id));
    }

    fn scan_connectors(&mut self) {
        debug!("scanning connectors for {:?}", self.device.path());

        let resources = match self.device.resource_handles() {
            Ok(resources) => resources,
            Err(err) => {
                error!(
                    "error scanning connectors for {:?}: {err:?}",
                    self.device.path()
                );
                return;
            }
        };

        for &handle in resources.connectors() {
            trace!("scanning connector {handle:?}");

            let info = match self.device.get_connector(handle, true) {
                Ok(info) => info,
                Err(err) => {
                    error!("failed to get connector {handle:?}: {err:?}");
                    continue;
                }
            };

            let idx = match self.connectors.iter().position(|c| c.handle == handle) {
                Some(idx) => idx,
                None => {
                    debug!("initializing connector {handle:?}");
                    match Connector::query(&self.device, &info, &resources, &self.crtcs) {
                        Ok(conn) => {
                            self.connectors.push(conn);
                            self.connectors.len() - 1
                        }
                        Err(err) => {
                            error!("connector {handle:?} failed initializing: {err:?}");
                            continue;
                        }
                    }
                }
            };

            let was = self.connectors[idx].status;
            let now = info.state();

            if was == drm_connector::State::Disconnected && now == drm_connector::State::Connected
            {
                debug!("connector {} connected", self.connectors[idx].name);
                self.connector_connected(idx, &info);
            } else if was == drm_connector::State::Connected
                && now == drm_connector::State::Disconnected
            {
                debug!("connector {} disconnected", self.connectors[idx].name);
                self.connector_disconnected(idx);
            }
        }
    }

    fn connector_connected(&mut self, idx: usize, info: &drm_connector::Info) {
        let handle = self.connectors[idx].handle;
        let crtc_idx = self.connectors[idx].crtc;

        let current_mode =
            crtc_idx.and_then(|ci| helpers::current_crtc_mode(&self.device, &self.crtcs[ci]));

        // Adaptive sync needs both the connector capability and a
        // VRR_ENABLED control on the CRTC.
        let vrr_capable = crtc_idx.is_some_and(|ci| self.crtcs[ci].props.vrr_enabled.is_some())
            && helpers::is_vrr_capable(&self.device, handle).unwrap_or(false);

        let max_bpc = helpers::find_drm_property(&self.device, handle, "max bpc")
            .and_then(|(_, info, _)| helpers::prop_range_bounds(&info));

        let edid = helpers::connector_edid(&self.device, handle);
        let (make, model, serial) = helpers::edid_identity(&edid);

        let probe = ConnectorProbe {
            modes: info.modes(),
            current_mode,
            physical_size_mm: info.size().unwrap_or((0, 0)),
            subpixel: info.subpixel().into(),
            non_desktop: helpers::is_non_desktop(&self.device, handle),
            vrr_capable,
            max_bpc,
            edid,
            make,
            model,
            serial,
        };

        let id = OutputId(u32::from(handle));
        let crtc = crtc_idx.map(|ci| &mut self.crtcs[ci]);
        let newly = self.connectors[idx].connect(id, probe, crtc);

        if newly && self.ready {
            self.events.push_back(BackendEvent::NewOutput(id));
            self.schedule_frame(id);
        }
    }

    fn connector_disconnected(&mut self, idx: usize) {
        if let Some(output) = self.connectors[idx].disconnect() {
            self.events.push_back(BackendEvent::OutputDestroyed {
                output: output.id(),
                name: output.name().to_owned(),
            });
        }
    }

    fn restore_after_vt(&mut self) {
        debug!("restoring after VT switch");

        // Hotplug state may have changed while the session was away.
        self.scan_connectors();

        for idx in 0..self.connectors.len() {
            let Some(ci) = self.connectors[idx].crtc else {
                continue;
            };

            debug!("resetting crtc {:?}", self.crtcs[ci].handle);
            if let Err(err) = self.imp.reset(&self.device, &self.crtcs[ci]) {
                error!("crtc {:?} failed reset: {err:?}", self.crtcs[ci].handle);
            }
        }

        for idx in 0..self.connectors.len() {
            let Some(ci) = self.connectors[idx].crtc else {
                continue;
            };
            let Some(output) = &self.connectors[idx].output else {
                continue;
            };

            let mode_info = output.current_mode().map(|m| {
                m.info.unwrap_or_else(|| {
                    helpers::calculate_mode_cvt(m.pixel_size.0, m.pixel_size.1, m.refresh_millihz)
                })
            });

            let data = CommitData {
                main_fb: None,
                cursor_fb: None,
                mode_info,
                flags: PageFlipFlags::empty(),
                modeset: true,
                blocking: true,
                test: false,
                enable: output.state.enabled(),
                vrr: None,
            };

            if let Some(info) = &data.mode_info {
                debug!(
                    "restoring crtc {:?} with clock {} size {:?} vrefresh {}",
                    self.crtcs[ci].handle,
                    info.clock(),
                    info.size(),
                    info.vrefresh(),
                );
            }

            if let Err(err) =
                self.imp
                    .commit(&self.device, &self.connectors[idx], &self.crtcs[ci], &data)
            {
                error!("crtc {:?} failed restore: {err:?}", self.crtcs[ci].handle);
            }
        }
    }

    fn page_flipped(&mut self, crtc: crtc::Handle, seq: u32, when: Duration) {
        trace!("page-flip event seq {seq} crtc {crtc:?}");

        let Some(ci) = self.crtcs.iter().position(|c| c.handle == crtc) else {
            return;
        };
        let Some(idx) = self
            .connectors
            .iter()
            .position(|c| c.crtc == Some(ci) && c.flip_state == FlipState::FlipPending)
        else {
            return;
        };

        self.connectors[idx].flip_state = FlipState::Idle;

        if self.connectors[idx].status != drm_connector::State::Connected
            || self.connectors[idx].crtc.is_none()
        {
            debug!("ignoring a page-flip event from a disabled crtc/connector");
            return;
        }

        self.connectors[idx].on_present();

        let id = OutputId(u32::from(self.connectors[idx].handle));
        let refresh = self.crtcs[ci].refresh_millihz;

        self.events.push_back(BackendEvent::Present {
            output: id,
            info: PresentEvent {
                presented: self.session_active,
                when,
                seq,
                refresh_ns: helpers::refresh_interval_ns(refresh),
                flags: PresentFlags::VSYNC
                    | PresentFlags::HW_CLOCK
                    | PresentFlags::HW_COMPLETION
                    | PresentFlags::ZEROCOPY,
            },
        });

        if self.session_active {
            self.events.push_back(BackendEvent::Frame(id));
        }
    }

    fn connector_index(&self, id: OutputId) -> Option<usize> {
        self.connectors
            .iter()
            .position(|c| u32::from(c.handle) == id.0)
    }
}

fn wait_for_session_activation(session: &mut dyn Session) -> Result<()> {
    if session.is_active() {
        return Ok(());
    }

    debug!("session is not active, waiting up to 5 s");
    let started = Instant::now();

    loop {
        std::thread::sleep(SESSION_ACTIVATE_POLL);
        if let Err(err) = session.dispatch_pending_events() {
            warn!("error dispatching session events: {err:?}");
        }

        if session.is_active() {
            return Ok(());
        }

        if started.elapsed() >= SESSION_ACTIVATE_TIMEOUT {
            bail!("session could not be activated in time");
        }
    }
}

struct GpuCandidate {
    seat: String,
    boot_vga: bool,
    devnode: PathBuf,
}

/// Filter candidates to the configured seat and put boot-VGA devices at
/// the front.
fn order_candidates(candidates: Vec<GpuCandidate>, seat: &str) -> Vec<PathBuf> {
    let mut ordered = VecDeque::new();

    for candidate in candidates {
        if !seat.is_empty() && candidate.seat != seat {
            debug!(
                "skipping {:?} because seat {} doesn't match ours",
                candidate.devnode, candidate.seat
            );
            continue;
        }

        if candidate.boot_vga {
            ordered.push_front(candidate.devnode);
        } else {
            ordered.push_back(candidate.devnode);
        }
    }

    ordered.into()
}

fn scan_gpus(session: &mut dyn Session) -> Result<Vec<DrmDeviceFd>> {
    let mut enumerator = udev::Enumerator::new().context("error creating a udev enumerator")?;
    enumerator
        .match_subsystem("drm")
        .context("error matching the drm subsystem")?;
    enumerator
        .match_sysname("card[0-9]*")
        .context("error matching the card sysname")?;

    let mut candidates = Vec::new();
    for device in enumerator
        .scan_devices()
        .context("error enumerating GPUs with udev")?
    {
        let Some(devnode) = device.devnode() else {
            debug!("skipping {:?}, no device node", device.syspath());
            continue;
        };

        debug!("enumerated device {devnode:?}");

        // An absent seat assignment means seat0.
        let seat = device
            .property_value("ID_SEAT")
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_else(|| "seat0".to_owned());

        let boot_vga = device
            .parent_with_subsystem("pci")
            .ok()
            .flatten()
            .and_then(|pci| pci.attribute_value("boot_vga").map(|v| v.to_str() == Some("1")))
            .unwrap_or(false);

        candidates.push(GpuCandidate {
            seat,
            boot_vga,
            devnode: devnode.to_owned(),
        });
    }

    let mut gpus = Vec::new();
    for path in order_candidates(candidates, session.seat_name()) {
        let fd = match session.open(&path) {
            Ok(fd) => fd,
            Err(err) => {
                warn!("skipping device {path:?}: {err:?}");
                continue;
            }
        };

        let device = DrmDeviceFd::new(fd, path.clone());

        // Render-only nodes carry no mode resources.
        if device.resource_handles().is_err() {
            debug!("skipping device {path:?}, not a KMS device");
            continue;
        }

        gpus.push(device);
    }

    Ok(gpus)
}

fn query_caps(device: &DrmDeviceFd) -> Result<DrmCaps> {
    let cursor_w = device
        .get_driver_capability(DriverCapability::CursorWidth)
        .unwrap_or(64);
    let cursor_h = device
        .get_driver_capability(DriverCapability::CursorHeight)
        .unwrap_or(64);

    let prime = device
        .get_driver_capability(DriverCapability::Prime)
        .unwrap_or(0);
    ensure!(
        prime & u64::from(drm_ffi::DRM_PRIME_CAP_IMPORT) != 0,
        "PRIME import is unsupported"
    );

    ensure!(
        device
            .get_driver_capability(DriverCapability::CrtcInVBlankEvent)
            .is_ok_and(|v| v != 0),
        "CRTC_IN_VBLANK_EVENT is unsupported"
    );

    ensure!(
        device
            .get_driver_capability(DriverCapability::MonotonicTimestamp)
            .is_ok_and(|v| v != 0),
        "monotonic timestamps are unsupported"
    );

    device
        .set_client_capability(ClientCapability::UniversalPlanes, true)
        .context("universal planes are unsupported")?;

    let supports_async_commit = device
        .get_driver_capability(DriverCapability::ASyncPageFlip)
        .is_ok_and(|v| v == 1);
    let supports_addfb2_modifiers = device
        .get_driver_capability(DriverCapability::AddFB2Modifiers)
        .is_ok_and(|v| v == 1);

    debug!("supports async commit: {supports_async_commit}");
    debug!("supports AddFB2 modifiers: {supports_addfb2_modifiers}");

    Ok(DrmCaps {
        cursor_size: (cursor_w as u32, cursor_h as u32),
        supports_async_commit,
        supports_addfb2_modifiers,
    })
}

fn crtc_props(device: &DrmDeviceFd, handle: crtc::Handle) -> Result<CrtcProps> {
    let props = device
        .get_properties(handle)
        .context("error getting crtc properties")?;

    let mut out = CrtcProps::default();
    for (prop, _) in props {
        let info = device.get_property(prop).context("error getting property")?;
        let Ok(name) = info.name().to_str() else {
            continue;
        };

        match name {
            "MODE_ID" => out.mode_id = Some(prop),
            "VRR_ENABLED" => out.vrr_enabled = Some(prop),
            _ => (),
        }
    }

    Ok(out)
}

fn init_resources(device: &DrmDeviceFd, caps: &DrmCaps) -> Result<(Vec<Crtc>, Vec<Plane>)> {
    let resources = device
        .resource_handles()
        .context("error getting mode resources")?;

    debug!("found {} CRTCs", resources.crtcs().len());
    ensure!(
        resources.crtcs().len() <= MAX_CRTCS,
        "cannot support more than {MAX_CRTCS} CRTCs"
    );

    let mut crtcs = Vec::new();
    for &handle in resources.crtcs() {
        let info = device
            .get_crtc(handle)
            .with_context(|| format!("error getting crtc {handle:?}"))?;
        let props = crtc_props(device, handle)
            .with_context(|| format!("error getting properties of crtc {handle:?}"))?;

        crtcs.push(Crtc {
            handle,
            props,
            gamma_size: info.gamma_length(),
            primary: None,
            cursor: None,
            refresh_millihz: 0,
        });
    }

    let plane_handles = device
        .plane_handles()
        .context("error getting plane handles")?;
    debug!("found {} planes", plane_handles.len());

    let mut planes = Vec::new();
    for handle in plane_handles {
        planes.push(Plane::query(
            device,
            handle,
            &resources,
            caps.supports_addfb2_modifiers,
        )?);
    }

    let kinds: Vec<_> = planes.iter().map(|p| (p.kind, p.possible_crtcs)).collect();
    for (pi, ci) in assign_plane_roles(&kinds, crtcs.len()) {
        match planes[pi].kind {
            PlaneType::Primary => crtcs[ci].primary = Some(pi),
            PlaneType::Cursor => crtcs[ci].cursor = Some(pi),
            PlaneType::Overlay => (),
        }
        planes[pi].crtc = Some(ci);
    }

    Ok((crtcs, planes))
}

#[cfg(test)]
impl DrmBackend {
    pub(super) fn test_harness() -> Self {
        let fd = std::fs::File::open("/dev/null").unwrap();
        Self {
            device: DrmDeviceFd::new(fd.into(), PathBuf::from("/dev/null")),
            driver_name: "test".to_owned(),
            caps: DrmCaps {
                cursor_size: (64, 64),
                supports_async_commit: true,
                supports_addfb2_modifiers: true,
            },
            crtcs: Vec::new(),
            planes: Vec::new(),
            connectors: Vec::new(),
            imp: Box::new(LegacyImpl),
            session_active: true,
            ready: true,
            gpu_removed: false,
            events: VecDeque::new(),
            idle: VecDeque::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(devnode: &str, seat: &str, boot_vga: bool) -> GpuCandidate {
        GpuCandidate {
            seat: seat.to_owned(),
            boot_vga,
            devnode: PathBuf::from(devnode),
        }
    }

    #[test]
    fn boot_vga_device_goes_first() {
        let ordered = order_candidates(
            vec![
                candidate("/dev/dri/card0", "seat0", false),
                candidate("/dev/dri/card1", "seat0", true),
                candidate("/dev/dri/card2", "seat0", false),
            ],
            "seat0",
        );

        assert_eq!(
            ordered,
            vec![
                PathBuf::from("/dev/dri/card1"),
                PathBuf::from("/dev/dri/card0"),
                PathBuf::from("/dev/dri/card2"),
            ],
        );
    }

    #[test]
    fn foreign_seats_are_filtered() {
        let ordered = order_candidates(
            vec![
                candidate("/dev/dri/card0", "seat1", true),
                candidate("/dev/dri/card1", "seat0", false),
            ],
            "seat0",
        );

        assert_eq!(ordered, vec![PathBuf::from("/dev/dri/card1")]);
    }
}

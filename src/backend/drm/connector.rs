//! Connector lifecycle.
//!
//! Connector records are created on first scan and persist for the
//! backend's lifetime; the consumer-facing output facade is created on
//! connect and destroyed on disconnect.

use std::rc::Rc;

use anyhow::Context;
use drm::control::{self, connector, Device as ControlDevice, ModeFlags, ModeTypeFlags, ResourceHandles};
use tracing::{debug, error};

use crate::output::{Output, OutputId, OutputMode, Subpixel};
use crate::session::DrmDeviceFd;

use super::fb::DrmFramebuffer;
use super::helpers::{calculate_refresh_millihz, connector_current_crtc, modes_equal};
use super::types::{Crtc, FlipState};

/// A physical or virtual display output of the GPU.
pub(super) struct Connector {
    pub handle: connector::Handle,
    /// Stable name, e.g. `DP-1`.
    pub name: String,
    pub status: connector::State,
    /// Bitmask over the backend's CRTC table indices.
    #[allow(dead_code)]
    pub possible_crtcs: u32,
    /// CRTC currently driving this connector (backend CRTC table index).
    pub crtc: Option<usize>,
    /// Second mode in the kernel's list; the safety net when mode
    /// negotiation falls through.
    pub fallback_mode: Option<control::Mode>,
    pub vrr_capable: bool,
    pub flip_state: FlipState,
    /// Reserved for the cursor plane; cleared whenever a commit applies.
    pub pending_cursor_fb: Option<Rc<DrmFramebuffer>>,
    pub output: Option<Output>,
}

/// Kernel-independent snapshot of everything `connect` needs. Built from
/// ioctls by the backend, or by hand in tests.
pub(super) struct ConnectorProbe<'a> {
    pub modes: &'a [control::Mode],
    pub current_mode: Option<control::Mode>,
    pub physical_size_mm: (u32, u32),
    pub subpixel: Subpixel,
    pub non_desktop: bool,
    pub vrr_capable: bool,
    pub max_bpc: Option<(u64, u64)>,
    pub edid: Vec<u8>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

pub(super) fn format_connector_name(connector: &connector::Info) -> String {
    format!("{}-{}", connector.interface().as_str(), connector.interface_id())
}

impl Connector {
    /// Initialise a record for a connector seen for the first time.
    pub fn query(
        device: &DrmDeviceFd,
        info: &connector::Info,
        resources: &ResourceHandles,
        crtcs: &[Crtc],
    ) -> anyhow::Result<Self> {
        // Connectors whose properties cannot be read are skipped entirely.
        device
            .get_properties(info.handle())
            .context("error getting connector properties")?;

        let name = format_connector_name(info);

        let mut possible_crtcs = 0u32;
        for &encoder in info.encoders() {
            let Ok(encoder) = device.get_encoder(encoder) else {
                continue;
            };
            for handle in resources.filter_crtcs(encoder.possible_crtcs()) {
                if let Some(i) = crtcs.iter().position(|c| c.handle == handle) {
                    possible_crtcs |= 1 << i;
                }
            }
        }
        if possible_crtcs == 0 {
            error!("no CRTCs possible for connector {name}");
        }

        // Prefer the CRTC_ID property; older drivers only report the
        // routing through the current encoder.
        let current = connector_current_crtc(device, info.handle()).or_else(|| {
            let encoder = device.get_encoder(info.current_encoder()?).ok()?;
            encoder.crtc()
        });
        let crtc = current.and_then(|h| crtcs.iter().position(|c| c.handle == h));
        if let (Some(handle), None) = (current, crtc) {
            error!("failed to find a CRTC with id {:?}", handle);
        }

        Ok(Self {
            handle: info.handle(),
            name,
            status: connector::State::Disconnected,
            possible_crtcs,
            crtc,
            fallback_mode: None,
            vrr_capable: false,
            flip_state: FlipState::Idle,
            pending_cursor_fb: None,
            output: None,
        })
    }

    /// Build the output facade for a freshly connected connector.
    ///
    /// Idempotent: returns false when an output already exists.
    pub fn connect(
        &mut self,
        id: OutputId,
        probe: ConnectorProbe<'_>,
        mut crtc: Option<&mut Crtc>,
    ) -> bool {
        if self.output.is_some() {
            debug!(
                "not connecting connector {} because it's already connected",
                self.name
            );
            return false;
        }

        debug!(
            "connecting connector {}, CRTC id {:?}",
            self.name,
            crtc.as_ref().map(|c| c.handle)
        );

        let mut output = Output::new(id, self.name.clone());

        for (i, mode) in probe.modes.iter().enumerate() {
            if mode.flags().contains(ModeFlags::INTERLACE) {
                debug!("skipping mode {i} because it's interlaced");
                continue;
            }

            if i == 1 {
                self.fallback_mode = Some(*mode);
            }

            let out_mode = OutputMode {
                pixel_size: mode.size(),
                refresh_millihz: calculate_refresh_millihz(mode),
                preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
                info: Some(*mode),
            };

            if probe
                .current_mode
                .as_ref()
                .is_some_and(|current| modes_equal(mode, current))
            {
                output.state.set_mode(out_mode);
                if let Some(crtc) = crtc.as_deref_mut() {
                    crtc.refresh_millihz = out_mode.refresh_millihz;
                }
            }

            debug!(
                "mode {i}: {}x{}@{:.2}Hz{}",
                out_mode.pixel_size.0,
                out_mode.pixel_size.1,
                out_mode.refresh_millihz as f64 / 1000.0,
                if out_mode.preferred { " (preferred)" } else { "" },
            );

            output.modes.push(out_mode);
        }

        output.physical_size_mm = probe.physical_size_mm;
        debug!("physical size {:?} (mm)", output.physical_size_mm);

        output.subpixel = probe.subpixel;

        if probe.non_desktop {
            debug!("non-desktop connector");
        }
        output.non_desktop = probe.non_desktop;

        self.vrr_capable = probe.vrr_capable;
        output.vrr_capable = probe.vrr_capable;
        output.max_bpc = probe.max_bpc;

        output.description = format!(
            "{} {} {} ({})",
            probe.make.as_deref().unwrap_or("Unknown"),
            probe.model.as_deref().unwrap_or("Unknown"),
            probe.serial.as_deref().unwrap_or("Unknown"),
            self.name,
        );
        debug!("description: {}", output.description);

        output.make = probe.make;
        output.model = probe.model;
        output.serial = probe.serial;
        output.edid = probe.edid;
        output.needs_frame = true;

        self.status = connector::State::Connected;
        self.output = Some(output);
        true
    }

    /// Tear down the output facade. The connector record itself persists.
    ///
    /// Idempotent: returns the destroyed output, or `None` when there was
    /// nothing to disconnect.
    pub fn disconnect(&mut self) -> Option<Output> {
        let Some(output) = self.output.take() else {
            debug!(
                "not disconnecting connector {} because it's already disconnected",
                self.name
            );
            return None;
        };

        self.status = connector::State::Disconnected;
        Some(output)
    }

    /// Completion hook invoked for every page-flip event, before the
    /// present notification goes out.
    pub fn on_present(&mut self) {}
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use drm_ffi::drm_mode_modeinfo;

    use super::*;

    fn test_connector() -> Connector {
        Connector {
            handle: connector::Handle::from(NonZeroU32::new(33).unwrap()),
            name: "DP-1".to_owned(),
            status: connector::State::Disconnected,
            possible_crtcs: 0b1,
            crtc: Some(0),
            fallback_mode: None,
            vrr_capable: false,
            flip_state: FlipState::Idle,
            pending_cursor_fb: None,
            output: None,
        }
    }

    fn test_mode(width: u16, height: u16, clock: u32, flags: u32) -> control::Mode {
        control::Mode::from(drm_mode_modeinfo {
            clock,
            hdisplay: width,
            hsync_start: width + 88,
            hsync_end: width + 132,
            htotal: width + 280,
            hskew: 0,
            vdisplay: height,
            vsync_start: height + 4,
            vsync_end: height + 9,
            vtotal: height + 45,
            vscan: 0,
            vrefresh: 60,
            flags,
            type_: drm_ffi::DRM_MODE_TYPE_PREFERRED,
            name: [0; 32],
        })
    }

    fn test_probe<'a>(modes: &'a [control::Mode], current: Option<control::Mode>) -> ConnectorProbe<'a> {
        ConnectorProbe {
            modes,
            current_mode: current,
            physical_size_mm: (600, 340),
            subpixel: Subpixel::HorizontalRgb,
            non_desktop: false,
            vrr_capable: true,
            max_bpc: Some((6, 12)),
            edid: Vec::new(),
            make: Some("Test".to_owned()),
            model: Some("Panel".to_owned()),
            serial: None,
        }
    }

    #[test]
    fn connect_skips_interlaced_and_records_fallback() {
        let modes = [
            test_mode(1920, 1080, 148500, 0),
            test_mode(1280, 720, 74250, 0),
            test_mode(1920, 1080, 74250, drm_ffi::DRM_MODE_FLAG_INTERLACE),
        ];

        let mut conn = test_connector();
        assert!(conn.connect(OutputId(33), test_probe(&modes, None), None));

        let output = conn.output.as_ref().unwrap();
        assert_eq!(output.modes().len(), 2);
        assert!(modes_equal(&conn.fallback_mode.unwrap(), &modes[1]));
        assert_eq!(conn.status, connector::State::Connected);
        assert!(output.needs_frame());
        assert!(output.vrr_capable());
        assert_eq!(output.max_bpc_bounds(), Some((6, 12)));
        assert_eq!(output.description(), "Test Panel Unknown (DP-1)");
    }

    #[test]
    fn connect_adopts_the_current_mode() {
        let modes = [
            test_mode(1920, 1080, 148500, 0),
            test_mode(1280, 720, 74250, 0),
        ];

        let mut crtc = Crtc {
            handle: drm::control::crtc::Handle::from(NonZeroU32::new(1).unwrap()),
            props: Default::default(),
            gamma_size: 256,
            primary: None,
            cursor: None,
            refresh_millihz: 0,
        };

        let mut conn = test_connector();
        conn.connect(
            OutputId(33),
            test_probe(&modes, Some(modes[1])),
            Some(&mut crtc),
        );

        let output = conn.output.as_ref().unwrap();
        let mode = output.state.mode().unwrap();
        assert_eq!(mode.pixel_size, (1280, 720));
        assert_eq!(crtc.refresh_millihz, mode.refresh_millihz);
    }

    #[test]
    fn connect_twice_is_a_noop() {
        let modes = [test_mode(1920, 1080, 148500, 0)];

        let mut conn = test_connector();
        assert!(conn.connect(OutputId(33), test_probe(&modes, None), None));
        assert!(!conn.connect(OutputId(33), test_probe(&modes, None), None));
        assert_eq!(conn.output.as_ref().unwrap().modes().len(), 1);
    }

    #[test]
    fn disconnect_twice_yields_one_output() {
        let modes = [test_mode(1920, 1080, 148500, 0)];

        let mut conn = test_connector();
        conn.connect(OutputId(33), test_probe(&modes, None), None);

        assert!(conn.disconnect().is_some());
        assert_eq!(conn.status, connector::State::Disconnected);
        assert!(conn.disconnect().is_none());
    }
}

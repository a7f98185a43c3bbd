//! Pure helper functions for the DRM backend.
//!
//! Stateless property lookups and mode computations. Everything that
//! touches the kernel goes through the device handle passed in; the mode
//! math at the bottom is fully deterministic and covered by tests.

use std::iter::zip;

use drm::control::{self, connector, crtc, property, Device as ControlDevice, ModeFlags, ResourceHandle};
use drm_ffi::drm_mode_modeinfo;
use tracing::warn;

use crate::session::DrmDeviceFd;

use super::types::Crtc;

// =============================================================================
// DRM Property Helpers
// =============================================================================

/// Find a DRM property by name.
pub(super) fn find_drm_property(
    device: &DrmDeviceFd,
    resource: impl ResourceHandle,
    name: &str,
) -> Option<(property::Handle, property::Info, property::RawValue)> {
    let props = match device.get_properties(resource) {
        Ok(props) => props,
        Err(err) => {
            warn!("error getting properties: {err:?}");
            return None;
        }
    };

    props.into_iter().find_map(|(handle, value)| {
        let info = device.get_property(handle).ok()?;
        let n = info.name().to_str().ok()?;

        (n == name).then_some((handle, info, value))
    })
}

/// Get a DRM property value by handle.
pub(super) fn get_drm_property(
    device: &DrmDeviceFd,
    resource: impl ResourceHandle,
    prop: property::Handle,
) -> Option<property::RawValue> {
    let props = match device.get_properties(resource) {
        Ok(props) => props,
        Err(err) => {
            warn!("error getting properties: {err:?}");
            return None;
        }
    };

    props
        .into_iter()
        .find_map(|(handle, value)| (handle == prop).then_some(value))
}

/// Bounds of a range property, e.g. the connector's "max bpc".
pub(super) fn prop_range_bounds(info: &property::Info) -> Option<(u64, u64)> {
    match info.value_type() {
        property::ValueType::UnsignedRange(min, max) => Some((min, max)),
        _ => None,
    }
}

/// Check if a connector advertises VRR support.
pub(super) fn is_vrr_capable(device: &DrmDeviceFd, connector: connector::Handle) -> Option<bool> {
    let (_, info, value) = find_drm_property(device, connector, "vrr_capable")?;
    info.value_type().convert_value(value).as_boolean()
}

/// Check the connector's "non-desktop" flag (VR headsets and the like).
pub(super) fn is_non_desktop(device: &DrmDeviceFd, connector: connector::Handle) -> bool {
    let Some((_, info, value)) = find_drm_property(device, connector, "non-desktop") else {
        return false;
    };
    info.value_type()
        .convert_value(value)
        .as_boolean()
        .unwrap_or(false)
}

/// The CRTC a connector is currently routed to according to its CRTC_ID
/// property, if the property exists and is set.
pub(super) fn connector_current_crtc(
    device: &DrmDeviceFd,
    connector: connector::Handle,
) -> Option<crtc::Handle> {
    let (_, info, value) = find_drm_property(device, connector, "CRTC_ID")?;
    match info.value_type().convert_value(value) {
        property::Value::CRTC(handle) => handle,
        _ => None,
    }
}

/// Read the connector's EDID blob. Empty when the connector has none.
pub(super) fn connector_edid(device: &DrmDeviceFd, connector: connector::Handle) -> Vec<u8> {
    let Some((_, info, value)) = find_drm_property(device, connector, "EDID") else {
        return Vec::new();
    };
    let Some(blob) = info.value_type().convert_value(value).as_blob() else {
        return Vec::new();
    };
    if blob == 0 {
        return Vec::new();
    }
    device.get_property_blob(blob).unwrap_or_default()
}

/// Extract make/model/serial from an EDID blob.
///
/// The blob itself stays opaque to the backend; identity extraction is
/// delegated to libdisplay-info.
pub(super) fn edid_identity(edid: &[u8]) -> (Option<String>, Option<String>, Option<String>) {
    if edid.is_empty() {
        return (None, None, None);
    }
    match libdisplay_info::info::Info::parse_edid(edid) {
        Ok(info) => (info.make(), info.model(), info.serial()),
        Err(err) => {
            warn!("error parsing EDID: {err:?}");
            (None, None, None)
        }
    }
}

/// The mode currently programmed on a CRTC.
///
/// Prefers the MODE_ID property blob; falls back to the mode reported by
/// the CRTC itself.
pub(super) fn current_crtc_mode(device: &DrmDeviceFd, crtc: &Crtc) -> Option<control::Mode> {
    if let Some(prop) = crtc.props.mode_id {
        let value = get_drm_property(device, crtc.handle, prop)?;
        if value == 0 {
            return None;
        }
        let data = device.get_property_blob(value).ok()?;
        return parse_mode_blob(&data);
    }

    device.get_crtc(crtc.handle).ok()?.mode()
}

/// Reinterpret a MODE_ID property blob as a mode timing block.
pub(super) fn parse_mode_blob(data: &[u8]) -> Option<control::Mode> {
    if data.len() < std::mem::size_of::<drm_mode_modeinfo>() {
        warn!("mode blob too short: {} bytes", data.len());
        return None;
    }

    let info = unsafe { (data.as_ptr() as *const drm_mode_modeinfo).read_unaligned() };
    Some(control::Mode::from(info))
}

// =============================================================================
// Mode Calculations
// =============================================================================

/// Vertical refresh rate of a mode in millihertz.
pub(super) fn calculate_refresh_millihz(mode: &control::Mode) -> i32 {
    let clock = mode.clock() as i64;
    let htotal = mode.hsync().2 as i64;
    let vtotal = mode.vsync().2 as i64;

    if htotal == 0 || vtotal == 0 {
        return 0;
    }

    let mut refresh = (clock * 1_000_000 / htotal + vtotal / 2) / vtotal;

    if mode.flags().contains(ModeFlags::INTERLACE) {
        refresh *= 2;
    }

    if mode.flags().contains(ModeFlags::DBLSCAN) {
        refresh /= 2;
    }

    if mode.vscan() > 1 {
        refresh /= mode.vscan() as i64;
    }

    refresh as i32
}

/// Nominal frame interval in nanoseconds for a refresh rate in mHz.
pub(super) fn refresh_interval_ns(refresh_millihz: i32) -> u32 {
    if refresh_millihz <= 0 {
        return 0;
    }
    (1_000_000_000_000i64 / refresh_millihz as i64) as u32
}

/// Timing-block equality; the kernel has no stable mode identity, so two
/// modes are the same when their timings agree.
pub(super) fn modes_equal(a: &control::Mode, b: &control::Mode) -> bool {
    a.clock() == b.clock()
        && a.size() == b.size()
        && a.hsync() == b.hsync()
        && a.vsync() == b.vsync()
        && a.vscan() == b.vscan()
        && a.vrefresh() == b.vrefresh()
        && a.flags() == b.flags()
}

/// Synthesise a timing block with CVT (reduced blanking off) for a mode
/// that carries none, e.g. a custom resolution requested by the consumer.
pub(crate) fn calculate_mode_cvt(width: u16, height: u16, refresh_millihz: i32) -> control::Mode {
    // Cross-checked with sway's implementation:
    // https://gitlab.freedesktop.org/wlroots/wlroots/-/blob/22528542970687720556035790212df8d9bb30bb/backend/drm/util.c#L251
    let refresh = if refresh_millihz > 0 {
        refresh_millihz as f64 / 1000.0
    } else {
        60.0
    };

    let options = libdisplay_info::cvt::Options {
        red_blank_ver: libdisplay_info::cvt::ReducedBlankingVersion::None,
        h_pixels: width as i32,
        v_lines: height as i32,
        ip_freq_rqd: refresh,

        // Defaults
        video_opt: false,
        vblank: 0f64,
        additional_hblank: 0,
        early_vsync_rqd: false,
        int_rqd: false,
        margins_rqd: false,
    };
    let timing = libdisplay_info::cvt::Timing::compute(options);

    let hsync_start = width + timing.h_front_porch as u16;
    let vsync_start = (timing.v_lines_rnd + timing.v_front_porch) as u16;
    let hsync_end = hsync_start + timing.h_sync as u16;
    let vsync_end = vsync_start + timing.v_sync as u16;

    let mode = drm_mode_modeinfo {
        clock: f64::round(timing.act_pixel_freq * 1000f64) as u32,

        hdisplay: width,
        hsync_start,
        hsync_end,
        htotal: hsync_end + timing.h_back_porch as u16,

        vdisplay: timing.v_lines_rnd as u16,
        vsync_start,
        vsync_end,
        vtotal: vsync_end + timing.v_back_porch as u16,

        vrefresh: f64::round(timing.act_frame_rate) as u32,

        flags: drm_ffi::DRM_MODE_FLAG_NHSYNC | drm_ffi::DRM_MODE_FLAG_PVSYNC,
        type_: drm_ffi::DRM_MODE_TYPE_USERDEF,
        name: modeinfo_name_slice(&format!("{width}x{height}")),

        // Defaults
        hskew: 0,
        vscan: 0,
    };

    control::Mode::from(mode)
}

/// Convert a string to a mode name slice (max 31 chars + null terminator).
fn modeinfo_name_slice(mode_name: &str) -> [core::ffi::c_char; 32] {
    let mut name: [core::ffi::c_char; 32] = [0; 32];

    for (a, b) in zip(&mut name[..31], mode_name.as_bytes()) {
        // Can be u8 on aarch64 and i8 on x86_64.
        *a = *b as _;
    }

    name
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use super::*;

    fn mode_from_timings(
        clock: u32,
        hdisplay: u16,
        hsync: (u16, u16, u16),
        vdisplay: u16,
        vsync: (u16, u16, u16),
        flags: u32,
        vscan: u16,
    ) -> control::Mode {
        control::Mode::from(drm_mode_modeinfo {
            clock,
            hdisplay,
            hsync_start: hsync.0,
            hsync_end: hsync.1,
            htotal: hsync.2,
            hskew: 0,
            vdisplay,
            vsync_start: vsync.0,
            vsync_end: vsync.1,
            vtotal: vsync.2,
            vscan,
            vrefresh: 0,
            flags,
            type_: 0,
            name: [0; 32],
        })
    }

    #[test]
    fn refresh_cea_1080p60() {
        // 1920x1080@60 CEA: 148.5 MHz, 2200x1125 total.
        let mode = mode_from_timings(148500, 1920, (2008, 2052, 2200), 1080, (1084, 1089, 1125), 0, 0);
        assert_eq!(calculate_refresh_millihz(&mode), 60000);
    }

    #[test]
    fn refresh_interlace_doubles() {
        let mode = mode_from_timings(
            74250,
            1920,
            (2008, 2052, 2200),
            1080,
            (1084, 1094, 1125),
            drm_ffi::DRM_MODE_FLAG_INTERLACE,
            0,
        );
        assert_eq!(calculate_refresh_millihz(&mode), 60000);
    }

    #[test]
    fn refresh_doublescan_halves() {
        let mode = mode_from_timings(
            12600,
            320,
            (328, 376, 400),
            240,
            (243, 246, 525),
            drm_ffi::DRM_MODE_FLAG_DBLSCAN,
            0,
        );
        assert_eq!(calculate_refresh_millihz(&mode), 30000);
    }

    #[test]
    fn refresh_vscan_divides() {
        let mode = mode_from_timings(148500, 1920, (2008, 2052, 2200), 1080, (1084, 1089, 1125), 0, 2);
        assert_eq!(calculate_refresh_millihz(&mode), 30000);
    }

    #[test]
    fn refresh_roundtrip() {
        // refresh * htotal * vtotal stays within rounding of clock * 10^6.
        let mode = mode_from_timings(148500, 1920, (2008, 2052, 2200), 1080, (1084, 1089, 1125), 0, 0);
        let refresh = calculate_refresh_millihz(&mode) as i64;
        let clock_hz = mode.clock() as i64 * 1_000_000;
        let product = refresh * mode.hsync().2 as i64 * mode.vsync().2 as i64;
        assert!((product - clock_hz).abs() <= clock_hz / 1000);
    }

    #[test]
    fn refresh_interval_from_millihz() {
        assert_eq!(refresh_interval_ns(60000), 16_666_666);
        assert_eq!(refresh_interval_ns(0), 0);
    }

    #[test]
    fn test_calc_cvt() {
        // Crosschecked with other calculators like the cvt commandline utility.
        assert_debug_snapshot!(calculate_mode_cvt(1920, 1080, 60_000), @"Mode {
    name: \"1920x1080\",
    clock: 173000,
    size: (
        1920,
        1080,
    ),
    hsync: (
        2048,
        2248,
        2576,
    ),
    vsync: (
        1083,
        1088,
        1120,
    ),
    hskew: 0,
    vscan: 0,
    vrefresh: 60,
    mode_type: ModeTypeFlags(
        USERDEF,
    ),
}");
        assert_debug_snapshot!(calculate_mode_cvt(1920, 1080, 144_000), @"Mode {
    name: \"1920x1080\",
    clock: 452500,
    size: (
        1920,
        1080,
    ),
    hsync: (
        2088,
        2296,
        2672,
    ),
    vsync: (
        1083,
        1088,
        1177,
    ),
    hskew: 0,
    vscan: 0,
    vrefresh: 144,
    mode_type: ModeTypeFlags(
        USERDEF,
    ),
}");
    }

    #[test]
    fn cvt_defaults_to_60hz() {
        let with_rate = calculate_mode_cvt(1920, 1080, 60_000);
        let without_rate = calculate_mode_cvt(1920, 1080, 0);
        assert!(modes_equal(&with_rate, &without_rate));
    }

    #[test]
    fn mode_equality_ignores_name() {
        let a = calculate_mode_cvt(1280, 720, 60_000);
        let b = calculate_mode_cvt(1280, 720, 60_000);
        let c = calculate_mode_cvt(1280, 720, 144_000);
        assert!(modes_equal(&a, &b));
        assert!(!modes_equal(&a, &c));
    }
}

//! Plane model and scanout format negotiation.

use std::rc::Rc;

use anyhow::{ensure, Context, Result};
use drm::buffer::{DrmFourcc, DrmModifier};
use drm::control::{plane, Device as ControlDevice, PlaneType, ResourceHandles};
use drm_ffi::{drm_format_modifier, drm_format_modifier_blob};
use tracing::{debug, trace, warn};

use crate::format::DrmFormat;
use crate::session::DrmDeviceFd;

use super::fb::DrmFramebuffer;
use super::helpers::find_drm_property;

const FORMAT_BLOB_VERSION: u32 = 1;

/// A layer a CRTC composes into its signal.
pub(super) struct Plane {
    pub handle: plane::Handle,
    pub kind: PlaneType,
    /// Bitmask over the backend's CRTC table indices.
    pub possible_crtcs: u32,
    /// Authoritative set of scanout-capable format/modifier combinations.
    pub formats: Vec<DrmFormat>,
    /// CRTC this plane is bound to (backend CRTC table index).
    pub crtc: Option<usize>,
    /// Last committed scanout buffer.
    pub front: Option<Rc<DrmFramebuffer>>,
    /// Its predecessor, kept for release tracking.
    pub back: Option<Rc<DrmFramebuffer>>,
}

impl Plane {
    pub fn query(
        device: &DrmDeviceFd,
        handle: plane::Handle,
        resources: &ResourceHandles,
        supports_addfb2_modifiers: bool,
    ) -> Result<Self> {
        let info = device
            .get_plane(handle)
            .with_context(|| format!("error getting plane {handle:?}"))?;

        let (_, _, type_value) = find_drm_property(device, handle, "type")
            .context("plane has no type property")?;
        let kind = match type_value {
            v if v == PlaneType::Primary as u64 => PlaneType::Primary,
            v if v == PlaneType::Cursor as u64 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        };

        debug!("plane {handle:?} has type {kind:?}");

        let mut possible_crtcs = 0u32;
        for crtc in resources.filter_crtcs(info.possible_crtcs()) {
            if let Some(i) = resources.crtcs().iter().position(|&c| c == crtc) {
                possible_crtcs |= 1 << i;
            }
        }

        // Seed from the flat format list; the IN_FORMATS blob refines it
        // below when the device can express modifiers.
        debug!("plane {handle:?} has {} formats", info.formats().len());
        let mut formats = Vec::new();
        for &raw in info.formats() {
            let Ok(code) = DrmFourcc::try_from(raw) else {
                trace!("| skipping unknown format {raw:#x}");
                continue;
            };

            trace!("| format {code:?}");

            if kind == PlaneType::Cursor {
                formats.push(DrmFormat::new(code, [DrmModifier::Linear]));
            } else {
                formats.push(DrmFormat::new(
                    code,
                    [DrmModifier::Linear, DrmModifier::Invalid],
                ));
            }
        }

        if supports_addfb2_modifiers {
            if let Some((_, _, blob_id)) = find_drm_property(device, handle, "IN_FORMATS") {
                debug!("plane {handle:?}: checking for modifiers");
                let data = device
                    .get_property_blob(blob_id)
                    .context("error reading IN_FORMATS blob")?;
                merge_in_formats(&mut formats, &data)?;
            }
        }

        Ok(Self {
            handle,
            kind,
            possible_crtcs,
            formats,
            crtc: None,
            front: None,
            back: None,
        })
    }
}

/// Fold the (format, modifier) pairs of an IN_FORMATS blob into the seeded
/// format list: modifiers of known formats are appended, unknown formats
/// get a fresh entry.
fn merge_in_formats(formats: &mut Vec<DrmFormat>, data: &[u8]) -> Result<()> {
    ensure!(
        data.len() >= std::mem::size_of::<drm_format_modifier_blob>(),
        "IN_FORMATS blob too short"
    );

    let header = unsafe { (data.as_ptr() as *const drm_format_modifier_blob).read_unaligned() };
    ensure!(
        header.version == FORMAT_BLOB_VERSION,
        "IN_FORMATS blob has unknown version {}",
        header.version
    );

    let formats_end =
        header.formats_offset as usize + header.count_formats as usize * std::mem::size_of::<u32>();
    let modifiers_end = header.modifiers_offset as usize
        + header.count_modifiers as usize * std::mem::size_of::<drm_format_modifier>();
    ensure!(
        formats_end <= data.len() && modifiers_end <= data.len(),
        "IN_FORMATS blob contents out of bounds"
    );

    let format_at = |idx: usize| unsafe {
        (data.as_ptr().add(header.formats_offset as usize) as *const u32)
            .add(idx)
            .read_unaligned()
    };

    for i in 0..header.count_modifiers as usize {
        let entry = unsafe {
            (data.as_ptr().add(header.modifiers_offset as usize) as *const drm_format_modifier)
                .add(i)
                .read_unaligned()
        };
        let modifier = DrmModifier::from(entry.modifier);

        for bit in 0..64usize {
            if entry.formats & (1u64 << bit) == 0 {
                continue;
            }

            let idx = entry.offset as usize + bit;
            if idx >= header.count_formats as usize {
                warn!("IN_FORMATS modifier entry indexes past the format list");
                break;
            }

            let raw = format_at(idx);
            let Ok(code) = DrmFourcc::try_from(raw) else {
                continue;
            };

            trace!("| modifier {modifier:?} with format {code:?}");

            match formats.iter_mut().find(|f| f.code == code) {
                Some(format) => {
                    if !format.modifiers.contains(&modifier) {
                        format.modifiers.push(modifier);
                    }
                }
                None => formats.push(DrmFormat::new(code, [modifier])),
            }
        }
    }

    Ok(())
}

/// Bind each plane to the lowest-indexed CRTC its possible-crtcs mask
/// permits that does not have a plane of that role yet. Overlay planes
/// keep no role. Returns `(plane index, crtc index)` pairs.
pub(super) fn assign_plane_roles(planes: &[(PlaneType, u32)], crtc_count: usize) -> Vec<(usize, usize)> {
    let mut primary_taken = vec![false; crtc_count];
    let mut cursor_taken = vec![false; crtc_count];
    let mut assignments = Vec::new();

    for (pi, &(kind, mask)) in planes.iter().enumerate() {
        let taken = match kind {
            PlaneType::Primary => &mut primary_taken,
            PlaneType::Cursor => &mut cursor_taken,
            PlaneType::Overlay => continue,
        };

        for ci in 0..crtc_count {
            if mask & (1 << ci) == 0 || taken[ci] {
                continue;
            }

            taken[ci] = true;
            assignments.push((pi, ci));
            break;
        }
    }

    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_fill_every_reachable_crtc() {
        let planes = [
            (PlaneType::Primary, 0b11),
            (PlaneType::Primary, 0b11),
            (PlaneType::Cursor, 0b11),
            (PlaneType::Cursor, 0b10),
            (PlaneType::Overlay, 0b11),
        ];

        let assignments = assign_plane_roles(&planes, 2);
        assert_eq!(assignments, vec![(0, 0), (1, 1), (2, 0), (3, 1)]);
    }

    #[test]
    fn roles_skip_unreachable_crtcs() {
        let planes = [(PlaneType::Primary, 0b10), (PlaneType::Cursor, 0b00)];

        let assignments = assign_plane_roles(&planes, 2);
        assert_eq!(assignments, vec![(0, 1)]);
    }

    fn blob(formats: &[u32], modifiers: &[(u64, u32, u64)]) -> Vec<u8> {
        let header_size = std::mem::size_of::<drm_format_modifier_blob>();
        let formats_offset = header_size;
        let modifiers_offset = formats_offset + formats.len() * 4;

        let mut data = Vec::new();
        data.extend_from_slice(&FORMAT_BLOB_VERSION.to_ne_bytes());
        data.extend_from_slice(&0u32.to_ne_bytes());
        data.extend_from_slice(&(formats.len() as u32).to_ne_bytes());
        data.extend_from_slice(&(formats_offset as u32).to_ne_bytes());
        data.extend_from_slice(&(modifiers.len() as u32).to_ne_bytes());
        data.extend_from_slice(&(modifiers_offset as u32).to_ne_bytes());

        for format in formats {
            data.extend_from_slice(&format.to_ne_bytes());
        }

        for &(format_mask, offset, modifier) in modifiers {
            data.extend_from_slice(&format_mask.to_ne_bytes());
            data.extend_from_slice(&offset.to_ne_bytes());
            data.extend_from_slice(&0u32.to_ne_bytes());
            data.extend_from_slice(&modifier.to_ne_bytes());
        }

        data
    }

    #[test]
    fn in_formats_extends_known_and_adds_new() {
        let x_tiled = u64::from(DrmModifier::I915_x_tiled);
        let data = blob(
            &[DrmFourcc::Xrgb8888 as u32, DrmFourcc::Argb8888 as u32],
            &[(0b11, 0, x_tiled)],
        );

        let mut formats = vec![DrmFormat::new(
            DrmFourcc::Xrgb8888,
            [DrmModifier::Linear, DrmModifier::Invalid],
        )];
        merge_in_formats(&mut formats, &data).unwrap();

        assert_eq!(formats.len(), 2);
        assert_eq!(
            formats[0].modifiers,
            vec![
                DrmModifier::Linear,
                DrmModifier::Invalid,
                DrmModifier::I915_x_tiled,
            ],
        );
        assert_eq!(formats[1].code, DrmFourcc::Argb8888);
        assert_eq!(formats[1].modifiers, vec![DrmModifier::I915_x_tiled]);
    }

    #[test]
    fn in_formats_rejects_truncated_blobs() {
        let mut formats = Vec::new();
        assert!(merge_in_formats(&mut formats, &[0u8; 4]).is_err());
    }
}

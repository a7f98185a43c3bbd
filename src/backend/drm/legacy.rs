//! Legacy (non-atomic) KMS commit implementation.

use anyhow::{Context, Result};
use drm::control::{Device as ControlDevice, PageFlipFlags};
use tracing::{debug, trace};

use crate::session::DrmDeviceFd;

use super::connector::Connector;
use super::types::{CommitData, Crtc};

/// Low-level commit execution.
///
/// The engine validates, classifies and sequences; implementations
/// translate one [`CommitData`] into kernel calls. `commit` reports
/// whether an evented page flip was queued so the engine can track the
/// in-flight flip. The atomic API fits behind the same two calls.
pub(super) trait KmsImpl {
    fn commit(
        &self,
        device: &DrmDeviceFd,
        connector: &Connector,
        crtc: &Crtc,
        data: &CommitData,
    ) -> Result<bool>;

    fn reset(&self, device: &DrmDeviceFd, crtc: &Crtc) -> Result<()>;
}

pub(super) struct LegacyImpl;

impl KmsImpl for LegacyImpl {
    fn commit(
        &self,
        device: &DrmDeviceFd,
        connector: &Connector,
        crtc: &Crtc,
        data: &CommitData,
    ) -> Result<bool> {
        // The legacy API cannot test a configuration without applying it;
        // validation already ran, so a dry run reports success.
        if data.test {
            return Ok(false);
        }

        let fb = data.main_fb.as_ref().and_then(|fb| fb.id());

        if data.modeset {
            if data.enable {
                let mode = data.mode_info.context("modeset committed without a mode")?;
                trace!(
                    "setting crtc {:?} on connector {} with fb {:?}",
                    crtc.handle,
                    connector.name,
                    fb,
                );
                device
                    .set_crtc(crtc.handle, fb, (0, 0), &[connector.handle], Some(mode))
                    .context("error setting crtc")?;
            } else {
                trace!("disabling crtc {:?}", crtc.handle);
                device
                    .set_crtc(crtc.handle, None, (0, 0), &[], None)
                    .context("error disabling crtc")?;
            }
        }

        if let Some(enabled) = data.vrr {
            if let Some(prop) = crtc.props.vrr_enabled {
                device
                    .set_property(crtc.handle, prop, enabled as u64)
                    .context("error setting VRR_ENABLED")?;
                debug!("crtc {:?} VRR -> {enabled}", crtc.handle);
            }
        }

        // Blocking commits complete here; only non-blocking buffer
        // commits ride a flip event.
        if data.blocking || !data.flags.contains(PageFlipFlags::EVENT) {
            return Ok(false);
        }

        let fb = fb.context("page flip committed without a buffer")?;
        device
            .page_flip(crtc.handle, fb, data.flags, None)
            .context("error queueing page flip")?;

        Ok(true)
    }

    fn reset(&self, device: &DrmDeviceFd, crtc: &Crtc) -> Result<()> {
        device
            .set_crtc(crtc.handle, None, (0, 0), &[], None)
            .context("error resetting crtc")
    }
}

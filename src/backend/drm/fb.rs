//! DMA-BUF to KMS framebuffer import.

use std::cell::Cell;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::rc::Rc;

use drm::buffer::{self, DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::{framebuffer, Device as ControlDevice, FbCmd2Flags};
use drm::Device;
use tracing::{error, trace};

use crate::buffer::{Buffer, DmabufAttributes};
use crate::session::DrmDeviceFd;

/// A KMS framebuffer imported from a client buffer.
///
/// Keeps the source buffer alive for as long as the kernel may scan out
/// from it. The GEM handles acquired during import are deliberately left
/// open: some drivers tear down the framebuffer when the last handle on
/// the underlying object closes, even while the fb id is still in use.
pub(super) struct DrmFramebuffer {
    device: DrmDeviceFd,
    id: Cell<Option<framebuffer::Handle>>,
    pub buffer: Rc<dyn Buffer>,
    handles: [Option<buffer::Handle>; 4],
    handles_closed: Cell<bool>,
}

/// Which framebuffer-creation path a buffer's modifier allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitStrategy {
    WithModifiers,
    Plain,
    Refuse,
}

fn submit_strategy(supports_addfb2_modifiers: bool, modifier: DrmModifier) -> SubmitStrategy {
    if supports_addfb2_modifiers && modifier != DrmModifier::Invalid {
        SubmitStrategy::WithModifiers
    } else if modifier != DrmModifier::Invalid && modifier != DrmModifier::Linear {
        // Without ADDFB2_MODIFIERS there is no way to express an explicit
        // modifier to the kernel.
        SubmitStrategy::Refuse
    } else {
        SubmitStrategy::Plain
    }
}

/// Adapter feeding [`DmabufAttributes`] plus the imported GEM handles to
/// the framebuffer-creation ioctl.
struct ImportFrame<'a> {
    attrs: &'a DmabufAttributes,
    handles: &'a [Option<buffer::Handle>; 4],
    with_modifier: bool,
}

impl PlanarBuffer for ImportFrame<'_> {
    fn size(&self) -> (u32, u32) {
        self.attrs.size
    }

    fn format(&self) -> DrmFourcc {
        self.attrs.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        self.with_modifier.then_some(self.attrs.modifier)
    }

    fn pitches(&self) -> [u32; 4] {
        self.attrs.strides
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        *self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.attrs.offsets
    }
}

impl DrmFramebuffer {
    /// Import a buffer into KMS. Returns `None` when the buffer has no
    /// dmabuf, was previously refused, or the kernel rejects it; in the
    /// last case the buffer is marked unimportable so the next commit
    /// fails fast.
    pub fn create(
        device: &DrmDeviceFd,
        buffer: Rc<dyn Buffer>,
        supports_addfb2_modifiers: bool,
    ) -> Option<Rc<Self>> {
        let Some(attrs) = buffer.dmabuf() else {
            error!("buffer submitted for scanout has no dmabuf");
            return None;
        };

        if buffer.is_kms_unimportable() {
            error!("buffer submitted for scanout is unimportable");
            return None;
        }

        let mut handles = [None; 4];
        for (i, fd) in attrs.fds.iter().take(attrs.planes).enumerate() {
            match device.prime_fd_to_buffer(fd.as_fd()) {
                Ok(handle) => {
                    trace!(
                        "plane {i} with fd {} got handle {}",
                        fd.as_raw_fd(),
                        u32::from(handle),
                    );
                    handles[i] = Some(handle);
                }
                Err(err) => {
                    error!("prime fd to handle conversion failed: {err:?}");
                    return None;
                }
            }
        }

        let id = match submit(device, attrs, &handles, supports_addfb2_modifiers) {
            Ok(id) => id,
            Err(err) => {
                error!("failed to submit a buffer to KMS: {err:?}");
                buffer.mark_kms_unimportable();
                return None;
            }
        };

        trace!("new framebuffer {}", u32::from(id));

        Some(Rc::new(Self {
            device: device.clone(),
            id: Cell::new(Some(id)),
            buffer,
            handles,
            handles_closed: Cell::new(false),
        }))
    }

    pub fn id(&self) -> Option<framebuffer::Handle> {
        self.id.get()
    }

    /// Close the kernel framebuffer. Idempotent; also runs on drop.
    pub fn close(&self) {
        let Some(id) = self.id.take() else {
            return;
        };

        trace!("dropping framebuffer {}", u32::from(id));

        match close_fb(self.device.as_fd(), id) {
            Ok(()) => (),
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                // Kernels without the close ioctl want the remove one.
                if let Err(err) = self.device.destroy_framebuffer(id) {
                    error!("failed to remove framebuffer: {err:?}");
                }
            }
            Err(err) => error!("failed to close framebuffer: {err:?}"),
        }
    }

    /// Close the GEM handles acquired at import.
    ///
    /// Never called on the normal path: closing the last handle on a GEM
    /// object invalidates the front framebuffer on some drivers while its
    /// id is still being scanned out.
    #[allow(dead_code)]
    pub fn close_handles(&self) {
        if self.handles_closed.replace(true) {
            return;
        }

        for handle in self.handles.into_iter().flatten() {
            if let Err(err) = drm_ffi::gem::close(self.device.as_fd(), u32::from(handle)) {
                error!("failed to close a GEM handle: {err:?}");
            }
        }
    }

    #[cfg(test)]
    pub fn stub(device: DrmDeviceFd, buffer: Rc<dyn Buffer>) -> Rc<Self> {
        Rc::new(Self {
            device,
            id: Cell::new(None),
            buffer,
            handles: [None; 4],
            handles_closed: Cell::new(false),
        })
    }
}

impl Drop for DrmFramebuffer {
    fn drop(&mut self) {
        self.close();
    }
}

fn submit(
    device: &DrmDeviceFd,
    attrs: &DmabufAttributes,
    handles: &[Option<buffer::Handle>; 4],
    supports_addfb2_modifiers: bool,
) -> anyhow::Result<framebuffer::Handle> {
    match submit_strategy(supports_addfb2_modifiers, attrs.modifier) {
        SubmitStrategy::WithModifiers => {
            trace!(
                "importing {}x{} buffer with format {:?} and modifier {:?}",
                attrs.size.0,
                attrs.size.1,
                attrs.format,
                attrs.modifier,
            );
            let frame = ImportFrame {
                attrs,
                handles,
                with_modifier: true,
            };
            Ok(device.add_planar_framebuffer(&frame, FbCmd2Flags::MODIFIERS)?)
        }
        SubmitStrategy::Plain => {
            trace!(
                "importing {}x{} buffer with format {:?} without modifiers",
                attrs.size.0,
                attrs.size.1,
                attrs.format,
            );
            let frame = ImportFrame {
                attrs,
                handles,
                with_modifier: false,
            };
            Ok(device.add_planar_framebuffer(&frame, FbCmd2Flags::empty())?)
        }
        SubmitStrategy::Refuse => anyhow::bail!(
            "buffer has explicit modifier {:?} but the device cannot express modifiers",
            attrs.modifier,
        ),
    }
}

#[repr(C)]
struct DrmModeClosefb {
    fb_id: u32,
    pad: u32,
}

// _IOWR('d', 0xD0, struct drm_mode_closefb)
const DRM_IOCTL_MODE_CLOSEFB: libc::c_ulong = 0xc008_64d0;

fn close_fb(fd: BorrowedFd<'_>, id: framebuffer::Handle) -> std::io::Result<()> {
    let mut arg = DrmModeClosefb {
        fb_id: u32::from(id),
        pad: 0,
    };

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), DRM_IOCTL_MODE_CLOSEFB, &mut arg) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

//! Session/seat collaborator interface.
//!
//! The privileged open/close dance, VT switching and device pause/resume
//! live in the session layer (libseat or similar). The backend consumes
//! this trait during device discovery and expects the host to forward
//! activity changes via
//! [`notify_session_active`](crate::backend::drm::DrmBackend::notify_session_active).

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// The session/seat layer the backend opens GPUs through.
pub trait Session {
    /// Whether the session currently holds the seat (i.e. is not switched
    /// away to another VT).
    fn is_active(&self) -> bool;

    /// The seat this session controls, e.g. `seat0`.
    fn seat_name(&self) -> &str;

    /// Open a device node with seat privileges.
    fn open(&mut self, path: &Path) -> anyhow::Result<OwnedFd>;

    /// Pump pending session events (activity changes, device pauses).
    fn dispatch_pending_events(&mut self) -> anyhow::Result<()>;
}

/// Cheaply cloneable DRM device handle.
///
/// Wraps the fd obtained from the session and carries the drm-rs device
/// traits so every subsystem can issue ioctls through it. The fd is closed
/// when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Rc<DeviceInner>);

#[derive(Debug)]
struct DeviceInner {
    fd: OwnedFd,
    path: PathBuf,
}

impl DrmDeviceFd {
    pub fn new(fd: OwnedFd, path: PathBuf) -> Self {
        Self(Rc::new(DeviceInner { fd, path }))
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }
}

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl drm::Device for DrmDeviceFd {}
impl drm::control::Device for DrmDeviceFd {}

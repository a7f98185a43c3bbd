//! Buffer collaborator interface.
//!
//! Allocation and swapchains live outside this crate. The backend only
//! needs to query a buffer's DMA-BUF attributes for KMS import, and to tag
//! buffers the kernel refused so later commits fail fast instead of
//! retrying the import.

use std::os::fd::OwnedFd;

use drm::buffer::{DrmFourcc, DrmModifier};

/// DMA-BUF attributes of a buffer, as produced by the allocator.
#[derive(Debug)]
pub struct DmabufAttributes {
    /// Pixel size of the buffer.
    pub size: (u32, u32),
    pub format: DrmFourcc,
    pub modifier: DrmModifier,
    /// Number of memory planes; the arrays below are valid up to this count.
    pub planes: usize,
    pub fds: Vec<OwnedFd>,
    pub strides: [u32; 4],
    pub offsets: [u32; 4],
}

/// A pixel buffer submitted for scanout.
///
/// Implementors are single-threaded reference-counted objects; the
/// unimportable mark needs interior mutability (a `Cell<bool>` is enough).
pub trait Buffer {
    /// The buffer's DMA-BUF attributes, or `None` if it has no dmabuf
    /// backing.
    fn dmabuf(&self) -> Option<&DmabufAttributes>;

    /// Whether a previous KMS import of this buffer failed.
    fn is_kms_unimportable(&self) -> bool;

    /// Remember that KMS refused this buffer, so commits skip the retry.
    fn mark_kms_unimportable(&self);
}

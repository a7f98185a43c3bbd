//! Display backend abstraction for Wayland compositors.
//!
//! lagoon discovers graphics hardware through a session/seat layer, models
//! the kernel's mode-setting resources (CRTCs, planes, connectors), imports
//! client buffers as scanout framebuffers and commits per-output state with
//! correct page-flip sequencing.
//!
//! The crate does not own an event loop. Hosts register the fd returned by
//! [`backend::drm::DrmBackend::poll_fd`] with their loop, call
//! [`backend::drm::DrmBackend::dispatch_events`] when it becomes readable,
//! and drain notifications with [`backend::drm::DrmBackend::poll_event`].

pub mod backend;
pub mod buffer;
pub mod format;
pub mod output;
pub mod session;

//! Output state validation and the commit engine.
//!
//! Commits route through [`DrmBackend::commit_state`]: validate the
//! pending state, classify the transition, acquire a framebuffer, hand a
//! [`CommitData`] to the low-level implementation and do the bookkeeping
//! on success.

use std::rc::Rc;

use drm::control::PageFlipFlags;
use tracing::{debug, error, trace};

use crate::backend::BackendEvent;
use crate::buffer::Buffer;
use crate::output::{OutputId, PresentationMode, StateFields};

use super::fb::DrmFramebuffer;
use super::helpers::{calculate_mode_cvt, calculate_refresh_millihz};
use super::types::{CommitData, FlipState};
use super::DrmBackend;

/// Enabling, changing format or changing mode forces a full reconfigure,
/// i.e. a modeset.
pub(super) fn needs_reconfig(committed: StateFields) -> bool {
    committed.intersects(StateFields::ENABLED | StateFields::FORMAT | StateFields::MODE)
}

/// Reconfigures and buffer-less state changes complete synchronously;
/// only plain buffer commits ride an asynchronous page flip.
pub(super) fn is_blocking(committed: StateFields) -> bool {
    needs_reconfig(committed) || !committed.contains(StateFields::BUFFER)
}

impl DrmBackend {
    /// Apply the output's pending state. Refusals and failures are logged
    /// and return false.
    pub fn commit(&mut self, id: OutputId) -> bool {
        self.commit_state(id, false)
    }

    /// Validate the output's pending state without applying it.
    pub fn test(&mut self, id: OutputId) -> bool {
        self.commit_state(id, true)
    }

    fn commit_state(&mut self, id: OutputId, only_test: bool) -> bool {
        if self.gpu_removed {
            error!("device is gone, commit refused");
            return false;
        }

        if !self.session_active {
            error!("session inactive, commit refused");
            return false;
        }

        let Some(idx) = self.connector_index(id) else {
            error!("commit for unknown output {id:?}");
            return false;
        };

        let Some(crtc_idx) = self.connectors[idx].crtc else {
            error!("no CRTC attached to output {}", self.connectors[idx].name);
            return false;
        };

        let Some(output) = &self.connectors[idx].output else {
            error!(
                "commit on disconnected output {}",
                self.connectors[idx].name
            );
            return false;
        };

        let committed = output.state.committed();

        if committed.contains(StateFields::ENABLED)
            && output.state.enabled()
            && output.state.mode().is_none()
            && output.state.custom_mode().is_none()
        {
            error!("no mode on enable commit");
            return false;
        }

        if output.state.adaptive_sync() && !self.connectors[idx].vrr_capable {
            error!(
                "no adaptive sync support on output {}",
                self.connectors[idx].name
            );
            return false;
        }

        if output.state.presentation_mode() == PresentationMode::Immediate
            && !self.caps.supports_async_commit
        {
            error!("no immediate presentation support in the backend");
            return false;
        }

        if committed.contains(StateFields::BUFFER) && output.state.buffer().is_none() {
            error!("no buffer committed");
            return false;
        }

        let reconfig = needs_reconfig(committed);
        let blocking = is_blocking(committed);
        let mode = output.current_mode();

        let mut flags = PageFlipFlags::empty();
        if !only_test {
            if reconfig {
                if output.state.enabled() {
                    if let Some(mode) = &mode {
                        debug!(
                            "modesetting {} with {}x{}@{:.2}Hz",
                            self.connectors[idx].name,
                            mode.pixel_size.0,
                            mode.pixel_size.1,
                            mode.refresh_millihz as f64 / 1000.0,
                        );
                    }
                } else {
                    debug!("disabling output {}", self.connectors[idx].name);
                }
            }

            if !blocking && self.connectors[idx].flip_state == FlipState::FlipPending {
                error!("cannot commit when a page flip is awaiting");
                return false;
            }

            if output.state.enabled() {
                flags |= PageFlipFlags::EVENT;
            }
            if output.state.presentation_mode() == PresentationMode::Immediate {
                flags |= PageFlipFlags::ASYNC;
            }
        }

        let mut main_fb = None;
        if committed.contains(StateFields::BUFFER) {
            trace!("buffer committed, updating state");

            let buffer = output.state.buffer().unwrap().clone();
            main_fb = self.find_or_import_fb(crtc_idx, &buffer);
            if main_fb.is_none() {
                error!("buffer failed to import into KMS");
                return false;
            }
        }

        let mode_info = mode.map(|m| {
            m.info.unwrap_or_else(|| {
                calculate_mode_cvt(m.pixel_size.0, m.pixel_size.1, m.refresh_millihz)
            })
        });

        let data = CommitData {
            main_fb,
            cursor_fb: self.connectors[idx].pending_cursor_fb.clone(),
            mode_info,
            flags,
            modeset: reconfig,
            blocking,
            test: only_test,
            enable: output.state.enabled(),
            vrr: committed
                .contains(StateFields::ADAPTIVE_SYNC)
                .then(|| output.state.adaptive_sync()),
        };

        let ok = self.execute_commit(idx, crtc_idx, committed, data);

        self.events.push_back(BackendEvent::Commit(id));
        if let Some(output) = &mut self.connectors[idx].output {
            output.state.finish_commit();
        }

        ok
    }

    /// Reuse the framebuffer already sitting on the CRTC's primary plane
    /// when the committed buffer matches; import otherwise.
    fn find_or_import_fb(
        &self,
        crtc_idx: usize,
        buffer: &Rc<dyn Buffer>,
    ) -> Option<Rc<DrmFramebuffer>> {
        if let Some(pi) = self.crtcs[crtc_idx].primary {
            let plane = &self.planes[pi];

            if let Some(fb) = &plane.back {
                if Rc::ptr_eq(&fb.buffer, buffer) {
                    trace!("crtc's back buffer matches committed");
                    return Some(fb.clone());
                }
            }
            if let Some(fb) = &plane.front {
                if Rc::ptr_eq(&fb.buffer, buffer) {
                    trace!("crtc's front buffer matches committed");
                    return Some(fb.clone());
                }
            }
        }

        DrmFramebuffer::create(
            &self.device,
            buffer.clone(),
            self.caps.supports_addfb2_modifiers,
        )
    }

    fn execute_commit(
        &mut self,
        idx: usize,
        crtc_idx: usize,
        committed: StateFields,
        data: CommitData,
    ) -> bool {
        let result = self.imp.commit(
            &self.device,
            &self.connectors[idx],
            &self.crtcs[crtc_idx],
            &data,
        );

        match result {
            Ok(flip_queued) => {
                if !data.test {
                    self.apply_commit(idx, crtc_idx, committed, &data);
                    if flip_queued {
                        self.connectors[idx].flip_state = FlipState::FlipPending;
                    }
                }
                true
            }
            Err(err) => {
                error!("commit failed on {}: {err:?}", self.connectors[idx].name);
                self.rollback_commit(&data);
                false
            }
        }
    }

    /// Rotate the plane references: the committed framebuffer becomes
    /// front, the old front becomes back, the displaced back drops its
    /// table reference.
    fn apply_commit(
        &mut self,
        idx: usize,
        crtc_idx: usize,
        committed: StateFields,
        data: &CommitData,
    ) {
        let (primary, cursor) = (self.crtcs[crtc_idx].primary, self.crtcs[crtc_idx].cursor);

        if let Some(pi) = primary {
            let plane = &mut self.planes[pi];
            plane.back = plane.front.take();
            plane.front = data.main_fb.clone();
        }

        if let Some(pi) = cursor {
            let plane = &mut self.planes[pi];
            plane.back = plane.front.take();
            plane.front = data.cursor_fb.clone();
        }

        self.connectors[idx].pending_cursor_fb = None;

        if committed.contains(StateFields::MODE) {
            if let Some(info) = &data.mode_info {
                self.crtcs[crtc_idx].refresh_millihz = calculate_refresh_millihz(info);
            }
        }
    }

    /// Nothing to undo: framebuffers imported for a failed attempt are
    /// released through normal reference management.
    fn rollback_commit(&mut self, _data: &CommitData) {}
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::num::NonZeroU32;
    use std::time::Duration;

    use anyhow::Result;
    use drm::control::{connector, crtc, plane, PlaneType};

    use crate::buffer::DmabufAttributes;
    use crate::output::{Output, OutputMode};
    use crate::session::DrmDeviceFd;

    use super::super::connector::Connector;
    use super::super::legacy::KmsImpl;
    use super::super::plane::Plane;
    use super::super::types::Crtc;
    use super::*;

    struct TestBuffer;

    impl Buffer for TestBuffer {
        fn dmabuf(&self) -> Option<&DmabufAttributes> {
            None
        }

        fn is_kms_unimportable(&self) -> bool {
            false
        }

        fn mark_kms_unimportable(&self) {}
    }

    struct RecordingImpl {
        commits: Rc<Cell<usize>>,
    }

    impl KmsImpl for RecordingImpl {
        fn commit(
            &self,
            _device: &DrmDeviceFd,
            _connector: &Connector,
            _crtc: &Crtc,
            data: &CommitData,
        ) -> Result<bool> {
            if data.test {
                return Ok(false);
            }
            self.commits.set(self.commits.get() + 1);
            Ok(!data.blocking && data.flags.contains(PageFlipFlags::EVENT))
        }

        fn reset(&self, _device: &DrmDeviceFd, _crtc: &Crtc) -> Result<()> {
            Ok(())
        }
    }

    const ID: OutputId = OutputId(33);

    fn flip_backend() -> (DrmBackend, Rc<Cell<usize>>) {
        let mut backend = DrmBackend::test_harness();
        let commits = Rc::new(Cell::new(0));
        backend.imp = Box::new(RecordingImpl {
            commits: commits.clone(),
        });

        backend.crtcs.push(Crtc {
            handle: crtc::Handle::from(NonZeroU32::new(1).unwrap()),
            props: Default::default(),
            gamma_size: 256,
            primary: Some(0),
            cursor: None,
            refresh_millihz: 0,
        });

        backend.planes.push(Plane {
            handle: plane::Handle::from(NonZeroU32::new(10).unwrap()),
            kind: PlaneType::Primary,
            possible_crtcs: 0b1,
            formats: Vec::new(),
            crtc: Some(0),
            front: None,
            back: None,
        });

        backend.connectors.push(Connector {
            handle: connector::Handle::from(NonZeroU32::new(33).unwrap()),
            name: "DP-1".to_owned(),
            status: connector::State::Connected,
            possible_crtcs: 0b1,
            crtc: Some(0),
            fallback_mode: None,
            vrr_capable: false,
            flip_state: FlipState::Idle,
            pending_cursor_fb: None,
            output: Some(Output::new(ID, "DP-1".to_owned())),
        });

        (backend, commits)
    }

    fn full_hd() -> OutputMode {
        OutputMode {
            pixel_size: (1920, 1080),
            refresh_millihz: 60_000,
            preferred: true,
            info: None,
        }
    }

    fn drain(backend: &mut DrmBackend) -> Vec<BackendEvent> {
        std::iter::from_fn(|| backend.poll_event()).collect()
    }

    #[test]
    fn classification() {
        assert!(needs_reconfig(StateFields::MODE));
        assert!(needs_reconfig(StateFields::ENABLED | StateFields::BUFFER));
        assert!(!needs_reconfig(StateFields::BUFFER));

        assert!(is_blocking(StateFields::MODE | StateFields::BUFFER));
        assert!(is_blocking(StateFields::ADAPTIVE_SYNC));
        assert!(!is_blocking(StateFields::BUFFER));
    }

    #[test]
    fn enable_without_mode_is_refused() {
        let (mut backend, commits) = flip_backend();

        backend.output_mut(ID).unwrap().state.set_enabled(true);

        assert!(!backend.commit(ID));
        assert_eq!(commits.get(), 0);
    }

    #[test]
    fn inactive_session_refuses_commits() {
        let (mut backend, commits) = flip_backend();
        backend.session_active = false;

        assert!(!backend.commit(ID));
        assert_eq!(commits.get(), 0);
    }

    #[test]
    fn adaptive_sync_needs_vrr() {
        let (mut backend, _) = flip_backend();

        backend.output_mut(ID).unwrap().state.set_adaptive_sync(true);
        assert!(!backend.commit(ID));

        backend.connectors[0].vrr_capable = true;
        assert!(backend.commit(ID));
    }

    #[test]
    fn immediate_needs_async_cap() {
        let (mut backend, _) = flip_backend();
        backend.caps.supports_async_commit = false;

        backend
            .output_mut(ID)
            .unwrap()
            .state
            .set_presentation_mode(PresentationMode::Immediate);

        assert!(!backend.commit(ID));
    }

    #[test]
    fn mode_commit_updates_refresh() {
        let (mut backend, _) = flip_backend();

        let output = backend.output_mut(ID).unwrap();
        output.state.set_mode(full_hd());
        output.state.set_enabled(true);

        assert!(backend.commit(ID));

        // CVT-derived 1080p60 timings land a hair under the nominal rate.
        assert_eq!(backend.crtcs[0].refresh_millihz, 59_963);
        // Blocking modesets leave the connector idle.
        assert_eq!(backend.connectors[0].flip_state, FlipState::Idle);
        // The change tracking is consumed.
        assert!(backend.output(ID).unwrap().state.committed().is_empty());
        assert!(drain(&mut backend)
            .iter()
            .any(|e| matches!(e, BackendEvent::Commit(id) if *id == ID)));
    }

    #[test]
    fn test_commit_applies_nothing() {
        let (mut backend, _) = flip_backend();

        let output = backend.output_mut(ID).unwrap();
        output.state.set_mode(full_hd());
        output.state.set_enabled(true);

        assert!(backend.test(ID));
        assert_eq!(backend.crtcs[0].refresh_millihz, 0);
    }

    #[test]
    fn one_page_flip_in_flight() {
        let (mut backend, commits) = flip_backend();
        let buffer: Rc<dyn Buffer> = Rc::new(TestBuffer);

        let fb = DrmFramebuffer::stub(backend.device.clone(), buffer.clone());
        backend.planes[0].front = Some(fb);

        let output = backend.output_mut(ID).unwrap();
        output.state.set_mode(full_hd());
        output.state.set_enabled(true);
        assert!(backend.commit(ID));
        assert_eq!(backend.connectors[0].flip_state, FlipState::Idle);

        // Buffer-only commit queues a flip.
        backend.output_mut(ID).unwrap().state.set_buffer(buffer.clone());
        assert!(backend.commit(ID));
        assert_eq!(backend.connectors[0].flip_state, FlipState::FlipPending);

        // A second one must wait for the event.
        backend.output_mut(ID).unwrap().state.set_buffer(buffer.clone());
        assert!(!backend.commit(ID));
        assert_eq!(commits.get(), 2);

        backend.page_flipped(
            crtc::Handle::from(NonZeroU32::new(1).unwrap()),
            7,
            Duration::from_millis(16),
        );
        assert_eq!(backend.connectors[0].flip_state, FlipState::Idle);

        let events = drain(&mut backend);
        assert!(events
            .iter()
            .any(|e| matches!(e, BackendEvent::Present { output, .. } if *output == ID)));
        assert!(events
            .iter()
            .any(|e| matches!(e, BackendEvent::Frame(id) if *id == ID)));

        backend.output_mut(ID).unwrap().state.set_buffer(buffer);
        assert!(backend.commit(ID));
        assert_eq!(commits.get(), 3);
    }

    #[test]
    fn buffers_rotate_front_to_back() {
        let (mut backend, _) = flip_backend();

        let fb_a = DrmFramebuffer::stub(backend.device.clone(), Rc::new(TestBuffer));
        let fb_b = DrmFramebuffer::stub(backend.device.clone(), Rc::new(TestBuffer));
        backend.planes[0].back = Some(fb_a.clone());
        backend.planes[0].front = Some(fb_b.clone());

        let fb_c = DrmFramebuffer::stub(backend.device.clone(), Rc::new(TestBuffer));
        let data = CommitData {
            main_fb: Some(fb_c.clone()),
            cursor_fb: None,
            mode_info: None,
            flags: PageFlipFlags::empty(),
            modeset: false,
            blocking: false,
            test: false,
            enable: true,
            vrr: None,
        };

        assert_eq!(Rc::strong_count(&fb_a), 2);
        backend.apply_commit(0, 0, StateFields::BUFFER, &data);

        assert!(Rc::ptr_eq(backend.planes[0].front.as_ref().unwrap(), &fb_c));
        assert!(Rc::ptr_eq(backend.planes[0].back.as_ref().unwrap(), &fb_b));
        // The displaced back lost its table reference.
        assert_eq!(Rc::strong_count(&fb_a), 1);
    }

    #[test]
    fn import_failure_refuses_the_commit() {
        let (mut backend, commits) = flip_backend();

        // A buffer without dmabuf backing cannot be imported.
        backend
            .output_mut(ID)
            .unwrap()
            .state
            .set_buffer(Rc::new(TestBuffer));

        assert!(!backend.commit(ID));
        assert_eq!(commits.get(), 0);
    }

    #[test]
    fn removed_gpu_refuses_commits() {
        let (mut backend, commits) = flip_backend();

        backend.notify_gpu_removed();

        assert!(backend.output(ID).is_none());
        assert!(!backend.commit(ID));
        assert_eq!(commits.get(), 0);
        assert!(drain(&mut backend)
            .iter()
            .any(|e| matches!(e, BackendEvent::OutputDestroyed { output, .. } if *output == ID)));
    }

    #[test]
    fn frame_scheduling_respects_pending_flips() {
        let (mut backend, _) = flip_backend();

        backend.schedule_frame(ID);
        backend.dispatch_events();
        assert!(drain(&mut backend)
            .iter()
            .any(|e| matches!(e, BackendEvent::Frame(id) if *id == ID)));

        backend.connectors[0].flip_state = FlipState::FlipPending;
        backend.schedule_frame(ID);
        backend.dispatch_events();
        assert!(!drain(&mut backend)
            .iter()
            .any(|e| matches!(e, BackendEvent::Frame(_))));
    }
}

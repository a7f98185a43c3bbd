//! Pixel format descriptions shared between the backend and its consumers.

use drm::buffer::{DrmFourcc, DrmModifier};

/// A scanout-capable pixel format together with the modifiers usable with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmFormat {
    pub code: DrmFourcc,
    pub modifiers: Vec<DrmModifier>,
}

impl DrmFormat {
    pub fn new(code: DrmFourcc, modifiers: impl Into<Vec<DrmModifier>>) -> Self {
        Self {
            code,
            modifiers: modifiers.into(),
        }
    }
}
